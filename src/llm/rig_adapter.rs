//! Bridge from rig-core's `CompletionModel` to [`InferenceBackend`].

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::AssistantContent;

use crate::error::LlmError;
use crate::llm::{InferenceBackend, InferenceRequest, InferenceResponse};

/// rig-backed provider holding one completion model per configured name.
pub struct RigBackend<M> {
    provider: &'static str,
    models: HashMap<String, M>,
}

impl<M> RigBackend<M>
where
    M: CompletionModel,
{
    pub fn new(provider: &'static str, models: HashMap<String, M>) -> Self {
        Self { provider, models }
    }
}

#[async_trait]
impl<M> InferenceBackend for RigBackend<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn provider(&self) -> &str {
        self.provider
    }

    async fn complete(&self, request: InferenceRequest) -> Result<InferenceResponse, LlmError> {
        let model = self
            .models
            .get(&request.model)
            .ok_or_else(|| LlmError::ModelNotAvailable {
                provider: self.provider.to_string(),
                model: request.model.clone(),
            })?;

        let started = Instant::now();
        let call = model
            .completion_request(request.prompt.clone())
            .preamble(request.system.clone())
            .temperature(f64::from(request.temperature))
            .max_tokens(u64::from(request.max_tokens))
            .send();

        let response = tokio::time::timeout(request.timeout, call)
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.provider.to_string(),
                timeout: request.timeout,
            })?
            .map_err(|e| map_completion_error(self.provider, e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "response contained no text".to_string(),
            });
        }

        Ok(InferenceResponse {
            content,
            model: request.model,
            elapsed: started.elapsed(),
        })
    }
}

fn map_completion_error(provider: &str, err: CompletionError) -> LlmError {
    let provider = provider.to_string();
    match err {
        CompletionError::HttpError(e) => LlmError::Connection {
            provider,
            reason: e.to_string(),
        },
        CompletionError::ProviderError(message) => classify_provider_message(provider, message),
        other => LlmError::RequestFailed {
            provider,
            reason: other.to_string(),
        },
    }
}

/// Providers report throttling and outages as free text; pick out the
/// retryable cases.
fn classify_provider_message(provider: String, message: String) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else if lower.contains("overloaded") || lower.contains("503") || lower.contains("502") {
        LlmError::ServerError {
            provider,
            status: 503,
            reason: message,
        }
    } else if lower.contains("401") || lower.contains("authentication") || lower.contains("api key") {
        LlmError::AuthFailed { provider }
    } else {
        LlmError::RequestFailed {
            provider,
            reason: message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_messages_are_classified() {
        let err = classify_provider_message("anthropic".into(), "Overloaded".into());
        assert!(err.is_transient());

        let err = classify_provider_message("openai".into(), "Rate limit reached".into());
        assert!(matches!(err, LlmError::RateLimited { .. }));

        let err = classify_provider_message("openai".into(), "Invalid API key".into());
        assert!(matches!(err, LlmError::AuthFailed { .. }));

        let err = classify_provider_message("openai".into(), "context length exceeded".into());
        assert!(!err.is_transient());
    }
}
