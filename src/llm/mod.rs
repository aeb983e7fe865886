//! Inference backends for the model-backed phases.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//! - **Ollama**: Local `/api/generate` over reqwest
//!
//! Everything above this module talks to [`InferenceBackend`] only.

mod ollama;
pub mod retry;
mod rig_adapter;

pub use ollama::OllamaBackend;
pub use retry::RetryPolicy;
pub use rig_adapter::RigBackend;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::InferenceConfig;
use crate::error::{ConfigError, LlmError};

/// One completion request. The backend enforces `timeout` itself.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Raw model output.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub content: String,
    /// Model that actually answered.
    pub model: String,
    pub elapsed: Duration,
}

/// A text-completion backend.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Provider label for logs and errors.
    fn provider(&self) -> &str;

    async fn complete(&self, request: InferenceRequest) -> Result<InferenceResponse, LlmError>;
}

/// Supported inference backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
    Ollama,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" | "local" => Ok(Self::Ollama),
            other => Err(ConfigError::InvalidValue {
                key: "MAILFLOW_LLM_BACKEND".to_string(),
                message: format!("unknown backend '{other}' (expected anthropic, openai or ollama)"),
            }),
        }
    }
}

/// Create the configured backend, or `None` when the pipeline runs
/// rule-based only.
pub fn create_backend(config: &InferenceConfig) -> Result<Option<Arc<dyn InferenceBackend>>, LlmError> {
    let Some(backend) = config.backend else {
        tracing::info!("No inference backend configured, running Phase 1 only");
        return Ok(None);
    };
    let backend: Arc<dyn InferenceBackend> = match backend {
        LlmBackend::Anthropic => create_anthropic_backend(config)?,
        LlmBackend::OpenAi => create_openai_backend(config)?,
        LlmBackend::Ollama => {
            tracing::info!("Using Ollama at {} (model: {})", config.ollama_url, config.model);
            Arc::new(OllamaBackend::new(&config.ollama_url)?)
        }
    };
    Ok(Some(backend))
}

fn model_names(config: &InferenceConfig) -> Vec<String> {
    let mut names = vec![config.model.clone()];
    if config.deep_model() != config.model {
        names.push(config.deep_model().to_string());
    }
    names
}

fn api_key<'a>(config: &'a InferenceConfig, provider: &str) -> Result<&'a str, LlmError> {
    config
        .api_key
        .as_ref()
        .map(|key| key.expose_secret())
        .ok_or_else(|| LlmError::AuthFailed {
            provider: provider.to_string(),
        })
}

fn create_anthropic_backend(config: &InferenceConfig) -> Result<Arc<dyn InferenceBackend>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key(config, "anthropic")?).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let models = model_names(config)
        .into_iter()
        .map(|name| {
            let model = client.completion_model(&name);
            (name, model)
        })
        .collect();
    tracing::info!("Using Anthropic (model: {}, deep: {})", config.model, config.deep_model());
    Ok(Arc::new(RigBackend::new("anthropic", models)))
}

fn create_openai_backend(config: &InferenceConfig) -> Result<Arc<dyn InferenceBackend>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(api_key(config, "openai")?).map_err(|e| LlmError::RequestFailed {
            provider: "openai".to_string(),
            reason: format!("Failed to create OpenAI client: {}", e),
        })?;

    let models = model_names(config)
        .into_iter()
        .map(|name| {
            let model = client.completion_model(&name);
            (name, model)
        })
        .collect();
    tracing::info!("Using OpenAI (model: {}, deep: {})", config.model, config.deep_model());
    Ok(Arc::new(RigBackend::new("openai", models)))
}

/// Map an HTTP status and body to an error, classifying retryable statuses.
pub(crate) fn parse_http_error(status: u16, body: &str, provider: &str) -> LlmError {
    let provider = provider.to_string();
    match status {
        401 | 403 => LlmError::AuthFailed { provider },
        404 => LlmError::ModelNotAvailable {
            provider,
            model: body.chars().take(200).collect(),
        },
        408 => LlmError::Timeout {
            provider,
            timeout: Duration::ZERO,
        },
        429 => LlmError::RateLimited {
            provider,
            retry_after: None,
        },
        500..=599 => LlmError::ServerError {
            provider,
            status,
            reason: body.chars().take(200).collect(),
        },
        _ => LlmError::RequestFailed {
            provider,
            reason: format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
        },
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("Anthropic".parse::<LlmBackend>().unwrap(), LlmBackend::Anthropic);
        assert_eq!(" openai ".parse::<LlmBackend>().unwrap(), LlmBackend::OpenAi);
        assert_eq!("ollama".parse::<LlmBackend>().unwrap(), LlmBackend::Ollama);
        assert!("gpt".parse::<LlmBackend>().is_err());
    }

    #[test]
    fn no_backend_means_none() {
        let config = InferenceConfig::default();
        assert!(create_backend(&config).unwrap().is_none());
    }

    #[test]
    fn hosted_backend_constructs_with_any_key() {
        // rig-core clients accept any string as API key at construction time.
        // The actual auth failure happens when making a request.
        let config = InferenceConfig {
            backend: Some(LlmBackend::Anthropic),
            api_key: Some(SecretString::from("test-key")),
            model: "claude-3-5-haiku-latest".to_string(),
            deep_model: Some("claude-3-5-sonnet-latest".to_string()),
            ..Default::default()
        };
        let backend = create_backend(&config).unwrap().unwrap();
        assert_eq!(backend.provider(), "anthropic");
    }

    #[test]
    fn hosted_backend_without_key_fails() {
        let config = InferenceConfig {
            backend: Some(LlmBackend::OpenAi),
            ..Default::default()
        };
        assert!(matches!(create_backend(&config), Err(LlmError::AuthFailed { .. })));
    }

    #[test]
    fn http_errors_are_classified() {
        assert!(parse_http_error(503, "busy", "ollama").is_transient());
        assert!(parse_http_error(429, "", "ollama").is_transient());
        assert!(!parse_http_error(401, "", "ollama").is_transient());
        assert!(matches!(
            parse_http_error(404, "model 'x' not found", "ollama"),
            LlmError::ModelNotAvailable { .. }
        ));
        assert!(!parse_http_error(400, "bad", "ollama").is_transient());
    }
}
