//! Ollama backend over its native `/api/generate` endpoint.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::{InferenceBackend, InferenceRequest, InferenceResponse, parse_http_error};
use crate::pipeline::types::millis;

const PROVIDER: &str = "ollama";

/// Local Ollama server client.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    model: String,
    response: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, request: InferenceRequest) -> Result<InferenceResponse, LlmError> {
        let body = GenerateRequest {
            model: &request.model,
            system: &request.system,
            prompt: &request.prompt,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(self.generate_url())
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, &request))?;

        let status = response.status().as_u16();
        let body_text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, &request))?;

        if status != 200 {
            return Err(parse_http_error(status, &body_text, PROVIDER));
        }

        let generated: GenerateResponse =
            serde_json::from_str(&body_text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to parse response: {e}"),
            })?;

        debug!(
            model = %request.model,
            elapsed_ms = millis(started.elapsed()),
            chars = generated.response.len(),
            "Ollama generation complete"
        );

        Ok(InferenceResponse {
            content: generated.response,
            model: if generated.model.is_empty() {
                request.model
            } else {
                generated.model
            },
            elapsed: started.elapsed(),
        })
    }
}

impl OllamaBackend {
    fn transport_error(&self, err: reqwest::Error, request: &InferenceRequest) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout {
                provider: PROVIDER.to_string(),
                timeout: request.timeout,
            }
        } else {
            LlmError::Connection {
                provider: PROVIDER.to_string(),
                reason: format!("{} ({})", err, self.base_url),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_url_strips_trailing_slash() {
        let backend = OllamaBackend::new("http://localhost:11434/").unwrap();
        assert_eq!(backend.generate_url(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn request_body_disables_streaming() {
        let body = GenerateRequest {
            model: "llama3.2:3b",
            system: "sys",
            prompt: "hi",
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: 256,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 256);
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        // Port 9 (discard) is closed on test hosts; connection is refused.
        let backend = OllamaBackend::new("http://127.0.0.1:9").unwrap();
        let err = backend
            .complete(InferenceRequest {
                model: "m".into(),
                system: String::new(),
                prompt: "p".into(),
                temperature: 0.0,
                max_tokens: 8,
                timeout: std::time::Duration::from_secs(2),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
