//! Error types for mailflow.

use std::time::Duration;

/// Startup error: anything that stops a scheduler from being assembled.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Inference backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} connection failed: {reason}")]
    Connection { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} server error (HTTP {status}): {reason}")]
    ServerError {
        provider: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl LlmError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
        )
    }
}

/// Errors raised while analysing a single item.
///
/// `Clone` so that a failed single-flight computation can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transient backend failure: {0}")]
    TransientBackend(String),

    #[error("Backend rejected request: {0}")]
    Backend(String),

    /// Never fails a phase: the analyzer falls back instead.
    #[error("Unparseable model output: {0}")]
    Parse(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Phase {phase} timed out after {timeout:?}")]
    Timeout { phase: String, timeout: Duration },

    #[error("Computation aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    /// Transient failures are retried with backoff; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientBackend(_))
    }

    /// Short label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::TransientBackend(_) => "transient_backend",
            Self::Backend(_) => "backend",
            Self::Parse(_) => "parse",
            Self::Persistence(_) => "persistence",
            Self::Timeout { .. } => "timeout",
            Self::Aborted(_) => "aborted",
        }
    }
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            Self::TransientBackend(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<DatabaseError> for PipelineError {
    fn from(err: DatabaseError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<crate::cache::CacheError> for PipelineError {
    fn from(err: crate::cache::CacheError) -> Self {
        match err {
            crate::cache::CacheError::Aborted(reason) => Self::Aborted(reason),
        }
    }
}

/// Result type alias for startup paths.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_llm_errors_become_retryable() {
        let err: PipelineError = LlmError::Timeout {
            provider: "ollama".into(),
            timeout: Duration::from_secs(90),
        }
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "transient_backend");

        let err: PipelineError = LlmError::ServerError {
            provider: "openai".into(),
            status: 503,
            reason: "overloaded".into(),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_failure_is_not_retryable() {
        let err: PipelineError = LlmError::AuthFailed {
            provider: "anthropic".into(),
        }
        .into();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "backend");
    }

    #[test]
    fn validation_and_timeout_are_final() {
        assert!(!PipelineError::Validation("empty id".into()).is_retryable());
        assert!(
            !PipelineError::Timeout {
                phase: "phase2".into(),
                timeout: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn database_error_maps_to_persistence() {
        let err: PipelineError = DatabaseError::Query("locked".into()).into();
        assert!(matches!(err, PipelineError::Persistence(ref m) if m.contains("locked")));
    }
}
