//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;
use crate::llm::LlmBackend;
use crate::pipeline::entities::DEFAULT_MAX_PART_NUMBERS;
use crate::pipeline::router::RoutingPolicy;
use crate::pipeline::types::millis;

/// Weights and caps for chain completeness scoring.
///
/// Every factor is normalised to `[0, 1]` before weighting, so the score of a
/// chain is at most the sum of the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainScoringConfig {
    /// Score at or above which a multi-email chain counts as complete.
    pub complete_threshold: f64,
    /// Ceiling for chains of exactly one email.
    pub single_email_cap: f64,
    /// Ceiling for chains without any start marker.
    pub no_start_cap: f64,
    pub start_weight: f64,
    pub completion_weight: f64,
    pub participants_weight: f64,
    pub duration_weight: f64,
    pub email_count_weight: f64,
    pub entity_weight: f64,
    /// Email count at which the count factor saturates.
    pub email_count_cap: usize,
    /// Conversation duration at which the duration factor saturates.
    pub full_duration_hours: f64,
}

impl Default for ChainScoringConfig {
    fn default() -> Self {
        Self {
            complete_threshold: 0.7,
            single_email_cap: 0.5,
            no_start_cap: 0.3,
            start_weight: 0.30,
            completion_weight: 0.30,
            participants_weight: 0.15,
            duration_weight: 0.10,
            email_count_weight: 0.10,
            entity_weight: 0.05,
            email_count_cap: 5,
            full_duration_hours: 48.0,
        }
    }
}

impl ChainScoringConfig {
    fn weights(&self) -> [(&'static str, f64); 6] {
        [
            ("start_weight", self.start_weight),
            ("completion_weight", self.completion_weight),
            ("participants_weight", self.participants_weight),
            ("duration_weight", self.duration_weight),
            ("email_count_weight", self.email_count_weight),
            ("entity_weight", self.entity_weight),
        ]
    }

    /// Reject weightings that break the scoring guarantees: a chain with a
    /// start marker, a completion marker and two participants must reach the
    /// threshold, and a single email must stay at or below 0.5.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, weight) in self.weights() {
            if !(0.0..=1.0).contains(&weight) {
                return Err(invalid(key, format!("weight {weight} outside [0, 1]")));
            }
        }
        let total: f64 = self.weights().iter().map(|(_, w)| w).sum();
        if total > 1.0 + 1e-9 {
            return Err(invalid("weights", format!("sum {total:.3} exceeds 1.0")));
        }
        if !(0.0..=1.0).contains(&self.complete_threshold) || self.complete_threshold == 0.0 {
            return Err(invalid(
                "complete_threshold",
                format!("{} outside (0, 1]", self.complete_threshold),
            ));
        }
        if !(0.0..=0.5).contains(&self.single_email_cap) {
            return Err(invalid(
                "single_email_cap",
                format!("{} outside [0, 0.5]", self.single_email_cap),
            ));
        }
        if !(0.0..=1.0).contains(&self.no_start_cap) {
            return Err(invalid(
                "no_start_cap",
                format!("{} outside [0, 1]", self.no_start_cap),
            ));
        }
        let guaranteed = self.start_weight + self.completion_weight + self.participants_weight;
        if guaranteed + 1e-9 < self.complete_threshold {
            return Err(invalid(
                "weights",
                format!(
                    "start + completion + participants = {guaranteed:.3} is below threshold {}",
                    self.complete_threshold
                ),
            ));
        }
        if self.email_count_cap < 2 {
            return Err(invalid("email_count_cap", "must be at least 2".into()));
        }
        if self.full_duration_hours <= 0.0 {
            return Err(invalid("full_duration_hours", "must be positive".into()));
        }
        Ok(())
    }
}

/// Analysis cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    /// Bumped whenever prompt templates change so stale results miss.
    pub prompt_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600), // 1 hour
            max_entries: 10_000,
            prompt_version: "v1".to_string(),
        }
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Maximum number of items analysed concurrently.
    pub max_concurrency: usize,
    /// Budget for one inference phase, retries included.
    pub phase_timeout: Duration,
    /// Retries after the first attempt for transient backend failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long in-flight items may run after shutdown before being aborted.
    pub shutdown_grace: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            phase_timeout: Duration::from_secs(120),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Inference backend settings.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// `None` runs the pipeline rule-based only.
    pub backend: Option<LlmBackend>,
    /// Model for Phase 2.
    pub model: String,
    /// Model for Phase 3; defaults to `model`.
    pub deep_model: Option<String>,
    pub api_key: Option<SecretString>,
    pub ollama_url: String,
    /// Per-request timeout enforced by the backend client.
    pub request_timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Body characters included in prompts.
    pub max_body_chars: usize,
    /// Parsed model output scoring below this is replaced by the fallback.
    pub min_quality: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: None,
            model: "llama3.2:3b".to_string(),
            deep_model: None,
            api_key: None,
            ollama_url: "http://localhost:11434".to_string(),
            request_timeout: Duration::from_secs(90),
            temperature: 0.1,
            max_tokens: 1024,
            max_body_chars: 2000,
            min_quality: 0.35,
        }
    }
}

impl InferenceConfig {
    pub fn deep_model(&self) -> &str {
        self.deep_model.as_deref().unwrap_or(&self.model)
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chain: ChainScoringConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub inference: InferenceConfig,
    pub routing: RoutingPolicy,
    pub max_part_numbers: usize,
    /// Sender patterns (regexes) whose mail is always at least high priority.
    pub priority_senders: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chain: ChainScoringConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            inference: InferenceConfig::default(),
            routing: RoutingPolicy::default(),
            max_part_numbers: DEFAULT_MAX_PART_NUMBERS,
            priority_senders: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `MAILFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup. Absent or unparsable numeric
    /// values fall back to defaults; an unknown backend name is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        let batch = &mut config.batch;
        batch.max_concurrency = parse_or(&lookup, "MAILFLOW_MAX_CONCURRENCY", batch.max_concurrency);
        batch.phase_timeout = Duration::from_secs(parse_or(
            &lookup,
            "MAILFLOW_PHASE_TIMEOUT_SECS",
            batch.phase_timeout.as_secs(),
        ));
        batch.max_retries = parse_or(&lookup, "MAILFLOW_MAX_RETRIES", batch.max_retries);
        batch.backoff_base = Duration::from_millis(parse_or(
            &lookup,
            "MAILFLOW_BACKOFF_BASE_MS",
            millis(batch.backoff_base),
        ));
        batch.shutdown_grace = Duration::from_secs(parse_or(
            &lookup,
            "MAILFLOW_SHUTDOWN_GRACE_SECS",
            batch.shutdown_grace.as_secs(),
        ));

        let cache = &mut config.cache;
        cache.ttl = Duration::from_secs(parse_or(&lookup, "MAILFLOW_CACHE_TTL_SECS", cache.ttl.as_secs()));
        cache.max_entries = parse_or(&lookup, "MAILFLOW_CACHE_MAX_ENTRIES", cache.max_entries);
        if let Some(version) = lookup("MAILFLOW_PROMPT_VERSION").filter(|v| !v.trim().is_empty()) {
            cache.prompt_version = version;
        }

        config.chain.complete_threshold = parse_or(
            &lookup,
            "MAILFLOW_COMPLETE_THRESHOLD",
            config.chain.complete_threshold,
        );

        config.routing.force_deep_analysis = parse_flag(&lookup, "MAILFLOW_FORCE_DEEP_ANALYSIS");
        config.routing.phase1_only = parse_flag(&lookup, "MAILFLOW_PHASE1_ONLY");
        if let Some(raw) = lookup("MAILFLOW_PRIORITY_SENDERS") {
            config.priority_senders = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        let inference = &mut config.inference;
        inference.backend = match lookup("MAILFLOW_LLM_BACKEND") {
            Some(name) if !name.trim().is_empty() => Some(name.parse()?),
            _ => None,
        };
        if let Some(model) = lookup("MAILFLOW_MODEL").filter(|m| !m.trim().is_empty()) {
            inference.model = model;
        }
        inference.deep_model = lookup("MAILFLOW_DEEP_MODEL").filter(|m| !m.trim().is_empty());
        inference.api_key = lookup("MAILFLOW_API_KEY")
            .or_else(|| match inference.backend {
                Some(LlmBackend::Anthropic) => lookup("ANTHROPIC_API_KEY"),
                Some(LlmBackend::OpenAi) => lookup("OPENAI_API_KEY"),
                _ => None,
            })
            .map(SecretString::from);
        if let Some(url) = lookup("MAILFLOW_OLLAMA_URL").filter(|u| !u.trim().is_empty()) {
            inference.ollama_url = url;
        }
        inference.request_timeout = Duration::from_secs(parse_or(
            &lookup,
            "MAILFLOW_LLM_TIMEOUT_SECS",
            inference.request_timeout.as_secs(),
        ));
        inference.min_quality = parse_or(&lookup, "MAILFLOW_MIN_QUALITY", inference.min_quality);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chain.validate()?;
        if self.batch.max_concurrency == 0 {
            return Err(invalid("MAILFLOW_MAX_CONCURRENCY", "must be at least 1".into()));
        }
        if self.batch.phase_timeout.is_zero() {
            return Err(invalid("MAILFLOW_PHASE_TIMEOUT_SECS", "must be positive".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("MAILFLOW_CACHE_MAX_ENTRIES", "must be at least 1".into()));
        }
        for pattern in &self.priority_senders {
            if let Err(err) = regex::Regex::new(pattern) {
                return Err(invalid("MAILFLOW_PRIORITY_SENDERS", format!("{pattern}: {err}")));
            }
        }
        if !(0.0..=1.0).contains(&self.inference.min_quality) {
            return Err(invalid("MAILFLOW_MIN_QUALITY", "must be within [0, 1]".into()));
        }
        if matches!(
            self.inference.backend,
            Some(LlmBackend::Anthropic | LlmBackend::OpenAi)
        ) && self.inference.api_key.is_none()
        {
            return Err(ConfigError::MissingEnvVar("MAILFLOW_API_KEY".into()));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            default
        }),
        None => default,
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.max_concurrency, 5);
        assert_eq!(config.max_part_numbers, DEFAULT_MAX_PART_NUMBERS);
        assert!(config.inference.backend.is_none());
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("MAILFLOW_MAX_CONCURRENCY", "8"),
            ("MAILFLOW_PHASE_TIMEOUT_SECS", "30"),
            ("MAILFLOW_FORCE_DEEP_ANALYSIS", "true"),
            ("MAILFLOW_LLM_BACKEND", "ollama"),
            ("MAILFLOW_MODEL", "qwen2.5:7b"),
            ("MAILFLOW_PROMPT_VERSION", "v7"),
        ]))
        .unwrap();
        assert_eq!(config.batch.max_concurrency, 8);
        assert_eq!(config.batch.phase_timeout, Duration::from_secs(30));
        assert!(config.routing.force_deep_analysis);
        assert!(!config.routing.phase1_only);
        assert_eq!(config.inference.backend, Some(LlmBackend::Ollama));
        assert_eq!(config.inference.model, "qwen2.5:7b");
        assert_eq!(config.inference.deep_model(), "qwen2.5:7b");
        assert_eq!(config.cache.prompt_version, "v7");
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config =
            PipelineConfig::from_lookup(lookup_from(&[("MAILFLOW_MAX_RETRIES", "lots")])).unwrap();
        assert_eq!(config.batch.max_retries, BatchConfig::default().max_retries);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("MAILFLOW_LLM_BACKEND", "carrier-pigeon")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn hosted_backend_requires_api_key() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("MAILFLOW_LLM_BACKEND", "anthropic")]));
        assert!(matches!(err, Err(ConfigError::MissingEnvVar(_))));

        let ok = PipelineConfig::from_lookup(lookup_from(&[
            ("MAILFLOW_LLM_BACKEND", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant-test"),
        ]));
        assert!(ok.is_ok());
    }

    #[test]
    fn priority_senders_are_split_and_checked() {
        let config = PipelineConfig::from_lookup(lookup_from(&[(
            "MAILFLOW_PRIORITY_SENDERS",
            r"(?i)@bigcustomer\.com$, ,ceo@acme\.com",
        )]))
        .unwrap();
        assert_eq!(config.priority_senders, vec![r"(?i)@bigcustomer\.com$", r"ceo@acme\.com"]);

        let err = PipelineConfig::from_lookup(lookup_from(&[("MAILFLOW_PRIORITY_SENDERS", "([unclosed")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { ref key, .. }) if key == "MAILFLOW_PRIORITY_SENDERS"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("MAILFLOW_MAX_CONCURRENCY", "0")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn weights_must_guarantee_threshold() {
        let config = ChainScoringConfig {
            start_weight: 0.1,
            completion_weight: 0.1,
            participants_weight: 0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn single_email_cap_cannot_exceed_half() {
        let config = ChainScoringConfig {
            single_email_cap: 0.6,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn weights_cannot_exceed_one() {
        let config = ChainScoringConfig {
            duration_weight: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
