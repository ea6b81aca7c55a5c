//! Pipeline configuration for the orchestrator.
//!
//! This module provides the recognized configuration options for story runs:
//! refinement limits, moderation policy, retry/backoff for generation calls,
//! per-task timeouts and routing behaviour. Values come from defaults, an
//! optional YAML file, and `STORY_FORGE_*` environment variables, in that
//! order of increasing precedence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metric registration failed.
    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    // Refinement settings
    /// Maximum number of revisions in the critique/refine loop (0 = critique only).
    pub max_refinement_iterations: u32,
    /// Whether CREATE runs the critique/refine loop at all.
    pub enable_refinement: bool,

    // Safety settings
    /// Toxicity score at or above which input is blocked (0.0-1.0).
    pub toxicity_threshold: f64,
    /// Allow input through when the moderation service is unreachable or unconfigured.
    pub fail_open_on_moderation_unavailable: bool,

    // Generation settings
    /// Maximum attempts per generation call, including the first.
    pub retry_max_attempts: u32,
    /// Delay before the first retry.
    pub retry_initial_delay: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub retry_backoff_base: f64,
    /// Upper bound on a single backoff delay.
    pub retry_max_delay: Duration,
    /// Timeout for a single generation attempt.
    pub task_timeout: Duration,
    /// Sampling temperature passed to the provider.
    pub temperature: f64,

    // Routing settings
    /// Route requests on sessions without a draft straight to CREATE.
    pub route_new_sessions_to_create: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_refinement_iterations: 3,
            enable_refinement: true,

            toxicity_threshold: 0.7,
            fail_open_on_moderation_unavailable: true,

            retry_max_attempts: 5,
            retry_initial_delay: Duration::from_millis(1000),
            retry_backoff_base: 7.0,
            retry_max_delay: Duration::from_secs(60),
            task_timeout: Duration::from_secs(120),
            temperature: 0.7,

            route_new_sessions_to_create: true,
        }
    }
}

/// On-disk representation; every key is optional and overrides the default.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    max_refinement_iterations: Option<u32>,
    enable_refinement: Option<bool>,
    toxicity_threshold: Option<f64>,
    fail_open_on_moderation_unavailable: Option<bool>,
    retry_max_attempts: Option<u32>,
    retry_initial_delay_ms: Option<u64>,
    retry_backoff_base: Option<f64>,
    retry_max_delay_ms: Option<u64>,
    task_timeout_secs: Option<u64>,
    temperature: Option<f64>,
    route_new_sessions_to_create: Option<bool>,
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables on top of the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `STORY_FORGE_MAX_REFINEMENT_ITERATIONS` (default: 3)
    /// - `STORY_FORGE_ENABLE_REFINEMENT` (default: true)
    /// - `STORY_FORGE_TOXICITY_THRESHOLD` (default: 0.7)
    /// - `STORY_FORGE_FAIL_OPEN` (default: true)
    /// - `STORY_FORGE_RETRY_MAX_ATTEMPTS` (default: 5)
    /// - `STORY_FORGE_RETRY_INITIAL_DELAY_MS` (default: 1000)
    /// - `STORY_FORGE_RETRY_BACKOFF_BASE` (default: 7.0)
    /// - `STORY_FORGE_RETRY_MAX_DELAY_MS` (default: 60000)
    /// - `STORY_FORGE_TASK_TIMEOUT_SECS` (default: 120)
    /// - `STORY_FORGE_TEMPERATURE` (default: 0.7)
    /// - `STORY_FORGE_ROUTE_NEW_SESSIONS_TO_CREATE` (default: true)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Loads a YAML file whose keys mirror the option names.
    ///
    /// Durations are given as `retry_initial_delay_ms`, `retry_max_delay_ms`
    /// and `task_timeout_secs`.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parses YAML configuration text.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: PipelineConfigFile = serde_yaml::from_str(raw)?;
        let mut config = Self::default();
        if let Some(v) = file.max_refinement_iterations {
            config.max_refinement_iterations = v;
        }
        if let Some(v) = file.enable_refinement {
            config.enable_refinement = v;
        }
        if let Some(v) = file.toxicity_threshold {
            config.toxicity_threshold = v;
        }
        if let Some(v) = file.fail_open_on_moderation_unavailable {
            config.fail_open_on_moderation_unavailable = v;
        }
        if let Some(v) = file.retry_max_attempts {
            config.retry_max_attempts = v;
        }
        if let Some(v) = file.retry_initial_delay_ms {
            config.retry_initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.retry_backoff_base {
            config.retry_backoff_base = v;
        }
        if let Some(v) = file.retry_max_delay_ms {
            config.retry_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.task_timeout_secs {
            config.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.temperature {
            config.temperature = v;
        }
        if let Some(v) = file.route_new_sessions_to_create {
            config.route_new_sessions_to_create = v;
        }
        Ok(config)
    }

    /// Applies `STORY_FORGE_*` overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("STORY_FORGE_MAX_REFINEMENT_ITERATIONS") {
            self.max_refinement_iterations =
                parse_env_value(&val, "STORY_FORGE_MAX_REFINEMENT_ITERATIONS")?;
        }
        if let Some(val) = lookup("STORY_FORGE_ENABLE_REFINEMENT") {
            self.enable_refinement = parse_env_bool(&val, "STORY_FORGE_ENABLE_REFINEMENT")?;
        }
        if let Some(val) = lookup("STORY_FORGE_TOXICITY_THRESHOLD") {
            self.toxicity_threshold = parse_env_value(&val, "STORY_FORGE_TOXICITY_THRESHOLD")?;
        }
        if let Some(val) = lookup("STORY_FORGE_FAIL_OPEN") {
            self.fail_open_on_moderation_unavailable =
                parse_env_bool(&val, "STORY_FORGE_FAIL_OPEN")?;
        }
        if let Some(val) = lookup("STORY_FORGE_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = parse_env_value(&val, "STORY_FORGE_RETRY_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("STORY_FORGE_RETRY_INITIAL_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "STORY_FORGE_RETRY_INITIAL_DELAY_MS")?;
            self.retry_initial_delay = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("STORY_FORGE_RETRY_BACKOFF_BASE") {
            self.retry_backoff_base = parse_env_value(&val, "STORY_FORGE_RETRY_BACKOFF_BASE")?;
        }
        if let Some(val) = lookup("STORY_FORGE_RETRY_MAX_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "STORY_FORGE_RETRY_MAX_DELAY_MS")?;
            self.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("STORY_FORGE_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "STORY_FORGE_TASK_TIMEOUT_SECS")?;
            self.task_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("STORY_FORGE_TEMPERATURE") {
            self.temperature = parse_env_value(&val, "STORY_FORGE_TEMPERATURE")?;
        }
        if let Some(val) = lookup("STORY_FORGE_ROUTE_NEW_SESSIONS_TO_CREATE") {
            self.route_new_sessions_to_create =
                parse_env_bool(&val, "STORY_FORGE_ROUTE_NEW_SESSIONS_TO_CREATE")?;
        }
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.toxicity_threshold) {
            return Err(ConfigError::ValidationFailed(format!(
                "toxicity_threshold must be between 0.0 and 1.0, got {}",
                self.toxicity_threshold
            )));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry_backoff_base.is_finite() || self.retry_backoff_base < 1.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "retry_backoff_base must be at least 1.0, got {}",
                self.retry_backoff_base
            )));
        }
        if self.retry_max_delay < self.retry_initial_delay {
            return Err(ConfigError::ValidationFailed(
                "retry_max_delay must not be shorter than retry_initial_delay".to_string(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            )));
        }
        Ok(())
    }

    /// Retry/backoff policy for generation calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: self.retry_initial_delay,
            backoff_base: self.retry_backoff_base,
            max_delay: self.retry_max_delay,
            attempt_timeout: self.task_timeout,
        }
    }

    pub fn with_max_refinement_iterations(mut self, max: u32) -> Self {
        self.max_refinement_iterations = max;
        self
    }

    pub fn with_refinement(mut self, enabled: bool) -> Self {
        self.enable_refinement = enabled;
        self
    }

    pub fn with_toxicity_threshold(mut self, threshold: f64) -> Self {
        self.toxicity_threshold = threshold;
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open_on_moderation_unavailable = fail_open;
        self
    }

    pub fn with_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    pub fn with_retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = delay;
        self
    }

    pub fn with_retry_backoff_base(mut self, base: f64) -> Self {
        self.retry_backoff_base = base;
        self
    }

    pub fn with_retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_route_new_sessions_to_create(mut self, enabled: bool) -> Self {
        self.route_new_sessions_to_create = enabled;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_refinement_iterations, 3);
        assert!(config.enable_refinement);
        assert!((config.toxicity_threshold - 0.7).abs() < f64::EPSILON);
        assert!(config.fail_open_on_moderation_unavailable);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_initial_delay, Duration::from_secs(1));
        assert!((config.retry_backoff_base - 7.0).abs() < f64::EPSILON);
        assert_eq!(config.task_timeout, Duration::from_secs(120));
        assert!(config.route_new_sessions_to_create);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_max_refinement_iterations(0)
            .with_refinement(false)
            .with_toxicity_threshold(0.5)
            .with_fail_open(false)
            .with_retry_max_attempts(2)
            .with_retry_initial_delay(Duration::from_millis(10))
            .with_retry_backoff_base(2.0)
            .with_task_timeout(Duration::from_secs(5));

        assert_eq!(config.max_refinement_iterations, 0);
        assert!(!config.enable_refinement);
        assert!((config.toxicity_threshold - 0.5).abs() < f64::EPSILON);
        assert!(!config.fail_open_on_moderation_unavailable);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validation_invalid_threshold() {
        let result = PipelineConfig::default().with_toxicity_threshold(1.5).validate();
        assert!(result
            .expect_err("threshold above 1")
            .to_string()
            .contains("toxicity_threshold"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = PipelineConfig::default().with_retry_max_attempts(0).validate();
        assert!(result
            .expect_err("zero attempts")
            .to_string()
            .contains("retry_max_attempts"));
    }

    #[test]
    fn test_validation_backoff_base() {
        let result = PipelineConfig::default().with_retry_backoff_base(0.5).validate();
        assert!(result
            .expect_err("shrinking backoff")
            .to_string()
            .contains("retry_backoff_base"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let result = PipelineConfig::default()
            .with_task_timeout(Duration::ZERO)
            .validate();
        assert!(result
            .expect_err("zero timeout")
            .to_string()
            .contains("task_timeout"));
    }

    #[test]
    fn test_env_overrides() {
        let config = PipelineConfig::default()
            .with_env_overrides(lookup_from(&[
                ("STORY_FORGE_MAX_REFINEMENT_ITERATIONS", "1"),
                ("STORY_FORGE_FAIL_OPEN", "off"),
                ("STORY_FORGE_TOXICITY_THRESHOLD", "0.4"),
                ("STORY_FORGE_RETRY_INITIAL_DELAY_MS", "250"),
            ]))
            .expect("valid env");

        assert_eq!(config.max_refinement_iterations, 1);
        assert!(!config.fail_open_on_moderation_unavailable);
        assert!((config.toxicity_threshold - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.retry_initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_env_invalid_value() {
        let result = PipelineConfig::default()
            .with_env_overrides(lookup_from(&[("STORY_FORGE_FAIL_OPEN", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "max_refinement_iterations: 2\nfail_open_on_moderation_unavailable: false\ntask_timeout_secs: 30"
        )
        .expect("write");

        let config = PipelineConfig::from_yaml_file(file.path()).expect("load");
        assert_eq!(config.max_refinement_iterations, 2);
        assert!(!config.fail_open_on_moderation_unavailable);
        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_max_attempts, 5);
    }

    #[test]
    fn test_yaml_unknown_key_rejected() {
        let result = PipelineConfig::from_yaml_str("max_iterations: 2\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }
}
