//! Pipeline defaults and option normalization.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::executor::ExecutionConfig;
use crate::logging::LogLevel;
use crate::models::Options;
use crate::retry::RetryPolicy;

/// Defaults applied to every run of a [`crate::Persuader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries used when the caller does not set any (default: 3)
    pub default_retries: usize,
    /// Upper bound on caller-supplied retries (default: 10)
    pub max_retries: usize,
    /// First backoff delay (default: 1s)
    pub base_delay: Duration,
    /// Backoff ceiling (default: 10s)
    pub max_delay: Duration,
    /// Backoff growth per retry (default: 2.0)
    pub backoff_multiplier: f64,
    /// Attempts for creating a provider session (default: 2)
    pub session_attempts: usize,
    pub default_model: Option<String>,
    pub default_temperature: Option<f32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            max_retries: 10,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            session_attempts: 2,
            default_model: None,
            default_temperature: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_default_retries(mut self, retries: usize) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Retry immediately, with no sleep between attempts.
    pub fn without_backoff(mut self) -> Self {
        self.base_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self
    }

    pub fn with_session_attempts(mut self, attempts: usize) -> Self {
        self.session_attempts = attempts.max(1);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = Some(temperature);
        self
    }

    /// Backoff schedule for a run allowing `retries` extra attempts.
    pub fn retry_policy(&self, retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts: retries + 1,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn session_policy(&self) -> RetryPolicy {
        self.retry_policy(0).with_max_attempts(self.session_attempts.max(1))
    }
}

/// Options after validation, split into what each stage consumes.
#[derive(Debug, Clone)]
pub struct ProcessedOptions<T> {
    pub execution: ExecutionConfig<T>,
    pub session_id: Option<String>,
    pub log_level: Option<LogLevel>,
}

/// Validate caller options and fill defaults. Runs before any attempt.
pub fn process_options<T>(
    options: Options<T>,
    config: &PipelineConfig,
) -> Result<ProcessedOptions<T>, ConfigurationError> {
    let Options {
        schema,
        input,
        context,
        lens,
        example_output,
        retries,
        model,
        mut provider_options,
        success_message,
        enhancement,
        session_id,
        log_level,
        extraction,
    } = options;

    if !is_meaningful_input(&input) {
        return Err(ConfigurationError::for_field("input", "input must not be empty"));
    }

    let retries = retries.unwrap_or(config.default_retries);
    if retries > config.max_retries {
        return Err(ConfigurationError::for_field(
            "retries",
            format!("{retries} exceeds the maximum of {}", config.max_retries),
        ));
    }

    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        return Err(ConfigurationError::for_field(
            "backoff_multiplier",
            format!("must be at least 1.0, got {}", config.backoff_multiplier),
        ));
    }

    let model = model
        .or_else(|| provider_options.model.take())
        .or_else(|| config.default_model.clone());
    if let Some(model) = &model {
        if model.trim().is_empty() {
            return Err(ConfigurationError::for_field("model", "model must not be blank"));
        }
    }

    if let Some(id) = &session_id {
        if id.trim().is_empty() {
            return Err(ConfigurationError::for_field(
                "session_id",
                "session id must not be blank",
            ));
        }
    }

    if let Some(enhancement) = &enhancement {
        if !(0.0..=1.0).contains(&enhancement.min_improvement) {
            return Err(ConfigurationError::for_field(
                "enhancement.min_improvement",
                format!("must be within [0, 1], got {}", enhancement.min_improvement),
            ));
        }
    }

    provider_options.temperature = provider_options.temperature.or(config.default_temperature);
    if let Some(temperature) = provider_options.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigurationError::for_field(
                "temperature",
                format!("must be within [0, 2], got {temperature}"),
            ));
        }
    }
    provider_options.model = model.clone();

    if let Some(example) = &example_output {
        if !schema.is_valid(example) {
            debug!("Example output does not satisfy the schema; sending it anyway");
        }
    }

    debug!(retries, model = ?model, "Options processed");
    Ok(ProcessedOptions {
        execution: ExecutionConfig {
            schema,
            input,
            context: trimmed(context),
            lens: trimmed(lens),
            example_output,
            retries,
            model,
            provider_options,
            enhancement,
            extraction,
            retry_policy: config.retry_policy(retries),
            success_message,
        },
        session_id,
        log_level,
    })
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whether `value` carries anything a model could work from.
pub fn is_meaningful_input(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
