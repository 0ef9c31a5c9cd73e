use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enhancement::EnhancementConfig;
use crate::error::PersuaderError;
use crate::logging::LogLevel;
use crate::provider::ProviderOptions;
use crate::schema::Schema;
use crate::validation::JsonExtraction;

/// Token counts reported by (or estimated for) a provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Estimate usage from prompt and response text.
    pub fn estimated(prompt: &str, response: &str) -> Self {
        Self::new(
            crate::metrics::estimate_tokens(prompt),
            crate::metrics::estimate_tokens(response),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Everything one `persuade` call needs.
///
/// ```rust,ignore
/// let options = Options::new(Schema::<Person>::of()?, json!("Al is 30"))
///     .context("HR records")
///     .retries(2);
/// ```
#[derive(Debug, Clone)]
pub struct Options<T> {
    pub schema: Schema<T>,
    pub input: Value,
    pub context: Option<String>,
    pub lens: Option<String>,
    pub example_output: Option<Value>,
    /// Extra attempts after the first. `None` uses the pipeline default.
    pub retries: Option<usize>,
    pub model: Option<String>,
    pub provider_options: ProviderOptions,
    pub success_message: Option<String>,
    pub enhancement: Option<EnhancementConfig>,
    pub session_id: Option<String>,
    pub log_level: Option<LogLevel>,
    pub extraction: JsonExtraction,
}

impl<T> Options<T> {
    pub fn new(schema: Schema<T>, input: impl Into<Value>) -> Self {
        Self {
            schema,
            input: input.into(),
            context: None,
            lens: None,
            example_output: None,
            retries: None,
            model: None,
            provider_options: ProviderOptions::default(),
            success_message: None,
            enhancement: None,
            session_id: None,
            log_level: None,
            extraction: JsonExtraction::default(),
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn lens(mut self, lens: impl Into<String>) -> Self {
        self.lens = Some(lens.into());
        self
    }

    pub fn example_output(mut self, example: Value) -> Self {
        self.example_output = Some(example);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn provider_options(mut self, options: ProviderOptions) -> Self {
        self.provider_options = options;
        self
    }

    pub fn success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }

    pub fn enhancement(mut self, config: EnhancementConfig) -> Self {
        self.enhancement = Some(config);
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn extraction(mut self, extraction: JsonExtraction) -> Self {
        self.extraction = extraction;
        self
    }
}

/// Timing and provenance attached to every pipeline result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub provider: String,
    pub model: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

/// Public outcome of [`crate::Persuader::persuade`].
#[derive(Debug, Clone)]
pub enum PersuadeResult<T> {
    Ok {
        value: T,
        attempts: usize,
        session_id: Option<String>,
        metadata: ExecutionMetadata,
    },
    Err {
        error: PersuaderError,
        attempts: usize,
        /// Every error seen, oldest first. The last entry is `error`.
        all_errors: Vec<PersuaderError>,
        metadata: ExecutionMetadata,
    },
}

impl<T> PersuadeResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok { value, .. } => Some(value),
            Self::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&PersuaderError> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { error, .. } => Some(error),
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            Self::Ok { attempts, .. } | Self::Err { attempts, .. } => *attempts,
        }
    }

    pub fn metadata(&self) -> &ExecutionMetadata {
        match self {
            Self::Ok { metadata, .. } | Self::Err { metadata, .. } => metadata,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Ok { session_id, .. } => session_id.as_deref(),
            Self::Err { .. } => None,
        }
    }

    pub fn all_errors(&self) -> &[PersuaderError] {
        match self {
            Self::Ok { .. } => &[],
            Self::Err { all_errors, .. } => all_errors,
        }
    }

    pub fn into_result(self) -> Result<T, PersuaderError> {
        match self {
            Self::Ok { value, .. } => Ok(value),
            Self::Err { error, .. } => Err(error),
        }
    }
}
