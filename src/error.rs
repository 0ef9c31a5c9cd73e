use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::SchemaIssue;

/// Top-level error taxonomy for a persuasion run.
///
/// Every consumption site matches on the variant instead of probing fields, so
/// adding a category is a compile error everywhere it matters.
#[derive(Debug, Clone, Error)]
pub enum PersuaderError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Discriminant of [`PersuaderError`], serialized as the lower-case type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Provider,
    Session,
    Configuration,
}

impl PersuaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Session(_) => ErrorKind::Session,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Check if another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        crate::retry::is_retryable(self)
    }

    /// Failure mode of a validation error, `None` for every other category.
    pub fn failure_mode(&self) -> Option<FailureMode> {
        match self {
            Self::Validation(err) => Some(err.failure_mode),
            Self::Provider(_) | Self::Session(_) | Self::Configuration(_) => None,
        }
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }

    pub fn as_provider(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider(err) => Some(err),
            _ => None,
        }
    }
}

/// Which stage of validation rejected the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    JsonParse,
    SchemaValidation,
}

/// Closed classification of why a response failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    JsonParseFailure,
    SchemaValidation,
    IncompleteResponse,
    WrongFormat,
    HallucinatedStructure,
    FieldTypeMismatch,
    MissingRequiredFields,
    ExtraUnknownFields,
    ConstraintViolation,
    NestedValidation,
    ProviderRefusal,
    ContextConfusion,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonParseFailure => "json_parse_failure",
            Self::SchemaValidation => "schema_validation",
            Self::IncompleteResponse => "incomplete_response",
            Self::WrongFormat => "wrong_format",
            Self::HallucinatedStructure => "hallucinated_structure",
            Self::FieldTypeMismatch => "field_type_mismatch",
            Self::MissingRequiredFields => "missing_required_fields",
            Self::ExtraUnknownFields => "extra_unknown_fields",
            Self::ConstraintViolation => "constraint_violation",
            Self::NestedValidation => "nested_validation",
            Self::ProviderRefusal => "provider_refusal",
            Self::ContextConfusion => "context_confusion",
        }
    }

    /// The validation stage this mode belongs to.
    pub fn code(&self) -> ValidationCode {
        match self {
            Self::JsonParseFailure => ValidationCode::JsonParse,
            _ => ValidationCode::SchemaValidation,
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hint describing how the next prompt should push the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    DemandJsonFormat,
    RestateSchema,
    AddMissingFields,
    CorrectFieldTypes,
    RemoveUnknownFields,
    RespectConstraints,
    ProvideFieldCorrections,
}

impl RetryStrategy {
    pub fn for_mode(mode: FailureMode) -> Self {
        match mode {
            FailureMode::JsonParseFailure => Self::DemandJsonFormat,
            FailureMode::WrongFormat
            | FailureMode::HallucinatedStructure
            | FailureMode::ProviderRefusal
            | FailureMode::ContextConfusion => Self::RestateSchema,
            FailureMode::MissingRequiredFields | FailureMode::IncompleteResponse => {
                Self::AddMissingFields
            }
            FailureMode::FieldTypeMismatch => Self::CorrectFieldTypes,
            FailureMode::ExtraUnknownFields => Self::RemoveUnknownFields,
            FailureMode::ConstraintViolation => Self::RespectConstraints,
            FailureMode::NestedValidation | FailureMode::SchemaValidation => {
                Self::ProvideFieldCorrections
            }
        }
    }
}

/// Model-directed explanation of a validation failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFeedback {
    pub problem_summary: String,
    pub specific_issues: Vec<String>,
    pub correction_instructions: Vec<String>,
    /// Field path (dot separated) to the concrete fix for that field.
    pub field_corrections: BTreeMap<String, String>,
    pub suggestions: Vec<String>,
}

/// A response that could not be parsed or did not satisfy the schema.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub code: ValidationCode,
    pub failure_mode: FailureMode,
    pub retry_strategy: RetryStrategy,
    pub issues: Vec<SchemaIssue>,
    /// The raw text exactly as the provider returned it.
    pub raw_value: String,
    /// The parsed JSON, when parsing got that far.
    pub parsed_value: Option<serde_json::Value>,
    pub structured_feedback: StructuredFeedback,
}

impl ValidationError {
    /// Validation failures always feed the next attempt.
    pub const fn retryable(&self) -> bool {
        true
    }

    pub fn is_parse_failure(&self) -> bool {
        self.code == ValidationCode::JsonParse
    }
}

/// Transport or model failure reported by a provider adapter.
#[derive(Debug, Clone, Error)]
#[error("{provider} provider error: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
    pub status_code: Option<u16>,
    /// Machine-readable code such as `orchestration_failed`.
    pub code: Option<String>,
    pub retryable: bool,
}

impl ProviderError {
    /// Create a provider error; retryability is inferred from the message.
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = crate::retry::is_transient_failure(None, &message);
        Self {
            provider: provider.into(),
            message,
            status_code: None,
            code: None,
            retryable,
        }
    }

    /// Attach an HTTP-like status code and recompute retryability.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self.retryable = crate::retry::is_transient_failure(Some(status), &self.message);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Force the error to stop the retry loop.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Failure that escaped every inner component of the pipeline.
    pub fn orchestration_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, message)
            .with_code("orchestration_failed")
            .non_retryable()
    }
}

/// Session lifecycle failure. Never retried inside a single run.
#[derive(Debug, Clone, Error)]
#[error("Session error{}: {message}", session_suffix(.session_id))]
pub struct SessionError {
    pub session_id: Option<String>,
    pub message: String,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            message: message.into(),
        }
    }

    pub fn for_session(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            message: message.into(),
        }
    }
}

/// Caller misuse detected before any attempt runs.
#[derive(Debug, Clone, Error)]
#[error("Configuration error{}: {message}", field_suffix(.field))]
pub struct ConfigurationError {
    pub field: Option<String>,
    pub message: String,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

fn session_suffix(session_id: &Option<String>) -> String {
    session_id
        .as_ref()
        .map(|id| format!(" ({id})"))
        .unwrap_or_default()
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_ref()
        .map(|f| format!(" in `{f}`"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, PersuaderError>;

impl PersuaderError {
    /// Prefix the inner message with `context`, keeping the category.
    pub fn context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            Self::Validation(mut err) => {
                err.message = format!("{context}: {}", err.message);
                Self::Validation(err)
            }
            Self::Provider(mut err) => {
                err.message = format!("{context}: {}", err.message);
                Self::Provider(err)
            }
            Self::Session(mut err) => {
                err.message = format!("{context}: {}", err.message);
                Self::Session(err)
            }
            Self::Configuration(mut err) => {
                err.message = format!("{context}: {}", err.message);
                Self::Configuration(err)
            }
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<PersuaderError>> ResultExt<T> for std::result::Result<T, E> {
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}
