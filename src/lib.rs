//! Coerce free-form LLM output into schema-valid Rust values.
//!
//! A [`Persuader`] sends a prompt built from your schema and input, validates
//! what comes back, and on failure re-prompts with increasingly specific
//! feedback until the output fits or the retry budget runs out.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use persuader::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
//! struct Contact {
//!     name: String,
//!     email: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let provider = MockProvider::with_responses([
//!         r#"{"name":"John Doe","email":"john@example.com"}"#,
//!     ]);
//!     let persuader = Persuader::builder(provider).build();
//!
//!     let options = Options::new(
//!         Schema::<Contact>::of()?,
//!         "Extract: John Doe, john@example.com",
//!     )
//!     .retries(2);
//!
//!     let contact = persuader.persuade(options).await.into_result()?;
//!     println!("{:?}", contact);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod enhancement;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod session;
pub mod validation;

pub use config::{process_options, PipelineConfig, ProcessedOptions};
pub use enhancement::{
    CompletenessEvaluator, EnhancementConfig, EnhancementOutcome, EnhancementStrategy,
    ImprovementEvaluator,
};
pub use error::{
    ConfigurationError, ErrorKind, FailureMode, PersuaderError, ProviderError, Result, ResultExt,
    RetryStrategy, SessionError, StructuredFeedback, ValidationCode, ValidationError,
};
pub use executor::{execute_with_retry, ExecutionConfig, ExecutionResult};
pub use feedback::format_validation_error_feedback;
pub use logging::LogLevel;
pub use metrics::{AttemptRecord, SessionMetrics, SessionMetricsRecorder};
pub use models::{ExecutionMetadata, Options, PersuadeResult, TokenUsage};
pub use pipeline::{persuade, Persuader, PersuaderBuilder};
pub use prompt::{
    augment_prompt_with_errors, build_prompt, urgency_for, PromptParts, PromptRequest,
    UrgencyLevel,
};
pub use provider::{
    MockProvider, MockReply, Provider, ProviderHealth, ProviderOptions, ProviderResponse,
};
pub use retry::{with_retry, RetryOutcome, RetryPolicy};
pub use schema::{IssueCode, Schema, SchemaIssue};
pub use session::{
    InMemorySessionStore, ResolvedSession, SessionCoordinator, SessionData, SessionStore,
};
pub use validation::{validate_json, validate_json_with, JsonExtraction, ValidationResult};

/// Prelude module for convenient imports.
///
/// ```rust
/// use persuader::prelude::*;
/// ```
pub mod prelude {
    pub use crate::enhancement::{EnhancementConfig, EnhancementStrategy};
    pub use crate::error::{FailureMode, PersuaderError, Result, ResultExt};
    pub use crate::models::{Options, PersuadeResult, TokenUsage};
    pub use crate::pipeline::{persuade, Persuader, PersuaderBuilder};
    pub use crate::provider::{MockProvider, MockReply, Provider, ProviderOptions, ProviderResponse};
    pub use crate::schema::Schema;
    pub use crate::validation::JsonExtraction;
    pub use crate::{LogLevel, PipelineConfig};

    // Re-export commonly used external types
    pub use schemars::JsonSchema;
    pub use serde::{Deserialize, Serialize};
}
