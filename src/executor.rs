//! The bounded retry loop: prompt, call, validate, feed back.

use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace, warn};

use crate::enhancement::{run_enhancement, EnhancementConfig};
use crate::error::{PersuaderError, ValidationError};
use crate::feedback::format_validation_error_feedback;
use crate::metrics::{AttemptRecord, SessionMetricsRecorder};
use crate::models::TokenUsage;
use crate::prompt::{
    augment_prompt_with_errors, build_prompt, urgency_for, PromptParts, PromptRequest,
};
use crate::provider::{Provider, ProviderOptions};
use crate::retry::RetryPolicy;
use crate::schema::Schema;
use crate::session::ResolvedSession;
use crate::validation::{validate_json_with, JsonExtraction};

/// Normalized, validated settings for one run.
#[derive(Debug, Clone)]
pub struct ExecutionConfig<T> {
    pub schema: Schema<T>,
    pub input: Value,
    pub context: Option<String>,
    pub lens: Option<String>,
    pub example_output: Option<Value>,
    /// Extra attempts after the first.
    pub retries: usize,
    pub model: Option<String>,
    pub provider_options: ProviderOptions,
    pub enhancement: Option<EnhancementConfig>,
    pub extraction: JsonExtraction,
    /// Backoff between failed attempts. Its `max_attempts` is ignored here.
    pub retry_policy: RetryPolicy,
    pub success_message: Option<String>,
}

impl<T> ExecutionConfig<T> {
    pub fn new(schema: Schema<T>, input: Value) -> Self {
        Self {
            schema,
            input,
            context: None,
            lens: None,
            example_output: None,
            retries: 3,
            model: None,
            provider_options: ProviderOptions::default(),
            enhancement: None,
            extraction: JsonExtraction::default(),
            retry_policy: RetryPolicy::default(),
            success_message: None,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.retries + 1
    }

    /// Prompt inputs for attempt 1.
    pub fn prompt_request(&self) -> PromptRequest<'_> {
        PromptRequest::new(self.schema.document(), &self.input)
            .context(self.context.as_deref())
            .lens(self.lens.as_deref())
            .example_output(self.example_output.as_ref())
    }
}

/// Outcome of [`execute_with_retry`]. `value.is_some() == success`.
#[derive(Debug, Clone)]
pub struct ExecutionResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<PersuaderError>,
    /// Base attempts plus enhancement rounds that reached the provider.
    pub attempts: usize,
    pub enhancement_attempts: usize,
    pub accepted_enhancements: usize,
    /// Every error seen, oldest first.
    pub all_errors: Vec<PersuaderError>,
    pub token_usage: TokenUsage,
    pub last_response_metadata: Option<Map<String, Value>>,
}

impl<T> ExecutionResult<T> {
    fn failed(
        error: PersuaderError,
        attempts: usize,
        all_errors: Vec<PersuaderError>,
        token_usage: TokenUsage,
    ) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            attempts,
            enhancement_attempts: 0,
            accepted_enhancements: 0,
            all_errors,
            token_usage,
            last_response_metadata: None,
        }
    }

    /// Attempts spent in the base loop.
    pub fn base_attempts(&self) -> usize {
        self.attempts - self.enhancement_attempts
    }
}

/// Drive up to `retries + 1` attempts until one validates.
#[instrument(skip_all, fields(
    target = std::any::type_name::<T>(),
    provider = provider.name(),
    max_attempts = config.max_attempts(),
))]
pub async fn execute_with_retry<T>(
    config: &ExecutionConfig<T>,
    provider: &dyn Provider,
    recorder: &SessionMetricsRecorder,
    session: Option<&ResolvedSession>,
) -> ExecutionResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let max_attempts = config.max_attempts();
    let provider_session = session.and_then(ResolvedSession::provider_session_id);
    let base_parts = build_prompt(&config.prompt_request());

    let mut all_errors: Vec<PersuaderError> = Vec::new();
    let mut token_usage = TokenUsage::default();
    let mut last_metadata = None;
    let mut previous_failure: Option<ValidationError> = None;
    let mut attempt = 0;

    while attempt < max_attempts {
        attempt += 1;
        let parts = attempt_prompt(config, &base_parts, attempt, previous_failure.take());
        let prompt = parts.combined();
        debug!(attempt, prompt_chars = prompt.len(), "Sending prompt");

        let started = Instant::now();
        let response = provider
            .send_prompt(provider_session, &prompt, &config.provider_options)
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                // Provider failures consume an attempt but never end the loop early.
                warn!(attempt, max_attempts, retryable = err.retryable, error = %err, "Provider call failed");
                let err = PersuaderError::from(err);
                record(recorder, session, AttemptRecord::failure(attempt, elapsed, None, &err)).await;
                all_errors.push(err);
                backoff(config, attempt, max_attempts).await;
                continue;
            }
        };

        trace!(attempt, raw = %response.content, "Provider response");
        let usage = response
            .token_usage
            .unwrap_or_else(|| TokenUsage::estimated(&prompt, &response.content));
        token_usage += usage;
        last_metadata = Some(response.metadata.clone());

        match validate_json_with(&config.schema, &response.content, config.extraction).into_result() {
            Ok(value) => {
                record(recorder, session, AttemptRecord::success(attempt, elapsed, Some(usage))).await;
                info!(attempt, "Response validated");
                if let Some(message) = &config.success_message {
                    info!("{message}");
                }
                return finish_success(
                    config,
                    provider,
                    recorder,
                    session,
                    value,
                    attempt,
                    all_errors,
                    token_usage,
                    last_metadata,
                )
                .await;
            }
            Err(err) => {
                warn!(
                    attempt,
                    max_attempts,
                    failure_mode = %err.failure_mode,
                    issues = err.issues.len(),
                    "Response failed validation"
                );
                let wrapped = PersuaderError::from(err.clone());
                record(
                    recorder,
                    session,
                    AttemptRecord::failure(attempt, elapsed, Some(usage), &wrapped),
                )
                .await;
                all_errors.push(wrapped);
                previous_failure = Some(err);
                backoff(config, attempt, max_attempts).await;
            }
        }
    }

    let attempts = attempt;
    match all_errors.last().cloned() {
        Some(last) => ExecutionResult::failed(last, attempts, all_errors, token_usage),
        None => {
            // max_attempts is at least one, so every exit from the loop pushed an error.
            let err = crate::error::ProviderError::orchestration_failed(
                provider.name(),
                "no attempts were made",
            );
            ExecutionResult::failed(err.into(), attempts, all_errors, token_usage)
        }
    }
}

fn attempt_prompt<T>(
    config: &ExecutionConfig<T>,
    base: &PromptParts,
    attempt: usize,
    previous_failure: Option<ValidationError>,
) -> PromptParts {
    if attempt == 1 {
        return base.clone();
    }

    let urgency = urgency_for(attempt);
    if urgency > urgency_for(attempt - 1) {
        info!(attempt, urgency = urgency.label(), "Escalating prompt");
    }

    let rebuilt = build_prompt(&config.prompt_request().attempt(attempt));
    match previous_failure {
        Some(err) => {
            let feedback = format_validation_error_feedback(&err, attempt);
            augment_prompt_with_errors(&rebuilt, &feedback)
        }
        None => rebuilt,
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_success<T>(
    config: &ExecutionConfig<T>,
    provider: &dyn Provider,
    recorder: &SessionMetricsRecorder,
    session: Option<&ResolvedSession>,
    value: T,
    base_attempts: usize,
    mut all_errors: Vec<PersuaderError>,
    mut token_usage: TokenUsage,
    last_response_metadata: Option<Map<String, Value>>,
) -> ExecutionResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let Some(enhancement) = config.enhancement.as_ref().filter(|e| e.rounds > 0) else {
        return ExecutionResult {
            success: true,
            value: Some(value),
            error: None,
            attempts: base_attempts,
            enhancement_attempts: 0,
            accepted_enhancements: 0,
            all_errors,
            token_usage,
            last_response_metadata,
        };
    };

    let outcome = run_enhancement(config, enhancement, provider, recorder, session, value).await;
    token_usage += outcome.token_usage;
    all_errors.extend(outcome.errors);

    ExecutionResult {
        success: true,
        value: Some(outcome.value),
        error: None,
        attempts: base_attempts + outcome.attempts_made,
        enhancement_attempts: outcome.attempts_made,
        accepted_enhancements: outcome.accepted_rounds,
        all_errors,
        token_usage,
        last_response_metadata,
    }
}

async fn backoff<T>(config: &ExecutionConfig<T>, attempt: usize, max_attempts: usize) {
    if attempt >= max_attempts {
        return;
    }
    let delay = config
        .retry_policy
        .delay_for(u32::try_from(attempt - 1).unwrap_or(u32::MAX));
    if !delay.is_zero() {
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
        sleep(delay).await;
    }
}

async fn record(
    recorder: &SessionMetricsRecorder,
    session: Option<&ResolvedSession>,
    record: AttemptRecord,
) {
    if let Some(session) = session {
        if let Err(err) = recorder.record_attempt(&session.id, &record).await {
            warn!(error = %err, "Failed to record attempt metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureMode;
    use crate::provider::{MockProvider, MockReply};
    use crate::session::{InMemorySessionStore, SessionData, SessionStore};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
    struct Person {
        name: String,
        age: f64,
    }

    fn config(retries: usize) -> ExecutionConfig<Person> {
        let mut config = ExecutionConfig::new(Schema::of().unwrap(), json!({"name": "Al"}));
        config.retries = retries;
        config.retry_policy = RetryPolicy::immediate(retries + 1);
        config
    }

    async fn recorder() -> (SessionMetricsRecorder, ResolvedSession) {
        let store = Arc::new(InMemorySessionStore::new());
        store.set(SessionData::new("s", "mock", "", false)).await.unwrap();
        (
            SessionMetricsRecorder::new(store),
            ResolvedSession {
                id: "s".into(),
                provider_managed: false,
            },
        )
    }

    #[tokio::test]
    async fn first_try_success_sends_no_feedback() {
        let provider = MockProvider::with_responses([r#"{"name":"Al","age":30}"#]);
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(2), &provider, &recorder, Some(&session)).await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(provider.call_count(), 1);
        assert!(!provider.prompts()[0].contains("PREVIOUS ATTEMPT FAILED VALIDATION"));
        assert!(result.token_usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn feedback_from_failed_attempt_reaches_next_prompt() {
        let provider = MockProvider::with_responses([
            "not json",
            r#"{"name":"Al","age":"30"}"#,
            r#"{"name":"Al","age":30}"#,
        ]);
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(3), &provider, &recorder, Some(&session)).await;

        assert_eq!(result.attempts, 3);
        assert_eq!(result.value, Some(Person { name: "Al".into(), age: 30.0 }));
        assert_eq!(result.all_errors.len(), 2);

        let prompts = provider.prompts();
        assert!(prompts[1].contains("could not be parsed as JSON") || prompts[1].contains("not valid JSON"));
        assert!(prompts[2].contains("Field age: change from string to number"));
        assert!(prompts[2].contains("must start with { and end with }"));

        let metrics = recorder.get("s").await.unwrap().unwrap();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.successful_validations, 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let provider = MockProvider::always(MockReply::content("nope"));
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(2), &provider, &recorder, Some(&session)).await;

        assert!(!result.success);
        assert!(result.value.is_none());
        assert_eq!(result.attempts, 3);
        assert_eq!(
            result.error.as_ref().and_then(PersuaderError::failure_mode),
            Some(FailureMode::JsonParseFailure)
        );
    }

    #[tokio::test]
    async fn non_retryable_provider_error_uses_every_attempt() {
        let provider = MockProvider::always(MockReply::failure_with_status("invalid api key", 401));
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(3), &provider, &recorder, Some(&session)).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 4);
        assert_eq!(provider.call_count(), 4);
        let error = result.error.as_ref().and_then(PersuaderError::as_provider).unwrap();
        assert!(!error.retryable);
        let metrics = recorder.get("s").await.unwrap().unwrap();
        assert_eq!(metrics.total_attempts, 4);
    }

    #[tokio::test]
    async fn unrecognised_provider_failure_is_followed_by_success() {
        let provider = MockProvider::new([
            MockReply::failure("claude cli exited with code 1"),
            MockReply::content(r#"{"name":"Al","age":30}"#),
        ]);
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(2), &provider, &recorder, Some(&session)).await;

        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.all_errors.len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_does_not_add_feedback() {
        let provider = MockProvider::new([
            MockReply::failure("network unreachable"),
            MockReply::content(r#"{"name":"Al","age":30}"#),
        ]);
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(1), &provider, &recorder, Some(&session)).await;

        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!(!provider.prompts()[1].contains("PREVIOUS ATTEMPT FAILED VALIDATION"));
        assert!(provider.prompts()[1].contains("IMPORTANT"));
    }

    #[tokio::test]
    async fn reported_usage_is_summed() {
        let provider = MockProvider::with_responses(["bad", r#"{"name":"Al","age":30}"#])
            .with_token_usage(TokenUsage::new(10, 5));
        let (recorder, session) = recorder().await;

        let result = execute_with_retry(&config(1), &provider, &recorder, Some(&session)).await;

        assert_eq!(result.token_usage, TokenUsage::new(20, 10));
    }
}
