//! The public entry point tying configuration, sessions, retries and metrics together.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{process_options, PipelineConfig};
use crate::error::{PersuaderError, ProviderError, SessionError};
use crate::executor::{execute_with_retry, ExecutionResult};
use crate::logging;
use crate::metrics::{SessionMetrics, SessionMetricsRecorder};
use crate::models::{ExecutionMetadata, Options, PersuadeResult, TokenUsage};
use crate::provider::{Provider, ProviderHealth};
use crate::session::{InMemorySessionStore, SessionCoordinator, SessionStore};

/// Builder for [`Persuader`].
pub struct PersuaderBuilder {
    provider: Arc<dyn Provider>,
    store: Option<Arc<dyn SessionStore>>,
    config: PipelineConfig,
}

impl PersuaderBuilder {
    pub fn new<P: Provider + 'static>(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            store: None,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shortcut for [`PipelineConfig::without_backoff`].
    pub fn without_backoff(mut self) -> Self {
        self.config = self.config.without_backoff();
        self
    }

    pub fn build(self) -> Persuader {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));
        let sessions = SessionCoordinator::new(
            self.provider.clone(),
            store.clone(),
            self.config.session_policy(),
        );
        Persuader {
            provider: self.provider,
            recorder: SessionMetricsRecorder::new(store),
            sessions,
            config: self.config,
        }
    }
}

/// Runs persuasion pipelines against one provider.
#[derive(Clone)]
pub struct Persuader {
    provider: Arc<dyn Provider>,
    sessions: SessionCoordinator,
    recorder: SessionMetricsRecorder,
    config: PipelineConfig,
}

impl Persuader {
    pub fn builder<P: Provider + 'static>(provider: P) -> PersuaderBuilder {
        PersuaderBuilder::new(provider)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Coerce the model's output for `options.input` into a `T`.
    ///
    /// Never panics: failures from any stage come back as
    /// [`PersuadeResult::Err`] with timing metadata attached.
    #[instrument(skip_all, fields(target = std::any::type_name::<T>(), provider = self.provider.name()))]
    pub async fn persuade<T>(&self, options: Options<T>) -> PersuadeResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let started_at = Utc::now();
        let clock = Instant::now();

        let outcome = AssertUnwindSafe(self.run(options)).catch_unwind().await;

        let metadata = |model: Option<String>, token_usage: Option<TokenUsage>| {
            let completed_at = Utc::now();
            ExecutionMetadata {
                execution_time_ms: clock.elapsed().as_millis() as u64,
                started_at,
                completed_at,
                provider: self.provider.name().to_string(),
                model,
                token_usage,
            }
        };

        match outcome {
            Ok(Run::Rejected { error, model }) => PersuadeResult::Err {
                all_errors: vec![error.clone()],
                error,
                attempts: 0,
                metadata: metadata(model, None),
            },
            Ok(Run::Executed {
                result,
                session_id,
                model,
            }) => {
                let usage = Some(result.token_usage).filter(|u| !u.is_empty());
                let metadata = metadata(model, usage);
                into_public(result, session_id, metadata)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Pipeline panicked");
                let error = PersuaderError::from(ProviderError::orchestration_failed(
                    self.provider.name(),
                    format!("pipeline failed unexpectedly: {message}"),
                ));
                PersuadeResult::Err {
                    all_errors: vec![error.clone()],
                    error,
                    attempts: 0,
                    metadata: metadata(None, None),
                }
            }
        }
    }

    async fn run<T>(&self, options: Options<T>) -> Run<T>
    where
        T: Serialize + DeserializeOwned,
    {
        if let Some(level) = options.log_level {
            logging::init(level);
        }

        let requested_model = options.model.clone();
        let processed = match process_options(options, &self.config) {
            Ok(processed) => processed,
            Err(err) => {
                warn!(error = %err, "Rejected options");
                return Run::Rejected {
                    error: err.into(),
                    model: requested_model,
                };
            }
        };
        let execution = processed.execution;
        let model = execution.model.clone();

        let context = execution.context.clone().unwrap_or_default();
        let session = match self
            .sessions
            .resolve(
                processed.session_id.as_deref(),
                &context,
                &execution.provider_options,
            )
            .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "Session coordination failed");
                return Run::Rejected {
                    error: session_failure(self.provider.name(), err).into(),
                    model,
                };
            }
        };
        debug!(session_id = %session.id, provider_managed = session.provider_managed, "Session resolved");

        let result =
            execute_with_retry(&execution, self.provider.as_ref(), &self.recorder, Some(&session))
                .await;

        if let Err(err) = self
            .recorder
            .record_operation(&session.id, result.attempts)
            .await
        {
            warn!(error = %err, "Failed to record operation metrics");
        }

        if result.success {
            info!(attempts = result.attempts, "Persuasion succeeded");
        } else {
            warn!(attempts = result.attempts, "Persuasion failed");
        }

        Run::Executed {
            result,
            session_id: session.id,
            model,
        }
    }

    /// Check whether the provider is reachable.
    pub async fn health(&self) -> ProviderHealth {
        self.provider.health().await
    }

    pub async fn session_metrics(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionMetrics>, SessionError> {
        self.recorder.get(session_id).await
    }

    /// Forget a session and release it on the provider side.
    pub async fn end_session(&self, session_id: &str) -> Result<bool, SessionError> {
        self.sessions.end(session_id).await
    }
}

enum Run<T> {
    Rejected {
        error: PersuaderError,
        model: Option<String>,
    },
    Executed {
        result: ExecutionResult<T>,
        session_id: String,
        model: Option<String>,
    },
}

fn into_public<T>(
    result: ExecutionResult<T>,
    session_id: String,
    metadata: ExecutionMetadata,
) -> PersuadeResult<T> {
    let ExecutionResult {
        value,
        error,
        attempts,
        all_errors,
        ..
    } = result;

    match (value, error) {
        (Some(value), _) => PersuadeResult::Ok {
            value,
            attempts,
            session_id: Some(session_id),
            metadata,
        },
        (None, Some(error)) => PersuadeResult::Err {
            error,
            attempts,
            all_errors,
            metadata,
        },
        (None, None) => {
            let error = PersuaderError::from(ProviderError::orchestration_failed(
                metadata.provider.clone(),
                "run finished without a value or an error",
            ));
            PersuadeResult::Err {
                all_errors: vec![error.clone()],
                error,
                attempts,
                metadata,
            }
        }
    }
}

fn session_failure(provider: &str, err: SessionError) -> ProviderError {
    ProviderError::new(provider, err.to_string())
        .with_code("session_failed")
        .non_retryable()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One-shot persuasion with a fresh in-memory session store.
pub async fn persuade<T, P>(options: Options<T>, provider: P) -> PersuadeResult<T>
where
    T: Serialize + DeserializeOwned + Send,
    P: Provider + 'static,
{
    Persuader::builder(provider).build().persuade(options).await
}
