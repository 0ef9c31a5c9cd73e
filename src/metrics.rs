//! Per-session counters, kept in the session store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ErrorKind, FailureMode, SessionError};
use crate::models::TokenUsage;
use crate::session::SessionStore;

/// Rough token count: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(4) as u64
}

/// Cumulative metrics for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_attempts: u64,
    pub successful_validations: u64,
    pub total_execution_time_ms: u64,
    pub total_token_usage: TokenUsage,
    pub operations_with_retries: u64,
    pub max_attempts_for_operation: u64,
    pub total_operations: u64,
    /// Failed attempts where the provider call itself errored.
    pub provider_failures: u64,
    /// Failed validations per failure mode.
    pub failure_modes: BTreeMap<FailureMode, u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    /// Fraction of attempts that validated, `0.0` before any attempt.
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.successful_validations as f64 / self.total_attempts as f64
        }
    }

    /// Attempts per completed operation, `0.0` before any operation.
    pub fn average_attempts(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.total_attempts as f64 / self.total_operations as f64
        }
    }

    /// The failure mode seen most often; ties go to the first in declaration order.
    pub fn most_common_failure_mode(&self) -> Option<FailureMode> {
        self.failure_modes
            .iter()
            .rev()
            .max_by_key(|(_, count)| **count)
            .map(|(mode, _)| *mode)
    }
}

/// What happened in a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub success: bool,
    pub execution_time_ms: u64,
    pub token_usage: Option<TokenUsage>,
    pub error_kind: Option<ErrorKind>,
    pub failure_mode: Option<FailureMode>,
}

impl AttemptRecord {
    pub fn success(attempt: usize, execution_time_ms: u64, token_usage: Option<TokenUsage>) -> Self {
        Self {
            attempt,
            success: true,
            execution_time_ms,
            token_usage,
            error_kind: None,
            failure_mode: None,
        }
    }

    pub fn failure(
        attempt: usize,
        execution_time_ms: u64,
        token_usage: Option<TokenUsage>,
        error: &crate::error::PersuaderError,
    ) -> Self {
        Self {
            attempt,
            success: false,
            execution_time_ms,
            token_usage,
            error_kind: Some(error.kind()),
            failure_mode: error.failure_mode(),
        }
    }
}

/// The only writer of [`SessionMetrics`].
#[derive(Clone)]
pub struct SessionMetricsRecorder {
    store: Arc<dyn SessionStore>,
}

impl SessionMetricsRecorder {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn record_attempt(
        &self,
        session_id: &str,
        record: &AttemptRecord,
    ) -> Result<(), SessionError> {
        self.update(session_id, |metrics| {
            metrics.total_attempts += 1;
            if record.success {
                metrics.successful_validations += 1;
            }
            metrics.total_execution_time_ms += record.execution_time_ms;
            if let Some(usage) = record.token_usage {
                metrics.total_token_usage += usage;
            }
            if record.error_kind == Some(ErrorKind::Provider) {
                metrics.provider_failures += 1;
            }
            if let Some(mode) = record.failure_mode {
                *metrics.failure_modes.entry(mode).or_default() += 1;
            }
        })
        .await?;
        trace!(session_id, attempt = record.attempt, success = record.success, "Recorded attempt");
        Ok(())
    }

    /// Close out one pipeline run that took `attempts` attempts.
    pub async fn record_operation(
        &self,
        session_id: &str,
        attempts: usize,
    ) -> Result<(), SessionError> {
        let attempts = attempts as u64;
        self.update(session_id, |metrics| {
            metrics.total_operations += 1;
            if attempts > 1 {
                metrics.operations_with_retries += 1;
            }
            metrics.max_attempts_for_operation = metrics.max_attempts_for_operation.max(attempts);
        })
        .await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionMetrics>, SessionError> {
        Ok(self.store.get(session_id).await?.map(|s| s.metrics))
    }

    async fn update<F>(&self, session_id: &str, apply: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut SessionMetrics),
    {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::for_session(session_id, "session not found"))?;

        apply(&mut session.metrics);
        session.metrics.last_updated = Some(Utc::now());
        self.store.set(session).await
    }
}
