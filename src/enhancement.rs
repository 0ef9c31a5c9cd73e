//! Post-success refinement rounds.
//!
//! After the base loop produces a valid value, each round asks the provider
//! to improve it. A candidate replaces the current best only when it validates
//! and its improvement score clears `min_improvement`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::PersuaderError;
use crate::executor::ExecutionConfig;
use crate::metrics::{AttemptRecord, SessionMetricsRecorder};
use crate::models::TokenUsage;
use crate::prompt::build_enhancement_prompt;
use crate::provider::Provider;
use crate::validation::validate_json_with;

/// What each round asks the model to improve.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementStrategy {
    #[default]
    ExpandDetail,
    IncreaseSpecificity,
    ImproveStructure,
    Custom(String),
}

impl EnhancementStrategy {
    pub fn instruction(&self) -> &str {
        match self {
            Self::ExpandDetail => {
                "Expand the result with more detail. Fill optional fields that the input \
                 supports and make descriptions more complete."
            }
            Self::IncreaseSpecificity => {
                "Make every value more specific. Replace vague or generic values with \
                 precise ones taken from the input."
            }
            Self::ImproveStructure => {
                "Improve how the information is organized. Split combined values into the \
                 fields the schema provides and remove duplication."
            }
            Self::Custom(instruction) => instruction,
        }
    }
}

/// Scores how much better `candidate` is than `baseline`, in `[0, 1]`.
pub trait ImprovementEvaluator: Send + Sync {
    fn score(&self, baseline: &Value, candidate: &Value) -> f64;
}

/// Rewards candidates that add content.
///
/// Combines growth in content weight with the size of the structural diff.
/// Candidates that remove content score zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletenessEvaluator;

impl CompletenessEvaluator {
    const GROWTH_WEIGHT: f64 = 0.7;
    const CHANGE_WEIGHT: f64 = 0.3;
}

impl ImprovementEvaluator for CompletenessEvaluator {
    fn score(&self, baseline: &Value, candidate: &Value) -> f64 {
        if baseline == candidate {
            return 0.0;
        }

        let before = content_weight(baseline);
        let after = content_weight(candidate);
        if after <= before {
            return 0.0;
        }

        let growth = (after - before) / after;
        let operations = json_patch::diff(baseline, candidate).0.len() as f64;
        let leaves = leaf_count(baseline).max(1) as f64;
        let change = (operations / leaves).min(1.0);

        (Self::GROWTH_WEIGHT * growth + Self::CHANGE_WEIGHT * change).clamp(0.0, 1.0)
    }
}

/// Non-empty leaves count once, long strings count for more.
fn content_weight(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(_) | Value::Number(_) => 1.0,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => 1.0 + s.chars().count() as f64 / 40.0,
        Value::Array(items) => items.iter().map(content_weight).sum(),
        Value::Object(map) => map.values().map(content_weight).sum(),
    }
}

fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.iter().map(leaf_count).sum(),
        Value::Object(map) => map.values().map(leaf_count).sum(),
        _ => 1,
    }
}

/// Settings for enhancement rounds.
#[derive(Clone)]
pub struct EnhancementConfig {
    pub rounds: usize,
    pub strategy: EnhancementStrategy,
    /// Minimum score in `[0, 1]` a candidate needs to replace the current best.
    pub min_improvement: f64,
    pub evaluator: Arc<dyn ImprovementEvaluator>,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            rounds: 1,
            strategy: EnhancementStrategy::default(),
            min_improvement: 0.2,
            evaluator: Arc::new(CompletenessEvaluator),
        }
    }
}

impl fmt::Debug for EnhancementConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnhancementConfig")
            .field("rounds", &self.rounds)
            .field("strategy", &self.strategy)
            .field("min_improvement", &self.min_improvement)
            .finish_non_exhaustive()
    }
}

impl EnhancementConfig {
    pub fn new(rounds: usize) -> Self {
        Self {
            rounds,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: EnhancementStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_min_improvement(mut self, min_improvement: f64) -> Self {
        self.min_improvement = min_improvement;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ImprovementEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}

/// Result of the enhancement phase.
#[derive(Debug, Clone)]
pub struct EnhancementOutcome<T> {
    pub value: T,
    /// Rounds that issued a provider call, successful or not.
    pub attempts_made: usize,
    pub accepted_rounds: usize,
    pub token_usage: TokenUsage,
    pub errors: Vec<PersuaderError>,
}

/// Run the configured rounds starting from a validated `baseline`.
#[instrument(skip_all, fields(rounds = enhancement.rounds, strategy = ?enhancement.strategy))]
pub async fn run_enhancement<T>(
    config: &ExecutionConfig<T>,
    enhancement: &EnhancementConfig,
    provider: &dyn Provider,
    recorder: &SessionMetricsRecorder,
    session: Option<&crate::session::ResolvedSession>,
    baseline: T,
) -> EnhancementOutcome<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut best = baseline;
    let mut best_value = match serde_json::to_value(&best) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "Baseline could not be serialized, skipping enhancement");
            return EnhancementOutcome {
                value: best,
                attempts_made: 0,
                accepted_rounds: 0,
                token_usage: TokenUsage::default(),
                errors: Vec::new(),
            };
        }
    };

    let mut attempts_made = 0;
    let mut accepted_rounds = 0;
    let mut token_usage = TokenUsage::default();
    let mut errors = Vec::new();
    let request = config.prompt_request();
    let provider_session = session.and_then(|s| s.provider_session_id());

    for round in 1..=enhancement.rounds {
        let prompt = build_enhancement_prompt(&request, &best_value, &enhancement.strategy, round)
            .combined();
        let started = Instant::now();
        attempts_made += 1;

        let response = provider
            .send_prompt(provider_session, &prompt, &config.provider_options)
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(round, error = %err, "Enhancement round failed at the provider");
                let err = PersuaderError::from(err);
                record(recorder, session, AttemptRecord::failure(round, elapsed, None, &err)).await;
                errors.push(err);
                continue;
            }
        };

        let usage = response
            .token_usage
            .unwrap_or_else(|| TokenUsage::estimated(&prompt, &response.content));
        token_usage += usage;

        let candidate = match validate_json_with(&config.schema, &response.content, config.extraction)
            .into_result()
        {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(round, failure_mode = %err.failure_mode, "Enhancement candidate failed validation");
                let err = PersuaderError::from(err);
                record(recorder, session, AttemptRecord::failure(round, elapsed, Some(usage), &err))
                    .await;
                errors.push(err);
                continue;
            }
        };
        record(recorder, session, AttemptRecord::success(round, elapsed, Some(usage))).await;

        let candidate_value = match serde_json::to_value(&candidate) {
            Ok(value) => value,
            Err(err) => {
                warn!(round, error = %err, "Enhancement candidate could not be serialized");
                continue;
            }
        };

        let score = enhancement.evaluator.score(&best_value, &candidate_value);
        if score >= enhancement.min_improvement {
            info!(round, score, "Accepted enhancement");
            best = candidate;
            best_value = candidate_value;
            accepted_rounds += 1;
        } else {
            debug!(round, score, threshold = enhancement.min_improvement, "Kept current best");
        }
    }

    EnhancementOutcome {
        value: best,
        attempts_made,
        accepted_rounds,
        token_usage,
        errors,
    }
}

async fn record(
    recorder: &SessionMetricsRecorder,
    session: Option<&crate::session::ResolvedSession>,
    record: AttemptRecord,
) {
    if let Some(session) = session {
        if let Err(err) = recorder.record_attempt(&session.id, &record).await {
            warn!(error = %err, "Failed to record enhancement attempt");
        }
    }
}
