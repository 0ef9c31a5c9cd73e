use persuader::prelude::*;
use persuader::ImprovementEvaluator;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
struct Profile {
    name: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    skills: Vec<String>,
}

const BASELINE: &str = r#"{"name":"Al","summary":"","skills":[]}"#;
const RICHER: &str = r#"{"name":"Al","summary":"Backend engineer focused on billing systems","skills":["rust","postgres"]}"#;

fn options(rounds: usize) -> Options<Profile> {
    Options::new(Schema::of().unwrap(), json!("Al is a backend engineer"))
        .retries(0)
        .enhancement(EnhancementConfig::new(rounds).with_min_improvement(0.2))
}

/// Scores every candidate the same, to pin acceptance behavior.
struct FixedScore(f64);

impl ImprovementEvaluator for FixedScore {
    fn score(&self, _baseline: &Value, _candidate: &Value) -> f64 {
        self.0
    }
}

#[tokio::test]
async fn richer_candidate_replaces_baseline() {
    let provider = Arc::new(MockProvider::with_responses([BASELINE, RICHER]));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    let result = persuader.persuade(options(1)).await;

    let profile = result.value().unwrap();
    assert_eq!(profile.skills, vec!["rust", "postgres"]);
    assert_eq!(result.attempts(), 2);
    assert!(provider.prompts()[1].contains("CURRENT RESULT"));
}

#[tokio::test]
async fn low_scoring_rounds_never_replace_best() {
    let provider = MockProvider::with_responses([BASELINE, RICHER, RICHER]);
    let persuader = Persuader::builder(provider).without_backoff().build();

    let config = EnhancementConfig::new(2)
        .with_min_improvement(0.5)
        .with_evaluator(Arc::new(FixedScore(0.49)));
    let result = persuader
        .persuade(options(2).enhancement(config))
        .await;

    let profile = result.value().unwrap();
    assert!(profile.skills.is_empty());
    assert_eq!(result.attempts(), 3);
}

#[tokio::test]
async fn invalid_enhancement_is_skipped_not_fatal() {
    let provider = MockProvider::with_responses([BASELINE, "garbage", RICHER]);
    let persuader = Persuader::builder(provider).without_backoff().build();

    let result = persuader.persuade(options(2)).await;

    assert!(result.is_ok());
    assert_eq!(result.attempts(), 3);
    assert_eq!(result.value().unwrap().skills.len(), 2);
}

#[tokio::test]
async fn provider_errors_in_rounds_still_count() {
    let provider = MockProvider::new([
        MockReply::content(BASELINE),
        MockReply::failure("service unavailable"),
    ]);
    let persuader = Persuader::builder(provider).without_backoff().build();

    let result = persuader.persuade(options(1)).await;

    assert!(result.is_ok());
    assert_eq!(result.attempts(), 2);
    assert_eq!(result.value().unwrap().name, "Al");
}

#[tokio::test]
async fn zero_rounds_skip_enhancement() {
    let provider = Arc::new(MockProvider::with_responses([BASELINE, RICHER]));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    let result = persuader.persuade(options(0)).await;

    assert_eq!(result.attempts(), 1);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn failed_base_loop_never_enhances() {
    let provider = Arc::new(MockProvider::always(MockReply::content("nope")));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    let result = persuader.persuade(options(3)).await;

    assert!(!result.is_ok());
    assert_eq!(result.attempts(), 1);
    assert_eq!(provider.call_count(), 1);
}
