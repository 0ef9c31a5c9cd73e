use persuader::prelude::*;
use persuader::{ErrorKind, PersuaderError};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
struct Person {
    name: String,
    age: f64,
}

fn quick_persuader(provider: MockProvider) -> Persuader {
    Persuader::builder(provider).without_backoff().build()
}

fn options(retries: usize) -> Options<Person> {
    Options::new(Schema::of().unwrap(), json!({"name": "Al"})).retries(retries)
}

#[tokio::test]
async fn recovers_from_parse_and_type_failures() {
    let provider = Arc::new(MockProvider::with_responses([
        "not json",
        r#"{"name":"Al","age":"30"}"#,
        r#"{"name":"Al","age":30}"#,
    ]));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    let result = persuader.persuade(options(3)).await;

    assert!(result.is_ok());
    assert_eq!(result.attempts(), 3);
    assert_eq!(
        result.value(),
        Some(&Person {
            name: "Al".into(),
            age: 30.0
        })
    );

    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[0].contains("PREVIOUS ATTEMPT FAILED VALIDATION"));
    assert!(prompts[1].contains("PREVIOUS ATTEMPT FAILED VALIDATION"));
    assert!(prompts[2].contains("age"));
}

#[tokio::test]
async fn zero_retries_stops_after_one_parse_failure() {
    let result = quick_persuader(MockProvider::always(MockReply::content("still not json")))
        .persuade(options(0))
        .await;

    assert!(!result.is_ok());
    assert_eq!(result.attempts(), 1);
    assert_eq!(
        result.error().and_then(PersuaderError::failure_mode),
        Some(FailureMode::JsonParseFailure)
    );
}

#[tokio::test]
async fn network_error_then_success() {
    let provider = MockProvider::new([
        MockReply::failure("network error: connection reset"),
        MockReply::content(r#"{"name":"Al","age":30}"#),
    ]);

    let result = quick_persuader(provider).persuade(options(1)).await;

    assert!(result.is_ok());
    assert_eq!(result.attempts(), 2);
}

#[tokio::test]
async fn always_invalid_output_uses_every_attempt() {
    for retries in 0..4 {
        let provider = Arc::new(MockProvider::always(MockReply::content(r#"{"name":"Al"}"#)));
        let persuader = PersuaderBuilder::from_arc(provider.clone())
            .without_backoff()
            .build();

        let result = persuader.persuade(options(retries)).await;

        assert!(!result.is_ok());
        assert_eq!(result.attempts(), retries + 1);
        assert_eq!(provider.call_count(), retries + 1);
        assert_eq!(result.all_errors().len(), retries + 1);
        assert_eq!(
            result.error().and_then(PersuaderError::failure_mode),
            Some(FailureMode::MissingRequiredFields)
        );
    }
}

#[tokio::test]
async fn parse_feedback_demands_braces_by_third_attempt() {
    let provider = Arc::new(MockProvider::always(MockReply::content("Sure! Here it is.")));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    persuader.persuade(options(2)).await;

    let prompts = provider.prompts();
    assert!(!prompts[0].contains("CRITICAL"));
    assert!(prompts[2].contains("start with { and end with }"));
}

#[tokio::test]
async fn unauthorized_provider_still_uses_every_attempt() {
    let provider = Arc::new(MockProvider::always(MockReply::failure_with_status(
        "invalid api key",
        401,
    )));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    let result = persuader.persuade(options(3)).await;

    assert_eq!(result.attempts(), 4);
    assert_eq!(provider.call_count(), 4);
    assert_eq!(result.all_errors().len(), 4);
    assert_eq!(result.error().map(PersuaderError::kind), Some(ErrorKind::Provider));
}

#[tokio::test]
async fn generic_provider_failure_then_success() {
    let provider = MockProvider::new([
        MockReply::failure("claude cli exited with code 1"),
        MockReply::content(r#"{"name":"Al","age":30}"#),
    ]);

    let result = quick_persuader(provider).persuade(options(2)).await;

    assert!(result.is_ok());
    assert_eq!(result.attempts(), 2);
}

#[tokio::test]
async fn code_fenced_output_needs_opt_in() {
    let fenced = "```json\n{\"name\":\"Al\",\"age\":30}\n```";

    let strict = quick_persuader(MockProvider::always(MockReply::content(fenced)))
        .persuade(options(0))
        .await;
    assert!(!strict.is_ok());

    let lenient = quick_persuader(MockProvider::always(MockReply::content(fenced)))
        .persuade(options(0).extraction(JsonExtraction::StripCodeFences))
        .await;
    assert!(lenient.is_ok());
}

#[tokio::test]
async fn configuration_errors_consume_no_attempts() {
    let provider = Arc::new(MockProvider::always(MockReply::content("{}")));
    let persuader = PersuaderBuilder::from_arc(provider.clone()).build();

    let result = persuader.persuade(options(0).session_id("   ")).await;

    assert_eq!(result.attempts(), 0);
    assert_eq!(
        result.error().map(PersuaderError::kind),
        Some(ErrorKind::Configuration)
    );
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn context_and_lens_reach_the_provider() {
    let provider = Arc::new(MockProvider::with_responses([r#"{"name":"Al","age":30}"#]));
    let persuader = PersuaderBuilder::from_arc(provider.clone())
        .without_backoff()
        .build();

    persuader
        .persuade(
            options(0)
                .context("Employee directory")
                .lens("Ages are in years"),
        )
        .await;

    let prompt = &provider.prompts()[0];
    assert!(prompt.contains("Employee directory"));
    assert!(prompt.contains("Ages are in years"));
    assert!(prompt.contains("JSON SCHEMA"));
}
