//! Parse model text, validate it against a schema, and explain failures.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{FailureMode, RetryStrategy, StructuredFeedback, ValidationCode, ValidationError};
use crate::schema::{IssueCode, Schema, SchemaIssue};

/// Suggestions appended to every schema failure.
pub const GENERAL_SUGGESTIONS: [&str; 3] = [
    "Use the exact types declared in the schema: numbers unquoted, booleans as true/false, strings quoted.",
    "Use the exact field names from the schema, including capitalization and underscores.",
    "Match the exact structure of the schema: no extra wrapper objects and no missing nesting levels.",
];

const REFUSAL_MARKERS: [&str; 6] = [
    "i cannot",
    "i can't",
    "i'm sorry",
    "i am sorry",
    "i'm unable",
    "as an ai",
];

/// How raw model text is turned into JSON before parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonExtraction {
    /// Parse the trimmed text as-is.
    #[default]
    Strict,
    /// Strip Markdown code fences and surrounding prose first.
    StripCodeFences,
}

/// Outcome of validating one response. Exactly one side is populated.
#[derive(Debug, Clone)]
pub enum ValidationResult<T> {
    Valid(T),
    Invalid(ValidationError),
}

impl<T> ValidationResult<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            Self::Valid(_) => None,
            Self::Invalid(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<T, ValidationError> {
        match self {
            Self::Valid(value) => Ok(value),
            Self::Invalid(err) => Err(err),
        }
    }
}

/// Validate raw model text against `schema`.
pub fn validate_json<T: DeserializeOwned>(schema: &Schema<T>, raw: &str) -> ValidationResult<T> {
    validate_json_with(schema, raw, JsonExtraction::Strict)
}

/// Validate raw model text, choosing how JSON is located in the text.
pub fn validate_json_with<T: DeserializeOwned>(
    schema: &Schema<T>,
    raw: &str,
    extraction: JsonExtraction,
) -> ValidationResult<T> {
    let candidate = match extraction {
        JsonExtraction::Strict => raw.trim().to_string(),
        JsonExtraction::StripCodeFences => clean_json_text(raw),
    };

    if candidate.is_empty() {
        return ValidationResult::Invalid(parse_failure(raw, "response was empty".to_string()));
    }

    let parsed: Value = match serde_json::from_str(&candidate) {
        Ok(value) => value,
        Err(err) => {
            trace!(raw = %raw, "Response is not valid JSON");
            return ValidationResult::Invalid(parse_failure(raw, err.to_string()));
        }
    };

    let issues = schema.check(&parsed);
    if !issues.is_empty() {
        debug!(issues = issues.len(), schema = schema.name(), "Schema validation failed");
        return ValidationResult::Invalid(schema_failure(raw, parsed, issues, schema.document()));
    }

    match serde_json::from_value::<T>(parsed.clone()) {
        Ok(value) => ValidationResult::Valid(value),
        Err(err) => {
            // The JSON Schema accepted it but the Rust type did not.
            let issue = SchemaIssue::new(Vec::new(), IssueCode::Custom, err.to_string());
            ValidationResult::Invalid(schema_failure(raw, parsed, vec![issue], schema.document()))
        }
    }
}

fn parse_failure(raw: &str, detail: String) -> ValidationError {
    let message = format!("Response is not valid JSON: {detail}");
    ValidationError {
        message: message.clone(),
        code: ValidationCode::JsonParse,
        failure_mode: FailureMode::JsonParseFailure,
        retry_strategy: RetryStrategy::DemandJsonFormat,
        issues: Vec::new(),
        raw_value: raw.to_string(),
        parsed_value: None,
        structured_feedback: StructuredFeedback {
            problem_summary: message,
            specific_issues: vec![format!("JSON parse error: {detail}")],
            correction_instructions: vec![
                "Return a single JSON value with no surrounding text or code fences.".to_string(),
            ],
            field_corrections: BTreeMap::new(),
            suggestions: Vec::new(),
        },
    }
}

fn schema_failure(
    raw: &str,
    parsed: Value,
    issues: Vec<SchemaIssue>,
    schema: &Value,
) -> ValidationError {
    let failure_mode = classify_failure_mode(&issues, &parsed, schema);
    let structured_feedback = build_structured_feedback(&issues, failure_mode);

    ValidationError {
        message: format!(
            "Schema validation failed with {} issue(s) ({failure_mode})",
            issues.len()
        ),
        code: ValidationCode::SchemaValidation,
        failure_mode,
        retry_strategy: RetryStrategy::for_mode(failure_mode),
        issues,
        raw_value: raw.to_string(),
        parsed_value: Some(parsed),
        structured_feedback,
    }
}

/// Pick the failure mode that best explains a set of schema issues.
pub fn classify_failure_mode(issues: &[SchemaIssue], parsed: &Value, schema: &Value) -> FailureMode {
    if issues.is_empty() {
        return FailureMode::SchemaValidation;
    }

    if issues
        .iter()
        .any(|issue| issue.is_root() && issue.code == IssueCode::InvalidType)
    {
        return match parsed {
            Value::String(text) if looks_like_refusal(text) => FailureMode::ProviderRefusal,
            _ => FailureMode::WrongFormat,
        };
    }

    if let (Value::Object(object), Some(known)) = (
        parsed,
        schema.get("properties").and_then(Value::as_object),
    ) {
        if object.is_empty() {
            return FailureMode::IncompleteResponse;
        }
        if !known.is_empty() && object.keys().all(|key| !known.contains_key(key)) {
            return FailureMode::ContextConfusion;
        }
    }

    let has = |code: IssueCode| issues.iter().any(|issue| issue.code == code);
    let all = |codes: &[IssueCode]| issues.iter().all(|issue| codes.contains(&issue.code));

    if has(IssueCode::UnrecognizedKeys) && has(IssueCode::MissingField) {
        return FailureMode::HallucinatedStructure;
    }
    if all(&[IssueCode::MissingField]) {
        return FailureMode::MissingRequiredFields;
    }
    if all(&[IssueCode::InvalidType]) {
        return FailureMode::FieldTypeMismatch;
    }
    if all(&[IssueCode::UnrecognizedKeys]) {
        return FailureMode::ExtraUnknownFields;
    }
    if all(&[
        IssueCode::TooSmall,
        IssueCode::TooBig,
        IssueCode::InvalidEnumValue,
        IssueCode::InvalidString,
    ]) {
        return FailureMode::ConstraintViolation;
    }
    if issues.iter().any(|issue| issue.path.len() > 1) {
        return FailureMode::NestedValidation;
    }
    FailureMode::SchemaValidation
}

fn looks_like_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn build_structured_feedback(issues: &[SchemaIssue], mode: FailureMode) -> StructuredFeedback {
    let mut specific_issues = Vec::with_capacity(issues.len());
    let mut field_corrections = BTreeMap::new();

    for issue in issues {
        specific_issues.push(suggestion_for(issue));
        for (path, correction) in corrections_for(issue) {
            field_corrections.insert(path, correction);
        }
    }

    let correction_instructions = field_corrections
        .iter()
        .map(|(path, correction)| format!("Field {path}: {correction}"))
        .collect();

    StructuredFeedback {
        problem_summary: format!(
            "The JSON did not match the schema: {} issue(s) found ({}).",
            issues.len(),
            mode
        ),
        specific_issues,
        correction_instructions,
        field_corrections,
        suggestions: GENERAL_SUGGESTIONS.iter().map(|s| s.to_string()).collect(),
    }
}

/// Human-readable suggestion for a single issue.
pub fn suggestion_for(issue: &SchemaIssue) -> String {
    let path = issue.path_display();
    match issue.code {
        IssueCode::MissingField => match &issue.expected {
            Some(expected) => format!("Add the required field \"{path}\" ({expected})."),
            None => format!("Add the required field \"{path}\"."),
        },
        IssueCode::InvalidType => format!(
            "Field \"{path}\" must be {}, but received {}.",
            issue.expected.as_deref().unwrap_or("a different type"),
            issue.received.as_deref().unwrap_or("an unexpected type")
        ),
        IssueCode::TooSmall => format!(
            "Field \"{path}\" is too small{}.",
            limit_suffix(issue.expected.as_deref())
        ),
        IssueCode::TooBig => format!(
            "Field \"{path}\" is too large{}.",
            limit_suffix(issue.expected.as_deref())
        ),
        IssueCode::InvalidEnumValue => match &issue.expected {
            Some(options) => format!("Field \"{path}\" must be one of {options}."),
            None => format!("Field \"{path}\" must use one of the allowed values."),
        },
        IssueCode::UnrecognizedKeys if !issue.keys.is_empty() => format!(
            "Remove unrecognized field(s) {} from \"{path}\".",
            issue
                .keys
                .iter()
                .map(|k| format!("\"{k}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        IssueCode::InvalidUnion => {
            format!("Field \"{path}\" must match exactly one of the allowed shapes.")
        }
        IssueCode::InvalidString => match &issue.expected {
            Some(format) => format!("Field \"{path}\" must match the format \"{format}\"."),
            None => format!("Field \"{path}\" has an invalid string format."),
        },
        IssueCode::UnrecognizedKeys | IssueCode::Custom => issue.message.clone(),
    }
}

fn limit_suffix(limit: Option<&str>) -> String {
    limit.map(|l| format!(" (schema requires {l})")).unwrap_or_default()
}

/// Path-keyed fixes for one issue. Empty when no concrete fix can be stated.
fn corrections_for(issue: &SchemaIssue) -> Vec<(String, String)> {
    let path = issue.path_display();
    match issue.code {
        IssueCode::InvalidType => vec![(
            path,
            format!(
                "change from {} to {}",
                issue.received.as_deref().unwrap_or("current type"),
                issue.expected.as_deref().unwrap_or("the schema type")
            ),
        )],
        IssueCode::MissingField => vec![(
            path,
            match &issue.expected {
                Some(expected) => format!("add this required field ({expected})"),
                None => "add this required field".to_string(),
            },
        )],
        IssueCode::InvalidEnumValue => issue
            .expected
            .as_ref()
            .map(|options| vec![(path, format!("use one of {options}"))])
            .unwrap_or_default(),
        IssueCode::UnrecognizedKeys => issue
            .keys
            .iter()
            .map(|key| {
                let full = if issue.is_root() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                (full, "remove this field".to_string())
            })
            .collect(),
        IssueCode::TooSmall | IssueCode::TooBig => issue
            .expected
            .as_ref()
            .map(|limit| vec![(path, format!("adjust the value to satisfy {limit}"))])
            .unwrap_or_default(),
        IssueCode::InvalidUnion | IssueCode::InvalidString | IssueCode::Custom => Vec::new(),
    }
}

/// Strip Markdown code fences and prose around the JSON payload.
pub fn clean_json_text(text: &str) -> String {
    let text = text.trim();

    if let Some(start) = text.find("```") {
        if let Some(end) = text.rfind("```") {
            if start < end {
                if let Some(newline) = text[start..end].find('\n') {
                    let content_start = start + newline + 1;
                    if content_start < end {
                        return text[content_start..end].trim().to_string();
                    }
                }
            }
        }
    }

    if let Some(start) = text.find(['{', '[']) {
        if let Some(end) = text.rfind(['}', ']']) {
            if start <= end {
                return text[start..=end].to_string();
            }
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
    struct Person {
        name: String,
        age: f64,
    }

    fn person_schema() -> Schema<Person> {
        Schema::of().unwrap()
    }

    #[test]
    fn valid_json_returns_typed_value() {
        let result = validate_json(&person_schema(), r#"  {"name":"Al","age":30}  "#);
        let value = result.into_result().unwrap();
        assert_eq!(value, Person { name: "Al".into(), age: 30.0 });
    }

    #[test]
    fn revalidating_serialized_success_is_idempotent() {
        let schema = person_schema();
        let first = validate_json(&schema, r#"{"name":"Al","age":30}"#)
            .into_result()
            .unwrap();
        let again = validate_json(&schema, &serde_json::to_string(&first).unwrap())
            .into_result()
            .unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn non_json_is_a_parse_failure() {
        let err = validate_json(&person_schema(), "not json").into_result().unwrap_err();
        assert_eq!(err.code, ValidationCode::JsonParse);
        assert_eq!(err.failure_mode, FailureMode::JsonParseFailure);
        assert_eq!(err.retry_strategy, RetryStrategy::DemandJsonFormat);
        assert!(err.issues.is_empty());
        assert!(err.retryable());
    }

    #[test]
    fn whitespace_only_is_a_parse_failure() {
        let err = validate_json(&person_schema(), "   \n\t").into_result().unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::JsonParseFailure);
        assert!(err.message.contains("empty"));
    }

    #[test]
    fn type_mismatch_builds_field_correction() {
        let err = validate_json(&person_schema(), r#"{"name":"Al","age":"30"}"#)
            .into_result()
            .unwrap_err();

        assert_eq!(err.code, ValidationCode::SchemaValidation);
        assert_eq!(err.failure_mode, FailureMode::FieldTypeMismatch);
        assert_eq!(
            err.structured_feedback.field_corrections.get("age").map(String::as_str),
            Some("change from string to number")
        );
        assert!(err
            .structured_feedback
            .correction_instructions
            .contains(&"Field age: change from string to number".to_string()));
        assert_eq!(err.structured_feedback.suggestions.len(), 3);
    }

    #[test]
    fn missing_fields_are_classified() {
        let err = validate_json(&person_schema(), r#"{"name":"Al"}"#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::MissingRequiredFields);
        assert_eq!(err.retry_strategy, RetryStrategy::AddMissingFields);
        assert!(err.structured_feedback.specific_issues[0].contains("\"age\""));
    }

    #[test]
    fn empty_object_is_incomplete() {
        let err = validate_json(&person_schema(), "{}").into_result().unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::IncompleteResponse);
    }

    #[test]
    fn root_string_is_wrong_format_or_refusal() {
        let err = validate_json(&person_schema(), r#""Al is 30""#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::WrongFormat);

        let err = validate_json(&person_schema(), r#""I'm sorry, I cannot help with that""#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::ProviderRefusal);
    }

    #[test]
    fn unrelated_structure_is_context_confusion() {
        let err = validate_json(&person_schema(), r#"{"summary":"a person"}"#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::ContextConfusion);
    }

    #[test]
    fn extra_and_missing_keys_are_hallucinated_structure() {
        let schema = Schema::from_json(json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "number"}},
            "required": ["name", "age"],
            "additionalProperties": false
        }))
        .unwrap();

        let err = validate_json(&schema, r#"{"name":"Al","years":30}"#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::HallucinatedStructure);
        assert_eq!(
            err.structured_feedback.field_corrections.get("years").map(String::as_str),
            Some("remove this field")
        );

        let err = validate_json(&schema, r#"{"name":"Al","age":3,"years":30}"#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::ExtraUnknownFields);
    }

    #[test]
    fn constraint_violations_are_classified() {
        let schema = Schema::from_json(json!({
            "type": "object",
            "properties": {"score": {"type": "integer", "minimum": 1, "maximum": 5}},
            "required": ["score"]
        }))
        .unwrap();

        let err = validate_json(&schema, r#"{"score": 9}"#).into_result().unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::ConstraintViolation);
        assert!(err.structured_feedback.specific_issues[0].contains("too large"));
    }

    #[test]
    fn nested_mixed_issues_are_nested_validation() {
        let schema = Schema::from_json(json!({
            "type": "object",
            "properties": {
                "owner": {
                    "type": "object",
                    "properties": {"email": {"type": "string"}, "age": {"type": "integer"}},
                    "required": ["email"]
                }
            },
            "required": ["owner"]
        }))
        .unwrap();

        let err = validate_json(&schema, r#"{"owner": {"age": "old"}}"#)
            .into_result()
            .unwrap_err();
        assert_eq!(err.failure_mode, FailureMode::NestedValidation);
        assert!(err.structured_feedback.field_corrections.contains_key("owner.age"));
        assert!(err.structured_feedback.field_corrections.contains_key("owner.email"));
    }

    #[test]
    fn unknown_issue_code_falls_back_to_raw_message() {
        let issue = SchemaIssue::new(vec!["x".into()], IssueCode::Custom, "x is odd");
        assert_eq!(suggestion_for(&issue), "x is odd");
    }

    #[test]
    fn code_fences_are_only_stripped_when_requested() {
        let fenced = "Here you go:\n```json\n{\"name\":\"Al\",\"age\":30}\n```";
        assert!(!validate_json(&person_schema(), fenced).is_valid());
        assert!(validate_json_with(&person_schema(), fenced, JsonExtraction::StripCodeFences).is_valid());
    }
}
