//! Render validation failures into correction text for the next attempt.
//!
//! The returned text is the only thing the model learns about its previous
//! mistake, so it repeats everything needed to fix it.

use crate::error::ValidationError;
use crate::prompt::{urgency_for, UrgencyLevel};

/// Characters of the previous response echoed back to the model.
const RAW_SNIPPET_CHARS: usize = 500;

/// Delimiters around text echoed verbatim from the model's own response.
const ECHO_START: &str = "<<<PREVIOUS RESPONSE";
const ECHO_END: &str = "PREVIOUS RESPONSE>>>";

/// Build the feedback block for a failed attempt.
///
/// `attempt` is the number of the attempt that will receive the feedback.
#[must_use]
pub fn format_validation_error_feedback(error: &ValidationError, attempt: usize) -> String {
    let urgency = urgency_for(attempt);
    if error.is_parse_failure() {
        parse_failure_feedback(error, urgency)
    } else {
        schema_failure_feedback(error, urgency)
    }
}

fn parse_failure_feedback(error: &ValidationError, urgency: UrgencyLevel) -> String {
    let mut feedback = String::new();

    feedback.push_str(match urgency {
        UrgencyLevel::Standard => {
            "Your previous response could not be parsed as JSON. \
             Please respond with valid JSON that matches the schema."
        }
        UrgencyLevel::Important => {
            "IMPORTANT: Your previous response was not valid JSON. \
             Respond with ONLY the JSON value. No explanatory text, no markdown, no code fences."
        }
        UrgencyLevel::Critical => {
            "CRITICAL: Your previous responses were not valid JSON. \
             Your response must start with { and end with }. \
             Any text outside the JSON object will cause a failure."
        }
    });

    feedback.push_str("\n\nParse error: ");
    feedback.push_str(&error.message);

    feedback.push_str("\n\nYour response (truncated), quoted between the markers below:\n");
    feedback.push_str(ECHO_START);
    feedback.push('\n');
    feedback.push_str(&truncate_chars(&error.raw_value, RAW_SNIPPET_CHARS));
    feedback.push('\n');
    feedback.push_str(ECHO_END);

    feedback
}

fn schema_failure_feedback(error: &ValidationError, urgency: UrgencyLevel) -> String {
    let structured = &error.structured_feedback;
    let mut feedback = String::new();

    feedback.push_str(&structured.problem_summary);

    if !error.issues.is_empty() {
        feedback.push_str("\n\nValidation errors:");
        for issue in &error.issues {
            feedback.push_str(&format!("\n- {}: {}", issue.path_display(), issue.message));
        }
    }

    if !structured.field_corrections.is_empty() {
        feedback.push_str("\n\nField corrections:");
        for (path, correction) in &structured.field_corrections {
            feedback.push_str(&format!("\n- Field {path}: {correction}"));
        }
    }

    if !structured.suggestions.is_empty() {
        feedback.push_str("\n\nGeneral suggestions:");
        for suggestion in &structured.suggestions {
            feedback.push_str(&format!("\n- {suggestion}"));
        }
    }

    if urgency == UrgencyLevel::Critical {
        feedback.push_str(
            "\n\nFINAL ATTEMPT: Fix every issue above. Return only the corrected JSON object, \
             starting with { and ending with }.",
        );
    }

    feedback
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}... [truncated, {total} total chars]")
    }
}
