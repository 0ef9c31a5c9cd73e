//! Prompt assembly and attempt-driven escalation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enhancement::EnhancementStrategy;
use crate::schema::synthesize_example;

/// First attempt that demands JSON with no explanatory text.
pub const IMPORTANT_ATTEMPT_THRESHOLD: usize = 2;
/// First attempt that demands output framed exactly by `{` and `}`.
pub const CRITICAL_ATTEMPT_THRESHOLD: usize = 3;

const JSON_ONLY_REMINDER: &str =
    "Respond with JSON only. Do not include markdown, code fences or commentary.";

/// How bluntly the model is told to comply. Ordered from mildest to strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Standard,
    Important,
    Critical,
}

impl UrgencyLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Important => "important",
            Self::Critical => "critical",
        }
    }
}

/// Urgency for a 1-indexed attempt number. Monotonic in `attempt`.
pub fn urgency_for(attempt: usize) -> UrgencyLevel {
    if attempt >= CRITICAL_ATTEMPT_THRESHOLD {
        UrgencyLevel::Critical
    } else if attempt >= IMPORTANT_ATTEMPT_THRESHOLD {
        UrgencyLevel::Important
    } else {
        UrgencyLevel::Standard
    }
}

/// The pieces of a prompt before they are flattened for a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptParts {
    pub system_prompt: String,
    pub user_prompt: String,
    pub examples: Vec<String>,
    pub error_context: Option<String>,
    pub additional_context: Option<String>,
}

impl PromptParts {
    /// Render the single prompt string sent to providers.
    pub fn combined(&self) -> String {
        let mut sections = vec![self.system_prompt.clone()];

        if let Some(extra) = &self.additional_context {
            sections.push(format!("ADDITIONAL CONTEXT:\n{extra}"));
        }
        for (idx, example) in self.examples.iter().enumerate() {
            let label = if self.examples.len() == 1 {
                "EXAMPLE OUTPUT".to_string()
            } else {
                format!("EXAMPLE OUTPUT {}", idx + 1)
            };
            sections.push(format!("{label}:\n{example}"));
        }
        sections.push(self.user_prompt.clone());

        sections.join("\n\n")
    }
}

/// Everything the builder needs for one attempt.
#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub schema: &'a Value,
    pub input: &'a Value,
    pub context: Option<&'a str>,
    pub lens: Option<&'a str>,
    pub example_output: Option<&'a Value>,
    pub attempt: usize,
}

impl<'a> PromptRequest<'a> {
    pub fn new(schema: &'a Value, input: &'a Value) -> Self {
        Self {
            schema,
            input,
            context: None,
            lens: None,
            example_output: None,
            attempt: 1,
        }
    }

    pub fn context(mut self, context: Option<&'a str>) -> Self {
        self.context = context;
        self
    }

    pub fn lens(mut self, lens: Option<&'a str>) -> Self {
        self.lens = lens;
        self
    }

    pub fn example_output(mut self, example: Option<&'a Value>) -> Self {
        self.example_output = example;
        self
    }

    pub fn attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt.max(1);
        self
    }
}

/// Build the prompt for one attempt.
pub fn build_prompt(request: &PromptRequest<'_>) -> PromptParts {
    let urgency = urgency_for(request.attempt);
    let example = request
        .example_output
        .cloned()
        .or_else(|| synthesize_example(request.schema));

    let mut system = String::from(
        "You are a precise data transformation engine. You read the input and produce \
         structured JSON that conforms exactly to the provided JSON Schema.",
    );
    if let Some(context) = request.context {
        system.push_str(&format!("\n\nCONTEXT:\n{context}"));
    }
    if let Some(lens) = request.lens {
        system.push_str(&format!("\n\nANALYSIS LENS:\n{lens}"));
    }
    system.push_str(&format!("\n\nJSON SCHEMA:\n{}", pretty(request.schema)));
    system.push_str("\n\n");
    system.push_str(output_rules(urgency));

    let user = format!(
        "INPUT:\n{}\n\n{JSON_ONLY_REMINDER}",
        render_input(request.input)
    );

    PromptParts {
        system_prompt: system,
        user_prompt: user,
        examples: example.iter().map(pretty).collect(),
        error_context: None,
        additional_context: None,
    }
}

/// Return a copy of `parts` carrying the previous attempt's feedback.
pub fn augment_prompt_with_errors(parts: &PromptParts, feedback: &str) -> PromptParts {
    let mut next = parts.clone();
    next.user_prompt = format!(
        "{}\n\nPREVIOUS ATTEMPT FAILED VALIDATION:\n{feedback}\n\n\
         Fix every issue listed above and return the corrected JSON.",
        parts.user_prompt
    );
    next.error_context = Some(feedback.to_string());
    next
}

/// Prompt for a post-success refinement round.
pub fn build_enhancement_prompt(
    request: &PromptRequest<'_>,
    current_best: &Value,
    strategy: &EnhancementStrategy,
    round: usize,
) -> PromptParts {
    let mut system = String::from(
        "You are improving a JSON result that already satisfies its JSON Schema. \
         Keep it valid against the schema while making it better.",
    );
    if let Some(context) = request.context {
        system.push_str(&format!("\n\nCONTEXT:\n{context}"));
    }
    if let Some(lens) = request.lens {
        system.push_str(&format!("\n\nANALYSIS LENS:\n{lens}"));
    }
    system.push_str(&format!("\n\nJSON SCHEMA:\n{}", pretty(request.schema)));
    system.push_str("\n\n");
    system.push_str(output_rules(UrgencyLevel::Important));

    let user = format!(
        "ORIGINAL INPUT:\n{}\n\nCURRENT RESULT:\n{}\n\nIMPROVEMENT GOAL (round {round}):\n{}\n\n\
         Return the complete improved JSON, not a diff. {JSON_ONLY_REMINDER}",
        render_input(request.input),
        pretty(current_best),
        strategy.instruction()
    );

    PromptParts {
        system_prompt: system,
        user_prompt: user,
        examples: Vec::new(),
        error_context: None,
        additional_context: None,
    }
}

fn output_rules(urgency: UrgencyLevel) -> &'static str {
    match urgency {
        UrgencyLevel::Standard => {
            "OUTPUT: Respond with JSON that matches the schema. \
             Avoid adding commentary around the JSON."
        }
        UrgencyLevel::Important => {
            "IMPORTANT: Respond with ONLY valid JSON that matches the schema. \
             No explanatory text, no markdown, no code fences."
        }
        UrgencyLevel::Critical => {
            "CRITICAL: Your response must start with { and end with }. \
             Output the JSON object alone with zero text before or after it."
        }
    }
}

fn render_input(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => pretty(other),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "number"}},
            "required": ["name", "age"]
        })
    }

    #[test]
    fn urgency_thresholds_are_monotonic() {
        assert_eq!(urgency_for(0), UrgencyLevel::Standard);
        assert_eq!(urgency_for(1), UrgencyLevel::Standard);
        assert_eq!(urgency_for(2), UrgencyLevel::Important);
        assert_eq!(urgency_for(3), UrgencyLevel::Critical);
        assert_eq!(urgency_for(9), UrgencyLevel::Critical);
        assert!((1..10).all(|n| urgency_for(n) <= urgency_for(n + 1)));
    }

    #[test]
    fn system_prompt_escalates_by_attempt() {
        let schema = schema();
        let input = json!("Al is thirty");

        let first = build_prompt(&PromptRequest::new(&schema, &input));
        assert!(!first.system_prompt.contains("IMPORTANT"));
        assert!(!first.system_prompt.contains("CRITICAL"));

        let second = build_prompt(&PromptRequest::new(&schema, &input).attempt(2));
        assert!(second.system_prompt.contains("No explanatory text"));

        let third = build_prompt(&PromptRequest::new(&schema, &input).attempt(3));
        assert!(third.system_prompt.contains("must start with { and end with }"));
    }

    #[test]
    fn user_prompt_embeds_input_verbatim() {
        let schema = schema();
        let raw = json!("  Al, age unknown  ");
        let parts = build_prompt(&PromptRequest::new(&schema, &raw));
        assert!(parts.user_prompt.contains("  Al, age unknown  "));
        assert!(parts.user_prompt.contains(JSON_ONLY_REMINDER));

        let structured = json!({"name": "Al"});
        let parts = build_prompt(&PromptRequest::new(&schema, &structured));
        assert!(parts.user_prompt.contains("\"name\": \"Al\""));
    }

    #[test]
    fn example_is_synthesized_when_missing() {
        let schema = schema();
        let input = json!("x");
        let parts = build_prompt(&PromptRequest::new(&schema, &input));
        assert_eq!(parts.examples.len(), 1);
        assert!(parts.examples[0].contains("\"name\""));

        let explicit = json!({"name": "Bo", "age": 4});
        let parts = build_prompt(&PromptRequest::new(&schema, &input).example_output(Some(&explicit)));
        assert!(parts.examples[0].contains("Bo"));
    }

    #[test]
    fn example_is_omitted_when_synthesis_fails() {
        let schema = json!({"type": "mystery"});
        let input = json!("x");
        let parts = build_prompt(&PromptRequest::new(&schema, &input));
        assert!(parts.examples.is_empty());
    }

    #[test]
    fn context_and_lens_land_in_system_prompt() {
        let schema = schema();
        let input = json!("x");
        let parts = build_prompt(
            &PromptRequest::new(&schema, &input)
                .context(Some("HR records"))
                .lens(Some("focus on ages")),
        );
        assert!(parts.system_prompt.contains("CONTEXT:\nHR records"));
        assert!(parts.system_prompt.contains("ANALYSIS LENS:\nfocus on ages"));
    }

    #[test]
    fn augment_returns_new_parts_without_touching_input() {
        let schema = schema();
        let input = json!("x");
        let parts = build_prompt(&PromptRequest::new(&schema, &input));
        let before = parts.clone();

        let augmented = augment_prompt_with_errors(&parts, "age must be a number");

        assert_eq!(parts, before);
        assert!(augmented.user_prompt.contains("PREVIOUS ATTEMPT FAILED VALIDATION"));
        assert!(augmented.user_prompt.contains("age must be a number"));
        assert_eq!(augmented.error_context.as_deref(), Some("age must be a number"));
        assert!(augmented.combined().contains("age must be a number"));
    }

    #[test]
    fn enhancement_prompt_references_current_best() {
        let schema = schema();
        let input = json!("Al is thirty");
        let best = json!({"name": "Al", "age": 30});
        let parts = build_enhancement_prompt(
            &PromptRequest::new(&schema, &input),
            &best,
            &EnhancementStrategy::ExpandDetail,
            2,
        );

        assert!(parts.user_prompt.contains("CURRENT RESULT"));
        assert!(parts.user_prompt.contains("\"age\": 30"));
        assert!(parts.user_prompt.contains("round 2"));
    }
}
