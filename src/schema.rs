//! Schema handling: compile a JSON Schema once, report issues, synthesize examples.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ConfigurationError;

/// Maximum `$ref`/nesting depth followed while synthesizing examples.
const MAX_EXAMPLE_DEPTH: usize = 8;

/// Kind of schema violation, independent of the validator's own error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    MissingField,
    InvalidType,
    TooSmall,
    TooBig,
    InvalidEnumValue,
    UnrecognizedKeys,
    InvalidUnion,
    InvalidString,
    Custom,
}

/// One schema violation found in a parsed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaIssue {
    /// Path segments from the document root to the offending value.
    pub path: Vec<String>,
    pub code: IssueCode,
    pub message: String,
    pub expected: Option<String>,
    pub received: Option<String>,
    /// Offending keys for [`IssueCode::UnrecognizedKeys`].
    pub keys: Vec<String>,
}

impl SchemaIssue {
    pub fn new(path: Vec<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            path,
            code,
            message: message.into(),
            expected: None,
            received: None,
            keys: Vec::new(),
        }
    }

    /// Dot separated path, `root` for the document itself.
    pub fn path_display(&self) -> String {
        if self.path.is_empty() {
            "root".to_string()
        } else {
            self.path.join(".")
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

/// A compiled JSON Schema bound to the Rust type it validates.
pub struct Schema<T> {
    name: String,
    document: Arc<Value>,
    validator: Arc<jsonschema::Validator>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            document: Arc::clone(&self.document),
            validator: Arc::clone(&self.validator),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("document", &self.document)
            .finish()
    }
}

impl<T: JsonSchema> Schema<T> {
    /// Derive the schema from `T`'s `JsonSchema` implementation.
    pub fn of() -> Result<Self, ConfigurationError> {
        let generated = schemars::schema_for!(T);
        let document = serde_json::to_value(&generated).map_err(|e| {
            ConfigurationError::for_field("schema", format!("schema serialization failed: {e}"))
        })?;
        Self::named(T::schema_name().to_string(), document)
    }
}

impl Schema<Value> {
    /// Build a schema for dynamic data from a raw JSON Schema document.
    pub fn from_json(document: Value) -> Result<Self, ConfigurationError> {
        let name = document
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("DynamicSchema")
            .to_string();
        Self::named(name, document)
    }
}

impl<T> Schema<T> {
    /// Pair an explicit schema document with `T`.
    pub fn named(name: impl Into<String>, document: Value) -> Result<Self, ConfigurationError> {
        let validator = jsonschema::validator_for(&document).map_err(|e| {
            ConfigurationError::for_field("schema", format!("schema failed to compile: {e}"))
        })?;
        Ok(Self {
            name: name.into(),
            document: Arc::new(document),
            validator: Arc::new(validator),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }

    /// Collect every schema violation in `instance`.
    pub fn check(&self, instance: &Value) -> Vec<SchemaIssue> {
        self.validator
            .iter_errors(instance)
            .map(|err| {
                let instance_path = err.instance_path().to_string();
                let schema_path = err.schema_path().to_string();
                let message = err.to_string();
                classify_error(
                    err.kind(),
                    &instance_path,
                    &schema_path,
                    message,
                    &self.document,
                    instance,
                )
            })
            .collect()
    }

    /// Best-effort example value matching this schema.
    pub fn example(&self) -> Option<Value> {
        synthesize_example(&self.document)
    }
}

fn classify_error(
    kind: &ValidationErrorKind,
    instance_path: &str,
    schema_path: &str,
    message: String,
    document: &Value,
    instance: &Value,
) -> SchemaIssue {
    let path = pointer_segments(instance_path);
    let keyword_value = document.pointer(schema_path);

    match kind {
        ValidationErrorKind::Required { .. } => {
            let property = quoted_token(&message).unwrap_or_else(|| message.clone());
            let parent_schema = parent_pointer(schema_path);
            let expected = document
                .pointer(&format!(
                    "{parent_schema}/properties/{}/type",
                    escape_pointer(&property)
                ))
                .map(render_type);
            let mut full_path = path;
            full_path.push(property);
            let mut issue = SchemaIssue::new(full_path, IssueCode::MissingField, message);
            issue.expected = expected;
            issue.received = Some("missing".to_string());
            issue
        }
        ValidationErrorKind::Type { .. } => {
            let mut issue = SchemaIssue::new(path, IssueCode::InvalidType, message);
            issue.expected = keyword_value.map(render_type);
            issue.received = instance.pointer(instance_path).map(json_type_name);
            issue
        }
        ValidationErrorKind::Minimum { .. }
        | ValidationErrorKind::ExclusiveMinimum { .. }
        | ValidationErrorKind::MinLength { .. }
        | ValidationErrorKind::MinItems { .. }
        | ValidationErrorKind::MinProperties { .. } => {
            let mut issue = SchemaIssue::new(path, IssueCode::TooSmall, message);
            issue.expected = keyword_value.map(render_limit(schema_path));
            issue
        }
        ValidationErrorKind::Maximum { .. }
        | ValidationErrorKind::ExclusiveMaximum { .. }
        | ValidationErrorKind::MaxLength { .. }
        | ValidationErrorKind::MaxItems { .. }
        | ValidationErrorKind::MaxProperties { .. } => {
            let mut issue = SchemaIssue::new(path, IssueCode::TooBig, message);
            issue.expected = keyword_value.map(render_limit(schema_path));
            issue
        }
        ValidationErrorKind::Enum { .. } | ValidationErrorKind::Constant { .. } => {
            let mut issue = SchemaIssue::new(path, IssueCode::InvalidEnumValue, message);
            issue.expected = keyword_value.map(Value::to_string);
            issue.received = instance.pointer(instance_path).map(Value::to_string);
            issue
        }
        ValidationErrorKind::AdditionalProperties { .. } => {
            let keys = unexpected_keys(document, schema_path, instance.pointer(instance_path));
            let mut issue = SchemaIssue::new(path, IssueCode::UnrecognizedKeys, message);
            issue.keys = keys;
            issue
        }
        ValidationErrorKind::AnyOf { .. }
        | ValidationErrorKind::OneOfNotValid { .. }
        | ValidationErrorKind::OneOfMultipleValid { .. } => {
            SchemaIssue::new(path, IssueCode::InvalidUnion, message)
        }
        ValidationErrorKind::Format { .. } | ValidationErrorKind::Pattern { .. } => {
            let mut issue = SchemaIssue::new(path, IssueCode::InvalidString, message);
            issue.expected = keyword_value.and_then(Value::as_str).map(str::to_string);
            issue
        }
        _ => SchemaIssue::new(path, IssueCode::Custom, message),
    }
}

/// Render a limit keyword such as `minimum: 0` or `maxLength: 10`.
fn render_limit(schema_path: &str) -> impl Fn(&Value) -> String + '_ {
    move |limit| {
        let keyword = schema_path.rsplit('/').next().unwrap_or("limit");
        format!("{keyword} {limit}")
    }
}

fn render_type(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

/// Human name for the JSON type of `value`.
pub fn json_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn unexpected_keys(document: &Value, schema_path: &str, instance: Option<&Value>) -> Vec<String> {
    let Some(Value::Object(object)) = instance else {
        return Vec::new();
    };
    let parent = parent_pointer(schema_path);
    let known = document
        .pointer(&format!("{parent}/properties"))
        .and_then(Value::as_object);

    object
        .keys()
        .filter(|key| known.map_or(true, |props| !props.contains_key(key.as_str())))
        .cloned()
        .collect()
}

fn pointer_segments(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect()
}

fn parent_pointer(pointer: &str) -> &str {
    pointer.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn quoted_token(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    Some(message[start..start + len].to_string())
}

/// Produce a plausible value for `schema`, or `None` when the shape is not understood.
///
/// Uses explicit `examples`/`default`/`const`/`enum` values first, then builds
/// one from the declared type. Local `$ref`s into `$defs` or `definitions` are followed.
pub fn synthesize_example(schema: &Value) -> Option<Value> {
    let example = example_for(schema, schema, 0);
    if example.is_none() {
        debug!("Could not synthesize an example from schema");
    }
    example
}

fn example_for(node: &Value, root: &Value, depth: usize) -> Option<Value> {
    if depth > MAX_EXAMPLE_DEPTH {
        return None;
    }
    let Value::Object(obj) = node else {
        // `true` accepts anything.
        return matches!(node, Value::Bool(true)).then(|| Value::Object(Map::new()));
    };

    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        let target = reference.strip_prefix('#').and_then(|ptr| root.pointer(ptr))?;
        return example_for(target, root, depth + 1);
    }
    if let Some(first) = obj
        .get("examples")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    {
        return Some(first.clone());
    }
    if let Some(default) = obj.get("default") {
        return Some(default.clone());
    }
    if let Some(constant) = obj.get("const") {
        return Some(constant.clone());
    }
    if let Some(first) = obj
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    {
        return Some(first.clone());
    }
    for combinator in ["anyOf", "oneOf", "allOf"] {
        if let Some(options) = obj.get(combinator).and_then(Value::as_array) {
            return options
                .iter()
                .filter(|option| option.get("type").and_then(Value::as_str) != Some("null"))
                .find_map(|option| example_for(option, root, depth + 1));
        }
    }

    let declared = match obj.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ if obj.contains_key("properties") => Some("object"),
        _ => None,
    }?;

    match declared {
        "object" => {
            let mut out = Map::new();
            if let Some(props) = obj.get("properties").and_then(Value::as_object) {
                for (key, prop) in props {
                    out.insert(key.clone(), example_for(prop, root, depth + 1)?);
                }
            }
            Some(Value::Object(out))
        }
        "array" => {
            let item = obj
                .get("items")
                .and_then(|items| example_for(items, root, depth + 1));
            Some(Value::Array(item.into_iter().collect()))
        }
        "string" => Some(Value::String(string_example(obj))),
        "integer" => {
            let min = obj.get("minimum").and_then(Value::as_i64).unwrap_or(0);
            Some(Value::from(min.max(0)))
        }
        "number" => {
            let min = obj.get("minimum").and_then(Value::as_f64).unwrap_or(0.0);
            Some(Value::from(min.max(0.0)))
        }
        "boolean" => Some(Value::Bool(false)),
        "null" => Some(Value::Null),
        _ => None,
    }
}

fn string_example(obj: &Map<String, Value>) -> String {
    match obj.get("format").and_then(Value::as_str) {
        Some("date-time") => "2024-01-01T00:00:00Z".to_string(),
        Some("date") => "2024-01-01".to_string(),
        Some("email") => "user@example.com".to_string(),
        Some("uri") | Some("url") => "https://example.com".to_string(),
        Some("uuid") => "00000000-0000-0000-0000-000000000000".to_string(),
        _ => "example".to_string(),
    }
}
