//! Output schemas for stage payloads.
//!
//! Generation returns free text; stages expect a JSON object. This module
//! pulls the object out of the text and checks the fields a stage relies on.

use serde_json::Value;

/// JSON kind a field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    StringArray,
    Object,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::StringArray => value
                .as_array()
                .map_or(false, |items| items.iter().all(Value::is_string)),
            FieldKind::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Array => "array",
            FieldKind::StringArray => "array of strings",
            FieldKind::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,

    /// Strings must be non-blank, arrays non-empty
    pub non_empty: bool,
}

/// Fields a stage payload must carry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSchema {
    fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Required, non-empty field
    pub fn require(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: true,
            non_empty: true,
        });
        self
    }

    /// Optional field; checked only when present
    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: false,
            non_empty: false,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Check `value` against the schema
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| "payload is not a JSON object".to_string())?;

        for field in &self.fields {
            let Some(v) = object.get(field.name).filter(|v| !v.is_null()) else {
                if field.required {
                    return Err(format!("missing field '{}'", field.name));
                }
                continue;
            };

            if !field.kind.matches(v) {
                return Err(format!(
                    "field '{}' must be {}",
                    field.name,
                    field.kind.name()
                ));
            }

            if field.non_empty {
                let empty = match v {
                    Value::String(s) => s.trim().is_empty(),
                    Value::Array(items) => items.is_empty(),
                    Value::Object(map) => map.is_empty(),
                    _ => false,
                };
                if empty {
                    return Err(format!("field '{}' must not be empty", field.name));
                }
            }
        }

        Ok(())
    }

    /// Extract the JSON payload from `text` and validate it
    pub fn parse(&self, text: &str) -> Result<Value, String> {
        let value = extract_json(text)?;
        self.validate(&value)?;
        Ok(value)
    }
}

/// Pull a JSON object out of generated text.
///
/// Accepts bare JSON, a fenced code block, or an object surrounded by prose.
pub fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("generation returned empty text".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(fenced.trim()) {
            return Ok(value);
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str::<Value>(&trimmed[start..=end])
                .map_err(|e| format!("generated JSON is malformed: {}", e))
        }
        _ => Err("generation did not contain a JSON object".to_string()),
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the info string (e.g. "json")
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outline_schema() -> OutputSchema {
        OutputSchema::new()
            .require("title", FieldKind::String)
            .require("sections", FieldKind::Array)
            .optional("notes", FieldKind::StringArray)
    }

    #[test]
    fn test_extract_bare_json() {
        assert_eq!(extract_json(r#" {"a": 1} "#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here you go:\n```json\n{\"title\": \"T\"}\n```\nEnjoy.";
        assert_eq!(extract_json(text).unwrap(), json!({"title": "T"}));
    }

    #[test]
    fn test_extract_json_in_prose() {
        let text = "Sure! {\"content\": \"body\"} Let me know.";
        assert_eq!(extract_json(text).unwrap(), json!({"content": "body"}));
    }

    #[test]
    fn test_extract_rejects_plain_text() {
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("   ").is_err());
    }

    #[test]
    fn test_validate_missing_and_wrong_kind() {
        let schema = outline_schema();
        assert_eq!(
            schema.validate(&json!({"title": "T"})).unwrap_err(),
            "missing field 'sections'"
        );
        assert_eq!(
            schema
                .validate(&json!({"title": 3, "sections": [1]}))
                .unwrap_err(),
            "field 'title' must be string"
        );
        assert!(schema
            .validate(&json!({"title": "T", "sections": []}))
            .unwrap_err()
            .contains("must not be empty"));
    }

    #[test]
    fn test_optional_field_checked_when_present() {
        let schema = outline_schema();
        assert!(schema
            .validate(&json!({"title": "T", "sections": [{}]}))
            .is_ok());
        assert!(schema
            .validate(&json!({"title": "T", "sections": [{}], "notes": [1]}))
            .is_err());
    }
}
