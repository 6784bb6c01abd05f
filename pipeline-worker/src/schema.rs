use std::fmt;

use pipeline_common::message::Message;
use serde::Deserialize;
use serde_json::Value;

use crate::processors::mapping::{Mapped, MappingError, Transform};

/// Resolve a dotted path such as `properties.items.0.sku`. Numeric segments
/// index into arrays.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |value, segment| match value {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Any,
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Bool => "bool",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        f.write_str(name)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fails messages that lack a field or hold a value of the wrong type.
/// Null counts as missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RequiredFields {
    fields: Vec<(String, FieldType)>,
}

impl RequiredFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, path: &str, field_type: FieldType) -> Self {
        self.fields.push((path.to_owned(), field_type));
        self
    }

    pub fn check(&self, payload: &Value) -> Result<(), MappingError> {
        for (path, expected) in &self.fields {
            match lookup(payload, path) {
                None | Some(Value::Null) => {
                    return Err(MappingError::Schema {
                        field: path.clone(),
                        reason: "missing".to_owned(),
                    })
                }
                Some(value) if !expected.accepts(value) => {
                    return Err(MappingError::Schema {
                        field: path.clone(),
                        reason: format!("expected {expected}, found {}", type_name(value)),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl Transform for RequiredFields {
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError> {
        self.check(message.payload())?;
        Ok(Mapped::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let payload = json!({"properties": {"items": [{"sku": "a1"}]}});
        assert_eq!(
            lookup(&payload, "properties.items.0.sku"),
            Some(&json!("a1"))
        );
        assert_eq!(lookup(&payload, "properties.items.1.sku"), None);
        assert_eq!(lookup(&payload, "properties.missing"), None);
        assert_eq!(lookup(&payload, "properties.items.x"), None);
    }

    #[test]
    fn required_fields() {
        let schema = RequiredFields::new()
            .field("event", FieldType::String)
            .field("properties.count", FieldType::Integer);

        assert_eq!(
            schema.check(&json!({"event": "click", "properties": {"count": 3}})),
            Ok(())
        );
        assert_eq!(
            schema.check(&json!({"event": null, "properties": {"count": 3}})),
            Err(MappingError::Schema {
                field: "event".to_owned(),
                reason: "missing".to_owned()
            })
        );
        assert_eq!(
            schema.check(&json!({"event": "click", "properties": {"count": 1.5}})),
            Err(MappingError::Schema {
                field: "properties.count".to_owned(),
                reason: "expected integer, found number".to_owned()
            })
        );
    }

    #[test]
    fn deserializes_from_pairs() {
        let schema: RequiredFields =
            serde_json::from_str(r#"{"fields": [["event", "string"], ["uuid", "any"]]}"#)
                .expect("valid schema");
        assert_eq!(
            schema,
            RequiredFields::new()
                .field("event", FieldType::String)
                .field("uuid", FieldType::Any)
        );
    }
}
