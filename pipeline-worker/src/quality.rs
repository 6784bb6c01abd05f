//! Stock transforms for common event-quality problems.
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use pipeline_common::message::Message;
use serde_json::Value;

use crate::processors::mapping::{Mapped, MappingError, Transform};
use crate::schema::lookup;

/// Give events without an id the message id.
pub struct AssignMissingId {
    field: String,
}

impl AssignMissingId {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_owned(),
        }
    }
}

impl Transform for AssignMissingId {
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError> {
        let Value::Object(fields) = message.payload() else {
            return Err(MappingError::Failed("payload is not an object".to_owned()));
        };
        match fields.get(&self.field) {
            Some(Value::String(id)) if !id.is_empty() => return Ok(Mapped::Keep),
            Some(Value::String(_)) | Some(Value::Null) | None => {}
            Some(_) => {
                return Err(MappingError::Schema {
                    field: self.field.clone(),
                    reason: "id must be a string".to_owned(),
                })
            }
        }

        let id = message.id().to_string();
        let field = self.field.clone();
        Ok(Mapped::Replace(message.clone().update_payload(|payload| {
            payload[field.as_str()] = Value::String(id);
        })))
    }
}

/// Rewrite timestamps as RFC 3339 in UTC with millisecond precision.
/// Integers are read as milliseconds since the epoch. A missing timestamp is
/// left for schema validation to report.
pub struct NormalizeTimestamp {
    field: String,
}

impl NormalizeTimestamp {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_owned(),
        }
    }

    fn parse(&self, value: &Value) -> Result<DateTime<Utc>, MappingError> {
        let parsed = match value {
            Value::Number(number) => number
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|timestamp| timestamp.with_timezone(&Utc)),
            _ => None,
        };
        parsed.ok_or_else(|| MappingError::Schema {
            field: self.field.clone(),
            reason: format!("unparseable timestamp {value}"),
        })
    }
}

impl Transform for NormalizeTimestamp {
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError> {
        let value = match message.payload().get(&self.field) {
            None | Some(Value::Null) => return Ok(Mapped::Keep),
            Some(value) => value,
        };

        let normalized = self
            .parse(value)?
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        if value.as_str() == Some(normalized.as_str()) {
            return Ok(Mapped::Keep);
        }

        let field = self.field.clone();
        Ok(Mapped::Replace(message.clone().update_payload(|payload| {
            payload[field.as_str()] = Value::String(normalized);
        })))
    }
}

/// Remove fields that must not leave the pipeline, such as personal data.
pub struct Redact {
    paths: Vec<String>,
}

impl Redact {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

fn remove_path(payload: &mut Value, path: &str) {
    let (parent, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (payload.pointer_mut(&pointer(parent)), key),
        None => (Some(payload), path),
    };
    if let Some(Value::Object(fields)) = parent {
        fields.remove(key);
    }
}

/// Convert a dotted path to a JSON pointer.
fn pointer(path: &str) -> String {
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

impl Transform for Redact {
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError> {
        let present: Vec<&String> = self
            .paths
            .iter()
            .filter(|path| lookup(message.payload(), path).is_some())
            .collect();
        if present.is_empty() {
            return Ok(Mapped::Keep);
        }

        Ok(Mapped::Replace(message.clone().update_payload(|payload| {
            for path in present {
                remove_path(payload, path);
            }
        })))
    }
}

/// Drop events emitted from environments that should not reach production
/// outputs, e.g. `test`.
pub struct DropEnvironments {
    field: String,
    environments: Vec<String>,
}

impl DropEnvironments {
    pub fn new(field: &str, environments: Vec<String>) -> Self {
        Self {
            field: field.to_owned(),
            environments,
        }
    }
}

impl Transform for DropEnvironments {
    fn apply(&self, message: &Message) -> Result<Mapped, MappingError> {
        let dropped = lookup(message.payload(), &self.field)
            .and_then(Value::as_str)
            .is_some_and(|environment| self.environments.iter().any(|e| e == environment));
        if dropped {
            Ok(Mapped::Delete)
        } else {
            Ok(Mapped::Keep)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn replaced(mapped: Mapped) -> Value {
        match mapped {
            Mapped::Replace(message) => message.payload().clone(),
            other => panic!("expected a replacement, got {other:?}"),
        }
    }

    #[test]
    fn assigns_ids_only_when_missing() {
        let transform = AssignMissingId::new("event_id");

        let message = Message::new(json!({"event": "click"}));
        let payload = replaced(transform.apply(&message).unwrap());
        assert_eq!(payload["event_id"], json!(message.id().to_string()));

        let message = Message::new(json!({"event_id": "abc"}));
        assert!(matches!(transform.apply(&message).unwrap(), Mapped::Keep));

        let message = Message::new(json!({"event_id": 7}));
        assert!(transform.apply(&message).is_err());

        let message = Message::new(json!([1, 2]));
        assert!(transform.apply(&message).is_err());
    }

    #[test]
    fn normalizes_timestamps() {
        let transform = NormalizeTimestamp::new("timestamp");

        let millis = Message::new(json!({"timestamp": 1_700_000_000_000i64}));
        assert_json_eq!(
            replaced(transform.apply(&millis).unwrap()),
            json!({"timestamp": "2023-11-14T22:13:20.000Z"})
        );

        let offset = Message::new(json!({"timestamp": "2023-11-15T00:13:20+02:00"}));
        assert_json_eq!(
            replaced(transform.apply(&offset).unwrap()),
            json!({"timestamp": "2023-11-14T22:13:20.000Z"})
        );

        let already = Message::new(json!({"timestamp": "2023-11-14T22:13:20.000Z"}));
        assert!(matches!(transform.apply(&already).unwrap(), Mapped::Keep));

        let missing = Message::new(json!({}));
        assert!(matches!(transform.apply(&missing).unwrap(), Mapped::Keep));

        let garbage = Message::new(json!({"timestamp": "yesterday"}));
        assert!(matches!(
            transform.apply(&garbage),
            Err(MappingError::Schema { .. })
        ));
    }

    #[test]
    fn redacts_nested_fields() {
        let transform = Redact::new(vec!["properties.email".to_owned(), "ip".to_owned()]);
        let message = Message::new(json!({
            "ip": "10.0.0.1",
            "properties": {"email": "a@b.c", "plan": "free"}
        }));

        assert_json_eq!(
            replaced(transform.apply(&message).unwrap()),
            json!({"properties": {"plan": "free"}})
        );
        assert_eq!(message.payload()["ip"], json!("10.0.0.1"));

        let clean = Message::new(json!({"properties": {}}));
        assert!(matches!(transform.apply(&clean).unwrap(), Mapped::Keep));
    }

    #[test]
    fn drops_listed_environments() {
        let transform = DropEnvironments::new("properties.env", vec!["test".to_owned()]);
        let test = Message::new(json!({"properties": {"env": "test"}}));
        let prod = Message::new(json!({"properties": {"env": "production"}}));

        assert!(matches!(transform.apply(&test).unwrap(), Mapped::Delete));
        assert!(matches!(transform.apply(&prod).unwrap(), Mapped::Keep));
    }
}
