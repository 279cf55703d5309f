use std::collections::{BTreeMap, BTreeSet};

use boundary_types::IdempotencyKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::idempotency::IdempotencyKeyDeriver;
use crate::request::CrossingRequest;

/// Shape of one top-level payload field. Values are never kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldShape {
    Null,
    Bool,
    Number,
    String { len: usize },
    Array { len: usize },
    Object { fields: usize },
    Redacted,
}

impl FieldShape {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldShape::Null,
            Value::Bool(_) => FieldShape::Bool,
            Value::Number(_) => FieldShape::Number,
            Value::String(s) => FieldShape::String { len: s.chars().count() },
            Value::Array(items) => FieldShape::Array { len: items.len() },
            Value::Object(map) => FieldShape::Object { fields: map.len() },
        }
    }
}

/// Payload summary stored in an audit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedSummary {
    pub operation: String,
    pub actor: String,
    pub idempotency_key: IdempotencyKey,
    /// Top-level fields and their shapes; sensitive fields are `Redacted`
    pub fields: BTreeMap<String, FieldShape>,
    /// Length of the canonical payload text
    pub payload_bytes: usize,
}

impl RedactedSummary {
    pub fn redacted_count(&self) -> usize {
        self.fields
            .values()
            .filter(|s| **s == FieldShape::Redacted)
            .count()
    }
}

/// Builds [`RedactedSummary`] values from requests.
#[derive(Clone, Debug, Default)]
pub struct Redactor {
    sensitive: BTreeSet<String>,
}

impl Redactor {
    pub fn new<I, S>(sensitive: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sensitive: sensitive
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive.contains(&field.to_ascii_lowercase())
    }

    pub fn summarize(&self, request: &CrossingRequest) -> RedactedSummary {
        let payload = request.payload();
        let fields = match payload {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| {
                    let shape = if self.is_sensitive(k) {
                        FieldShape::Redacted
                    } else {
                        FieldShape::of(v)
                    };
                    (k.clone(), shape)
                })
                .collect(),
            other => {
                let mut single = BTreeMap::new();
                single.insert("$".to_string(), FieldShape::of(other));
                single
            }
        };

        RedactedSummary {
            operation: request.operation().to_string(),
            actor: request.actor().to_string(),
            idempotency_key: request.idempotency_key(),
            fields,
            payload_bytes: IdempotencyKeyDeriver::canonicalize(payload).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_fields_are_redacted() {
        let redactor = Redactor::new(["password", "API_KEY"]);
        let req = CrossingRequest::new(
            "login",
            "agent",
            json!({"user": "ada", "password": "hunter2", "api_key": "k", "tags": [1, 2]}),
        );
        let summary = redactor.summarize(&req);

        assert_eq!(summary.fields["password"], FieldShape::Redacted);
        assert_eq!(summary.fields["api_key"], FieldShape::Redacted);
        assert_eq!(summary.fields["user"], FieldShape::String { len: 3 });
        assert_eq!(summary.fields["tags"], FieldShape::Array { len: 2 });
        assert_eq!(summary.redacted_count(), 2);
    }

    #[test]
    fn summary_never_contains_values() {
        let redactor = Redactor::new(["secret"]);
        let req = CrossingRequest::new("op", "agent", json!({"secret": "s3cr3t", "note": "visible?"}));
        let text = serde_json::to_string(&redactor.summarize(&req)).unwrap();
        assert!(!text.contains("s3cr3t"));
        assert!(!text.contains("visible?"));
    }

    #[test]
    fn scalar_payload() {
        let redactor = Redactor::default();
        let req = CrossingRequest::new("ping", "agent", json!(42));
        let summary = redactor.summarize(&req);
        assert_eq!(summary.fields["$"], FieldShape::Number);
        assert_eq!(summary.payload_bytes, 2);
    }
}
