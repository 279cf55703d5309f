use std::collections::BTreeMap;

use boundary_types::IdempotencyKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::idempotency::IdempotencyKeyDeriver;

/// One operation an agent wants to perform against a guarded resource.
///
/// The idempotency key is derived once, at construction, from the operation
/// name and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossingRequest {
    operation: String,
    actor: String,
    payload: Value,
    idempotency_key: IdempotencyKey,
    attributes: BTreeMap<String, String>,
}

impl CrossingRequest {
    pub fn new(operation: impl Into<String>, actor: impl Into<String>, payload: Value) -> Self {
        let operation = operation.into();
        let idempotency_key = IdempotencyKeyDeriver::derive(&operation, &payload);
        Self {
            operation,
            actor: actor.into(),
            payload,
            idempotency_key,
            attributes: BTreeMap::new(),
        }
    }

    /// Attach a non-payload attribute (cost hints, trace parents, ...).
    ///
    /// Attributes do not contribute to the idempotency key.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.idempotency_key
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}
