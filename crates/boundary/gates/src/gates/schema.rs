use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{CrossingRequest, CrossingView, Gate, GateError, GateOutcome};
use boundary_types::GateId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::SchemaValidator;

/// JSON type expected for a payload field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// Shape of one operation's payload: a top-level object with typed fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub required: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub optional: BTreeMap<String, FieldType>,
    /// Accept fields not listed in `required` or `optional`
    #[serde(default)]
    pub allow_unknown: bool,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.required.insert(field.into(), ty);
        self
    }

    pub fn optional(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.optional.insert(field.into(), ty);
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    pub fn check(&self, payload: &Value) -> Result<(), Vec<String>> {
        let Some(object) = payload.as_object() else {
            return Err(vec!["payload must be a JSON object".into()]);
        };

        let mut problems = Vec::new();
        for (field, ty) in &self.required {
            match object.get(field) {
                None => problems.push(format!("missing field `{field}`")),
                Some(v) if !ty.matches(v) => {
                    problems.push(format!("field `{field}` is not {ty:?}"))
                }
                Some(_) => {}
            }
        }
        for (field, value) in object {
            if self.required.contains_key(field) {
                continue;
            }
            match self.optional.get(field) {
                Some(ty) if !ty.matches(value) => {
                    problems.push(format!("field `{field}` is not {ty:?}"))
                }
                Some(_) => {}
                None if !self.allow_unknown => problems.push(format!("unknown field `{field}`")),
                None => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Schemas keyed by operation name. Unknown operations are rejected.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, FieldSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, operation: impl Into<String>, schema: FieldSchema) -> Self {
        self.schemas.insert(operation.into(), schema);
        self
    }
}

impl SchemaValidator for SchemaRegistry {
    fn validate(&self, operation: &str, payload: &Value) -> Result<(), Vec<String>> {
        match self.schemas.get(operation) {
            Some(schema) => schema.check(payload),
            None => Err(vec![format!("no schema registered for `{operation}`")]),
        }
    }
}

/// K1: Schema
///
/// Rejects requests whose payload does not match the operation's schema.
pub struct SchemaGate {
    validator: Arc<dyn SchemaValidator>,
}

impl SchemaGate {
    pub fn new(validator: Arc<dyn SchemaValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Gate for SchemaGate {
    fn id(&self) -> GateId {
        GateId::K1
    }

    fn name(&self) -> &str {
        "schema"
    }

    async fn evaluate(
        &self,
        _crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        if request.operation().is_empty() {
            return Ok(GateOutcome::fail("operation name is empty"));
        }
        match self.validator.validate(request.operation(), request.payload()) {
            Ok(()) => Ok(GateOutcome::Pass),
            Err(problems) => Ok(GateOutcome::fail(problems.join("; "))),
        }
    }
}
