//! Provider traits the reference gates delegate their decisions to.

use boundary_kernel::{CrossingRequest, CrossingView, GateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QuotaExceeded;

/// K1: structural validation of an operation's payload.
pub trait SchemaValidator: Send + Sync {
    /// Every violation found, or `Ok` if the payload conforms.
    fn validate(&self, operation: &str, payload: &Value) -> Result<(), Vec<String>>;
}

/// K2: whether an actor may perform an operation.
pub trait PermissionProvider: Send + Sync {
    fn is_permitted(&self, actor: &str, operation: &str) -> Result<bool, GateError>;
}

/// K3: quota accounting.
pub trait QuotaProvider: Send + Sync {
    /// Consume `cost` units for the actor and operation. Returns the units
    /// left in the current window.
    fn acquire(&self, actor: &str, operation: &str, cost: u64) -> Result<u64, QuotaExceeded>;
}

/// Tracing context attached to a crossing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    /// W3C `traceparent` header value
    pub traceparent: String,
}

/// K4: attaches a tracing context to the crossing.
pub trait TraceInjector: Send + Sync {
    fn inject(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<TraceContext, String>;
}

/// K7: whether a request needs human sign-off.
pub trait ApprovalPolicy: Send + Sync {
    /// `Some(reason)` if approval is required.
    fn requires_approval(&self, request: &CrossingRequest) -> Option<String>;
}

/// Result of a behavioral evaluation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorAssessment {
    /// Risk score in `[0.0, 1.0]`
    pub score: f64,
    /// Names of the rules that contributed to the score
    pub matched: Vec<String>,
}

/// K8: behavioral risk scoring.
pub trait BehaviorEvaluator: Send + Sync {
    fn assess(&self, request: &CrossingRequest) -> Result<BehaviorAssessment, GateError>;
}
