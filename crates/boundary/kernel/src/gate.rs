use async_trait::async_trait;
use boundary_types::{CorrelationId, GateId, GateSet, ResumeToken, Sil};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, GateError};
use crate::request::CrossingRequest;

/// Why a gate failed, as reported by the gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl GateFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, detail)
    }
}

/// Result of evaluating one gate against one crossing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// Gate passed
    Pass,
    /// Gate refused the crossing
    Fail(GateFailure),
    /// Gate cannot decide yet; the token is resolved by an approval workflow
    Suspend(ResumeToken),
}

impl GateOutcome {
    pub fn fail(detail: impl Into<String>) -> Self {
        GateOutcome::Fail(GateFailure::rejected(detail))
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, GateOutcome::Fail(_))
    }
}

/// Read-only view of the crossing a gate is evaluating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrossingView {
    pub correlation_id: CorrelationId,
    /// Gates that already passed in this crossing
    pub gates_passed: GateSet,
    pub opened_at: DateTime<Utc>,
}

/// One enforcement gate (K1..K8).
///
/// Gates are independently replaceable. A gate never touches crossing
/// state; it inspects the view and the request and returns an outcome.
/// Returning `Err` means the gate could not evaluate at all.
#[async_trait]
pub trait Gate: Send + Sync {
    /// Position of this gate in the pipeline.
    fn id(&self) -> GateId;

    /// Human-readable name.
    fn name(&self) -> &str;

    fn sil(&self) -> Sil {
        Sil::default()
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError>;
}
