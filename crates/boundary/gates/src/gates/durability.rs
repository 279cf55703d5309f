use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{
    AuditLedger, CrossingRequest, CrossingView, FailureKind, Gate, GateError, GateFailure,
    GateOutcome,
};
use boundary_types::{GateId, Sil};

/// K6: Durability
///
/// Confirms the audit ledger is reachable before the operation runs, so a
/// crossing is not admitted when its audit record could not be written.
pub struct DurabilityGate {
    ledger: Arc<dyn AuditLedger>,
}

impl DurabilityGate {
    pub fn new(ledger: Arc<dyn AuditLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Gate for DurabilityGate {
    fn id(&self) -> GateId {
        GateId::K6
    }

    fn name(&self) -> &str {
        "durability"
    }

    fn sil(&self) -> Sil {
        Sil::Sil3
    }

    async fn evaluate(
        &self,
        _crossing: &CrossingView,
        _request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        match self.ledger.precheck().await {
            Ok(()) => Ok(GateOutcome::Pass),
            Err(e) => Ok(GateOutcome::Fail(GateFailure::new(
                FailureKind::Unavailable,
                e.to_string(),
            ))),
        }
    }
}
