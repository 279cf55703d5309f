use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{
    CrossingRequest, CrossingView, Gate, GateError, GateOutcome, IdempotencyIndex, InFlightKeys,
};
use boundary_types::GateId;
use tracing::info;

/// K5: Idempotency
///
/// Refuses a request whose idempotency key already belongs to a committed
/// crossing or to another crossing still in flight. The key is reserved in
/// `keys` before the index is read and stays reserved until the crossing
/// commits or faults. Crossings that faulted never reached the index, so
/// retrying them passes.
///
/// `keys` must be the same set the kernel services release into.
pub struct IdempotencyGate {
    index: Arc<dyn IdempotencyIndex>,
    keys: Arc<InFlightKeys>,
}

impl IdempotencyGate {
    pub fn new(index: Arc<dyn IdempotencyIndex>, keys: Arc<InFlightKeys>) -> Self {
        Self { index, keys }
    }
}

#[async_trait]
impl Gate for IdempotencyGate {
    fn id(&self) -> GateId {
        GateId::K5
    }

    fn name(&self) -> &str {
        "idempotency"
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        let key = request.idempotency_key();
        if let Err(holder) = self.keys.reserve(key, crossing.correlation_id) {
            info!(
                correlation_id = %crossing.correlation_id,
                %holder,
                "duplicate of an in-flight crossing"
            );
            return Ok(GateOutcome::fail(format!("key {} in flight as {}", key, holder)));
        }

        match self.index.lookup(&key).await {
            None => Ok(GateOutcome::Pass),
            Some(previous) => {
                self.keys.release(&key, &crossing.correlation_id);
                info!(
                    correlation_id = %crossing.correlation_id,
                    %previous,
                    "duplicate of a committed crossing"
                );
                Ok(GateOutcome::fail(format!(
                    "key {} already committed by {}",
                    key, previous
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{committed_record, view};
    use boundary_kernel::{AuditLedger, InMemoryAuditLedger};
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_of_committed_is_rejected() {
        let ledger = Arc::new(InMemoryAuditLedger::new());
        let keys = Arc::new(InFlightKeys::new());
        let gate = IdempotencyGate::new(ledger.clone(), keys.clone());
        let req = CrossingRequest::new("transfer", "a", json!({"amount": 1}));

        let first = view();
        assert!(gate.evaluate(&first, &req).await.unwrap().is_pass());
        ledger.append(committed_record(&req)).await.unwrap();
        keys.release(&req.idempotency_key(), &first.correlation_id);

        assert!(gate.evaluate(&view(), &req).await.unwrap().is_fail());
        assert!(keys.is_empty());

        let other = CrossingRequest::new("transfer", "a", json!({"amount": 2}));
        assert!(gate.evaluate(&view(), &other).await.unwrap().is_pass());
    }

    #[tokio::test]
    async fn duplicate_of_in_flight_is_rejected() {
        let keys = Arc::new(InFlightKeys::new());
        let gate = IdempotencyGate::new(Arc::new(InMemoryAuditLedger::new()), keys.clone());
        let req = CrossingRequest::new("transfer", "a", json!({"amount": 1}));

        let first = view();
        assert!(gate.evaluate(&first, &req).await.unwrap().is_pass());
        assert!(gate.evaluate(&first, &req).await.unwrap().is_pass());

        let second = gate.evaluate(&view(), &req).await.unwrap();
        assert!(second.is_fail());
        assert_eq!(keys.holder(&req.idempotency_key()), Some(first.correlation_id));

        keys.release(&req.idempotency_key(), &first.correlation_id);
        assert!(gate.evaluate(&view(), &req).await.unwrap().is_pass());
    }
}
