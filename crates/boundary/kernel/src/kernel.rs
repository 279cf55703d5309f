//! Concurrent registry of in-flight crossings.

use std::fmt::Display;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use boundary_types::{CorrelationId, CrossingState};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{Admission, AuditReceipt, CrossingHandle, KernelContext, KernelServices};
use crate::error::KernelError;
use crate::fault::Ack;
use crate::request::CrossingRequest;
use crate::snapshot::CrossingSnapshot;

struct Entry {
    handle: CrossingHandle,
    context: Arc<Mutex<KernelContext>>,
    state: watch::Receiver<CrossingState>,
}

/// Context lock held across an await.
///
/// If the future holding it is dropped before [`finish`](Self::finish), the
/// crossing is abandoned into FAULTED instead of being left mid-transition.
struct TransitionGuard {
    context: OwnedMutexGuard<KernelContext>,
    dropped: &'static str,
    finished: bool,
}

impl TransitionGuard {
    fn new(context: OwnedMutexGuard<KernelContext>, dropped: &'static str) -> Self {
        Self {
            context,
            dropped,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Deref for TransitionGuard {
    type Target = KernelContext;

    fn deref(&self) -> &KernelContext {
        &self.context
    }
}

impl DerefMut for TransitionGuard {
    fn deref_mut(&mut self) -> &mut KernelContext {
        &mut self.context
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.context.abandon(self.dropped);
        }
    }
}

/// Armed while the caller's operation runs outside the context lock.
struct OperationGuard<'a> {
    kernel: &'a BoundaryKernel,
    handle: CrossingHandle,
    armed: bool,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.kernel.lock(&self.handle) {
            Ok(mut context) => {
                context.abandon("execute dropped while the operation was running");
            }
            Err(e) => warn!(
                correlation_id = %self.handle.correlation_id,
                error = %e,
                "could not abandon crossing"
            ),
        }
    }
}

/// A crossing that did not commit.
///
/// When `handle` is present the crossing is FAULTED and must be
/// acknowledged through [`BoundaryKernel::acknowledge_fault`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossingFailure {
    pub handle: Option<CrossingHandle>,
    pub error: KernelError,
}

impl Display for CrossingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.handle {
            Some(handle) => write!(f, "crossing {}: {}", handle.correlation_id, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for CrossingFailure {}

/// Owns the shared collaborators and one [`KernelContext`] per crossing in
/// flight, indexed by correlation id.
///
/// Each context is guarded by an async mutex taken with `try_lock`: a call
/// that arrives while another transition of the same crossing is running
/// fails with [`KernelError::ReentrancyViolation`] instead of waiting.
pub struct BoundaryKernel {
    services: KernelServices,
    crossings: DashMap<CorrelationId, Entry>,
}

impl BoundaryKernel {
    pub fn new(services: KernelServices) -> Self {
        Self {
            services,
            crossings: DashMap::new(),
        }
    }

    pub fn services(&self) -> &KernelServices {
        &self.services
    }

    /// Open a crossing and evaluate the gates.
    ///
    /// The crossing is visible to [`state`](Self::state) while its gates run.
    pub async fn open(
        &self,
        request: CrossingRequest,
        cancel: &CancellationToken,
    ) -> Result<Admission, KernelError> {
        let context = Arc::new(Mutex::new(KernelContext::new(self.services.clone())));
        let mut guard = context
            .clone()
            .try_lock_owned()
            .map_err(|_| KernelError::ReentrancyViolation {
                detail: "fresh context already locked".into(),
            })?;

        let handle = guard.begin(request)?;
        let state = guard.subscribe();
        let entry = Entry {
            handle,
            context,
            state,
        };
        if self.crossings.insert(handle.correlation_id, entry).is_some() {
            warn!(correlation_id = %handle.correlation_id, "replaced a stale registry entry");
        }

        let mut guard = TransitionGuard::new(guard, "open dropped while the gates were running");
        let admission = guard.evaluate(&handle, cancel).await;
        guard.finish();
        let admission = admission?;
        debug!(
            correlation_id = %handle.correlation_id,
            admitted = admission.is_admitted(),
            in_flight = self.crossings.len(),
            "crossing opened"
        );
        Ok(admission)
    }

    pub async fn record_complete(&self, handle: &CrossingHandle) -> Result<(), KernelError> {
        self.lock(handle)?.record_complete(handle)
    }

    /// Returns the error now pending on the crossing.
    pub async fn record_cancelled(
        &self,
        handle: &CrossingHandle,
        detail: impl Into<String>,
    ) -> Result<KernelError, KernelError> {
        self.lock(handle)?.record_cancelled(handle, detail)
    }

    /// Returns the error now pending on the crossing.
    pub async fn record_operation_failure(
        &self,
        handle: &CrossingHandle,
        detail: impl Into<String>,
    ) -> Result<KernelError, KernelError> {
        self.lock(handle)?.record_operation_failure(handle, detail)
    }

    /// Returns the error now pending on the crossing.
    pub async fn record_eval_failure(
        &self,
        handle: &CrossingHandle,
        detail: impl Into<String>,
    ) -> Result<KernelError, KernelError> {
        self.lock(handle)?.record_eval_failure(handle, detail)
    }

    pub async fn exit(&self, handle: &CrossingHandle) -> Result<AuditReceipt, KernelError> {
        let mut guard = TransitionGuard::new(
            self.lock(handle)?,
            "exit dropped before the audit record was confirmed",
        );
        let result = guard.exit(handle).await;
        guard.finish();
        self.retire_if_idle(handle, &guard);
        result
    }

    pub async fn acknowledge_fault(&self, handle: &CrossingHandle) -> Result<Ack, KernelError> {
        let mut guard = self.lock(handle)?;
        let ack = guard.acknowledge_fault(handle)?;
        self.retire_if_idle(handle, &guard);
        Ok(ack)
    }

    /// Last published state of a crossing. `None` once it has returned to
    /// IDLE and left the registry.
    pub fn state(&self, handle: &CrossingHandle) -> Option<CrossingState> {
        self.crossings
            .get(&handle.correlation_id)
            .map(|entry| *entry.state.borrow())
    }

    /// Handle of a registered crossing, for callers that lost theirs.
    pub fn handle(&self, id: &CorrelationId) -> Option<CrossingHandle> {
        self.crossings.get(id).map(|entry| entry.handle)
    }

    /// Snapshot of a crossing. Fails if a transition is in flight.
    pub fn snapshot(&self, handle: &CrossingHandle) -> Result<CrossingSnapshot, KernelError> {
        Ok(self.lock(handle)?.snapshot())
    }

    /// Crossings currently registered, with their last published state.
    pub fn in_flight(&self) -> Vec<(CorrelationId, CrossingState)> {
        self.crossings
            .iter()
            .map(|entry| (*entry.key(), *entry.value().state.borrow()))
            .collect()
    }

    /// Open, run `operation`, and close a crossing.
    ///
    /// The operation is raced against `cancel`. A cancelled or failed
    /// operation faults the crossing; any failure after admission leaves it
    /// FAULTED and is returned with its handle for acknowledgment. Dropping
    /// the returned future mid-way faults the crossing as well.
    pub async fn execute<T, E, F, Fut>(
        &self,
        request: CrossingRequest,
        cancel: CancellationToken,
        operation: F,
    ) -> Result<(T, AuditReceipt), CrossingFailure>
    where
        F: FnOnce(CrossingHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let admission = self
            .open(request, &cancel)
            .await
            .map_err(|error| CrossingFailure {
                handle: None,
                error,
            })?;
        let handle = match admission {
            Admission::Admitted(handle) => handle,
            Admission::Refused { handle, error } => {
                return Err(CrossingFailure {
                    handle: Some(handle),
                    error,
                })
            }
        };
        let failed = |error| CrossingFailure {
            handle: Some(handle),
            error,
        };

        let mut running = OperationGuard {
            kernel: self,
            handle,
            armed: true,
        };
        // Err(None) is a cancellation, Err(Some(_)) the operation's own error
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(None),
            result = operation(handle) => result.map_err(|e| Some(e.to_string())),
        };
        running.armed = false;

        let value = match outcome {
            Ok(value) => value,
            Err(reason) => {
                let pending = match reason {
                    None => {
                        self.record_cancelled(&handle, "cancelled while the operation was running")
                            .await
                    }
                    Some(detail) => self.record_operation_failure(&handle, detail).await,
                };
                return Err(failed(pending.unwrap_or_else(|e| e)));
            }
        };

        self.record_complete(&handle).await.map_err(failed)?;
        let receipt = self.exit(&handle).await.map_err(failed)?;
        Ok((value, receipt))
    }

    fn lock(&self, handle: &CrossingHandle) -> Result<OwnedMutexGuard<KernelContext>, KernelError> {
        let context = self
            .crossings
            .get(&handle.correlation_id)
            .map(|entry| entry.context.clone())
            .ok_or(KernelError::UnknownCrossing(handle.correlation_id))?;
        context
            .try_lock_owned()
            .map_err(|_| KernelError::ReentrancyViolation {
                detail: format!(
                    "crossing {} has a transition in flight",
                    handle.correlation_id
                ),
            })
    }

    fn retire_if_idle(&self, handle: &CrossingHandle, context: &KernelContext) {
        if context.state() == CrossingState::Idle {
            self.crossings.remove(&handle.correlation_id);
            debug!(correlation_id = %handle.correlation_id, "crossing retired");
        }
    }
}

impl std::fmt::Debug for BoundaryKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryKernel")
            .field("pipeline", &self.services.pipeline)
            .field("in_flight", &self.crossings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::ledger::InMemoryAuditLedger;
    use crate::mocks::{scripted_gates, scripted_pipeline, ScriptedGate};
    use boundary_types::GateId;
    use serde_json::json;
    use std::time::Duration;

    fn kernel(gates: &[Arc<ScriptedGate>]) -> (BoundaryKernel, Arc<InMemoryAuditLedger>) {
        let ledger = Arc::new(InMemoryAuditLedger::new());
        let pipeline = scripted_pipeline(gates).build().unwrap();
        let services = KernelServices::new(pipeline, ledger.clone(), &KernelConfig::default());
        (BoundaryKernel::new(services), ledger)
    }

    fn request(n: u64) -> CrossingRequest {
        CrossingRequest::new("transfer", "agent", json!({ "n": n }))
    }

    #[tokio::test]
    async fn execute_commits_and_retires() {
        let (kernel, ledger) = kernel(&scripted_gates());
        let (value, receipt) = kernel
            .execute(request(1), CancellationToken::new(), |_| async {
                Ok::<_, String>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(receipt.wal_written);
        assert!(kernel.in_flight().is_empty());
        assert_eq!(ledger.len().await, 1);
        assert_eq!(kernel.services().correlations.live_count(), 0);
    }

    #[tokio::test]
    async fn failed_operation_stays_faulted_until_acknowledged() {
        let (kernel, ledger) = kernel(&scripted_gates());
        let failure = kernel
            .execute(request(2), CancellationToken::new(), |_| async {
                Err::<(), _>("upstream 503")
            })
            .await
            .unwrap_err();

        let handle = failure.handle.unwrap();
        assert_eq!(
            failure.error,
            KernelError::OperationFailed {
                detail: "upstream 503".into()
            }
        );
        assert_eq!(kernel.state(&handle), Some(CrossingState::Faulted));
        assert!(ledger.is_empty().await);

        kernel.acknowledge_fault(&handle).await.unwrap();
        assert_eq!(kernel.state(&handle), None);
    }

    #[tokio::test]
    async fn refused_crossing_returns_handle() {
        let mut gates = scripted_gates();
        gates[0] = Arc::new(ScriptedGate::fail(GateId::K1, "missing field"));
        let (kernel, _) = kernel(&gates);

        let failure = kernel
            .execute(request(3), CancellationToken::new(), |_| async {
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(failure.error, KernelError::SchemaViolation { .. }));
        assert_eq!(kernel.in_flight().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_transition_is_reentrancy_violation() {
        let mut gates = scripted_gates();
        gates[2] = Arc::new(ScriptedGate::pass(GateId::K3).with_delay(Duration::from_millis(200)));
        let (kernel, _) = kernel(&gates);
        let kernel = Arc::new(kernel);

        let opener = {
            let kernel = kernel.clone();
            tokio::spawn(async move { kernel.open(request(4), &CancellationToken::new()).await })
        };

        // wait until the crossing is registered and evaluating
        let (id, state) = loop {
            if let Some(entry) = kernel.in_flight().first().copied() {
                break entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(state, CrossingState::Entering);

        let other = CrossingHandle {
            correlation_id: id,
            idempotency_key: request(4).idempotency_key(),
            opened_at: chrono::Utc::now(),
        };
        assert!(matches!(
            kernel.record_complete(&other).await,
            Err(KernelError::ReentrancyViolation { .. })
        ));

        let admission = opener.await.unwrap().unwrap();
        assert!(admission.is_admitted());
        assert_eq!(kernel.state(admission.handle()), Some(CrossingState::Active));
    }

    #[tokio::test]
    async fn dropped_open_ends_faulted() {
        let mut gates = scripted_gates();
        gates[2] = Arc::new(ScriptedGate::pass(GateId::K3).with_delay(Duration::from_secs(1)));
        let (kernel, _) = kernel(&gates);

        let late = tokio::time::timeout(
            Duration::from_millis(10),
            kernel.open(request(6), &CancellationToken::new()),
        )
        .await;
        assert!(late.is_err());

        let (id, state) = kernel.in_flight()[0];
        assert_eq!(state, CrossingState::Faulted);
        assert_eq!(kernel.services().correlations.live_count(), 0);

        let handle = kernel.handle(&id).unwrap();
        let ack = kernel.acknowledge_fault(&handle).await.unwrap();
        assert_eq!(
            ack.error,
            KernelError::CancellationFault {
                gate: Some(GateId::K3),
                detail: "open dropped while the gates were running".into()
            }
        );
        assert!(kernel.in_flight().is_empty());
    }

    #[tokio::test]
    async fn dropped_execute_faults_active_crossing() {
        let (kernel, ledger) = kernel(&scripted_gates());

        let late = tokio::time::timeout(
            Duration::from_millis(10),
            kernel.execute(request(7), CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, String>(())
            }),
        )
        .await;
        assert!(late.is_err());

        let (id, state) = kernel.in_flight()[0];
        assert_eq!(state, CrossingState::Faulted);
        let handle = kernel.handle(&id).unwrap();
        let ack = kernel.acknowledge_fault(&handle).await.unwrap();
        assert!(matches!(ack.error, KernelError::CancellationFault { gate: None, .. }));
        assert!(ledger.is_empty().await);
        assert_eq!(kernel.services().correlations.live_count(), 0);
    }

    #[tokio::test]
    async fn unknown_handle() {
        let (kernel, _) = kernel(&scripted_gates());
        let handle = CrossingHandle {
            correlation_id: CorrelationId::new(),
            idempotency_key: request(5).idempotency_key(),
            opened_at: chrono::Utc::now(),
        };
        assert!(matches!(
            kernel.exit(&handle).await,
            Err(KernelError::UnknownCrossing(_))
        ));
    }
}
