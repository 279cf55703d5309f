//! The crossing state machine.
//!
//! A [`KernelContext`] hosts at most one [`BoundaryCrossing`] at a time and
//! drives it through IDLE → ENTERING → ACTIVE → EXITING → IDLE, diverting to
//! FAULTED whenever a gate, the caller's operation, or the ledger fails.

use std::sync::Arc;
use std::time::Duration;

use boundary_types::{CorrelationId, CrossingState, GateId, GateSet, IdempotencyKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KernelConfig;
use crate::correlation::CorrelationAssigner;
use crate::error::{FailureKind, KernelError, LedgerError};
use crate::events::{EventSink, KernelEvent, TracingEventSink, Trigger};
use crate::fault::{Ack, Fault, FaultTracker};
use crate::gate::CrossingView;
use crate::idempotency::InFlightKeys;
use crate::ledger::{AuditLedger, AuditRecord, CrossingOutcome};
use crate::pipeline::{GateEvaluation, GatePipeline, Verdict};
use crate::redact::Redactor;
use crate::request::CrossingRequest;
use crate::snapshot::CrossingSnapshot;

/// Collaborators shared by every context of one kernel.
#[derive(Clone)]
pub struct KernelServices {
    pub pipeline: Arc<GatePipeline>,
    pub ledger: Arc<dyn AuditLedger>,
    pub correlations: Arc<CorrelationAssigner>,
    /// Shared with the idempotency gate, which reserves into it
    pub in_flight_keys: Arc<InFlightKeys>,
    pub events: Arc<dyn EventSink>,
    pub redactor: Redactor,
    pub ledger_budget: Duration,
}

impl KernelServices {
    pub fn new(pipeline: GatePipeline, ledger: Arc<dyn AuditLedger>, config: &KernelConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            ledger,
            correlations: Arc::new(CorrelationAssigner::new()),
            in_flight_keys: Arc::new(InFlightKeys::new()),
            events: Arc::new(TracingEventSink),
            redactor: Redactor::new(&config.redact_fields),
            ledger_budget: config.ledger_budget(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_correlations(mut self, correlations: Arc<CorrelationAssigner>) -> Self {
        self.correlations = correlations;
        self
    }

    pub fn with_in_flight_keys(mut self, keys: Arc<InFlightKeys>) -> Self {
        self.in_flight_keys = keys;
        self
    }
}

/// Transient record of one crossing.
#[derive(Clone, Debug, Default)]
pub struct BoundaryCrossing {
    pub state: CrossingState,
    /// Present exactly while ENTERING, ACTIVE or EXITING
    pub correlation_id: Option<CorrelationId>,
    pub evaluation: GateEvaluation,
    pub wal_written: bool,
    pub request: Option<CrossingRequest>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Caller's reference to a crossing it opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossingHandle {
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
    pub opened_at: DateTime<Utc>,
}

/// Result of running the gates on entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Every gate passed; the crossing is ACTIVE.
    Admitted(CrossingHandle),
    /// A gate refused; the crossing is FAULTED until acknowledged.
    Refused {
        handle: CrossingHandle,
        error: KernelError,
    },
}

impl Admission {
    pub fn handle(&self) -> &CrossingHandle {
        match self {
            Admission::Admitted(handle) | Admission::Refused { handle, .. } => handle,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn error(&self) -> Option<&KernelError> {
        match self {
            Admission::Admitted(_) => None,
            Admission::Refused { error, .. } => Some(error),
        }
    }
}

/// Proof that a crossing committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReceipt {
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
    pub gates_passed: GateSet,
    pub wal_written: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Hosts one crossing at a time.
///
/// Every transition emits a [`KernelEvent::Transition`] and publishes the
/// new state on a watch channel so observers never need the context lock.
pub struct KernelContext {
    services: KernelServices,
    crossing: BoundaryCrossing,
    faults: FaultTracker,
    state_tx: watch::Sender<CrossingState>,
}

impl KernelContext {
    pub fn new(services: KernelServices) -> Self {
        let (state_tx, _) = watch::channel(CrossingState::Idle);
        Self {
            services,
            crossing: BoundaryCrossing::default(),
            faults: FaultTracker::new(),
            state_tx,
        }
    }

    pub fn state(&self) -> CrossingState {
        self.crossing.state
    }

    pub fn crossing(&self) -> &BoundaryCrossing {
        &self.crossing
    }

    pub fn pending_fault(&self) -> Option<&Fault> {
        self.faults.fault()
    }

    /// Receiver that observes every state change of this context.
    pub fn subscribe(&self) -> watch::Receiver<CrossingState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> CrossingSnapshot {
        CrossingSnapshot {
            state: self.crossing.state,
            correlation_id: self.crossing.correlation_id,
            gates_passed: self.crossing.evaluation.passed(),
            gates_failed: self.crossing.evaluation.failed(),
            wal_written: self.crossing.wal_written,
            exception_pending: self.faults.pending(),
            awaiting_approval: self.crossing.evaluation.is_awaiting_approval(),
        }
    }

    /// Open a crossing and run every gate against it.
    ///
    /// A gate refusal is not an `Err`: the crossing is FAULTED and the
    /// returned [`Admission::Refused`] carries the handle to acknowledge it.
    pub async fn enter(
        &mut self,
        request: CrossingRequest,
        cancel: &CancellationToken,
    ) -> Result<Admission, KernelError> {
        let handle = self.begin(request)?;
        self.evaluate(&handle, cancel).await
    }

    /// Aenter: IDLE → ENTERING. Assigns a fresh correlation id.
    pub fn begin(&mut self, request: CrossingRequest) -> Result<CrossingHandle, KernelError> {
        if self.crossing.state != CrossingState::Idle {
            return Err(KernelError::ReentrancyViolation {
                detail: format!(
                    "context is {} with crossing {}",
                    self.crossing.state,
                    self.hosted_id()
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "<none>".into())
                ),
            });
        }

        let id = self.services.correlations.issue();
        let opened_at = Utc::now();
        let handle = CrossingHandle {
            correlation_id: id,
            idempotency_key: request.idempotency_key(),
            opened_at,
        };

        self.crossing = BoundaryCrossing {
            correlation_id: Some(id),
            request: Some(request),
            opened_at: Some(opened_at),
            ..BoundaryCrossing::default()
        };
        self.transition(id, Trigger::Aenter);
        Ok(handle)
    }

    /// Run the gate pipeline for a crossing opened with [`begin`](Self::begin).
    pub async fn evaluate(
        &mut self,
        handle: &CrossingHandle,
        cancel: &CancellationToken,
    ) -> Result<Admission, KernelError> {
        self.check_handle(handle)?;
        let evaluation = &self.crossing.evaluation;
        if self.crossing.state != CrossingState::Entering
            || !evaluation.passed().is_empty()
            || !evaluation.failed().is_empty()
        {
            return Err(KernelError::InvalidTransition {
                state: self.crossing.state,
                action: "evaluate gates",
            });
        }

        let Some(request) = self.crossing.request.as_ref() else {
            return Err(KernelError::InvalidTransition {
                state: self.crossing.state,
                action: "evaluate gates without a request",
            });
        };
        let view = CrossingView {
            correlation_id: handle.correlation_id,
            gates_passed: GateSet::empty(),
            opened_at: handle.opened_at,
        };
        let verdict = self
            .services
            .pipeline
            .evaluate(
                &view,
                request,
                &mut self.crossing.evaluation,
                cancel,
                self.services.events.as_ref(),
            )
            .await;

        match verdict {
            Verdict::AllPassed => {
                self.transition(handle.correlation_id, Trigger::AllGatesPass);
                Ok(Admission::Admitted(*handle))
            }
            Verdict::Failed { gate, failure } => {
                let error = KernelError::from_gate_failure(gate, failure.kind, failure.detail);
                self.fault(error.clone(), Trigger::GateFails);
                Ok(Admission::Refused {
                    handle: *handle,
                    error,
                })
            }
            Verdict::Cancelled { pending } => {
                let error = KernelError::CancellationFault {
                    gate: Some(pending),
                    detail: format!("cancelled before {}", pending),
                };
                self.fault(error.clone(), Trigger::GateFails);
                Ok(Admission::Refused {
                    handle: *handle,
                    error,
                })
            }
        }
    }

    /// OperationComplete: ACTIVE → EXITING.
    pub fn record_complete(&mut self, handle: &CrossingHandle) -> Result<(), KernelError> {
        self.require_active(handle, "record completion")?;
        self.transition(handle.correlation_id, Trigger::OperationComplete);
        Ok(())
    }

    /// Cancellation delivered while ACTIVE. Returns the error now pending.
    pub fn record_cancelled(
        &mut self,
        handle: &CrossingHandle,
        detail: impl Into<String>,
    ) -> Result<KernelError, KernelError> {
        self.require_active(handle, "cancel")?;
        let error = KernelError::CancellationFault {
            gate: None,
            detail: detail.into(),
        };
        self.fault(error.clone(), Trigger::AsyncCancelOrK8Fail);
        Ok(error)
    }

    /// The caller's operation returned an error while ACTIVE. Returns the
    /// error now pending.
    pub fn record_operation_failure(
        &mut self,
        handle: &CrossingHandle,
        detail: impl Into<String>,
    ) -> Result<KernelError, KernelError> {
        self.require_active(handle, "record operation failure")?;
        let error = KernelError::OperationFailed {
            detail: detail.into(),
        };
        self.fault(error.clone(), Trigger::AsyncCancelOrK8Fail);
        Ok(error)
    }

    /// Behavioral evaluation failed after the operation started. K8 moves
    /// from passed to failed. Returns the error now pending.
    pub fn record_eval_failure(
        &mut self,
        handle: &CrossingHandle,
        detail: impl Into<String>,
    ) -> Result<KernelError, KernelError> {
        self.require_active(handle, "record behavioral failure")?;
        self.crossing.evaluation.record_fail(GateId::K8);
        let error = KernelError::EvalGateFailure {
            kind: FailureKind::Rejected,
            detail: detail.into(),
        };
        self.fault(error.clone(), Trigger::AsyncCancelOrK8Fail);
        Ok(error)
    }

    /// Write the audit record and close the crossing.
    ///
    /// From EXITING a durable append returns the context to IDLE; a failed
    /// or late append faults it. From FAULTED the pending error is returned
    /// and stays pending.
    pub async fn exit(&mut self, handle: &CrossingHandle) -> Result<AuditReceipt, KernelError> {
        self.check_handle(handle)?;
        match self.crossing.state {
            CrossingState::Exiting => {}
            CrossingState::Faulted => {
                return Err(self
                    .faults
                    .fault()
                    .map(|f| f.error.clone())
                    .unwrap_or(KernelError::NoPendingFault));
            }
            state => {
                return Err(KernelError::InvalidTransition {
                    state,
                    action: "exit",
                })
            }
        }

        let Some(request) = self.crossing.request.as_ref() else {
            return Err(KernelError::InvalidTransition {
                state: self.crossing.state,
                action: "exit without a request",
            });
        };
        let gates_passed = self.crossing.evaluation.passed();
        let record = AuditRecord {
            correlation_id: handle.correlation_id,
            outcome: CrossingOutcome::Committed,
            gates_passed,
            summary: self.services.redactor.summarize(request),
            opened_at: handle.opened_at,
            recorded_at: Utc::now(),
        };
        let recorded_at = record.recorded_at;

        let budget = self.services.ledger_budget;
        let appended = tokio::time::timeout(budget, self.services.ledger.append(record))
            .await
            .unwrap_or_else(|_| Err(LedgerError::Timeout(budget.as_millis() as u64)));

        match appended {
            Ok(()) => {
                self.crossing.wal_written = true;
                self.services
                    .in_flight_keys
                    .release(&handle.idempotency_key, &handle.correlation_id);
                self.release_correlation();
                self.transition(handle.correlation_id, Trigger::ExitSuccess);
                self.crossing = BoundaryCrossing::default();
                info!(correlation_id = %handle.correlation_id, "audit record written");
                Ok(AuditReceipt {
                    correlation_id: handle.correlation_id,
                    idempotency_key: handle.idempotency_key,
                    gates_passed,
                    wal_written: true,
                    recorded_at,
                })
            }
            Err(e) => {
                let kind = match e {
                    LedgerError::Timeout(_) => FailureKind::Timeout,
                    LedgerError::DuplicateRecord(_) => FailureKind::Rejected,
                    LedgerError::Unavailable(_) => FailureKind::Unavailable,
                };
                let error = KernelError::DurabilityFailure {
                    kind,
                    detail: e.to_string(),
                };
                self.fault(error.clone(), Trigger::ExitFails);
                Err(error)
            }
        }
    }

    /// Fault a crossing whose driver went away mid-transition.
    ///
    /// A crossing left in ENTERING, ACTIVE or EXITING by a dropped future
    /// would otherwise never move again. ENTERING fails the gate that was
    /// pending, ACTIVE is a cancellation, and EXITING is a durability failure
    /// since the append was never confirmed. Returns the error now pending,
    /// or `None` if the crossing was not live.
    pub fn abandon(&mut self, detail: impl Into<String>) -> Option<KernelError> {
        let detail = detail.into();
        let (error, trigger) = match self.crossing.state {
            CrossingState::Entering => {
                let gate = self.crossing.evaluation.abandon();
                (
                    KernelError::CancellationFault { gate, detail },
                    Trigger::GateFails,
                )
            }
            CrossingState::Active => (
                KernelError::CancellationFault { gate: None, detail },
                Trigger::AsyncCancelOrK8Fail,
            ),
            CrossingState::Exiting => (
                KernelError::DurabilityFailure {
                    kind: FailureKind::Cancelled,
                    detail,
                },
                Trigger::ExitFails,
            ),
            CrossingState::Idle | CrossingState::Faulted => return None,
        };
        warn!(
            correlation_id = ?self.crossing.correlation_id,
            state = %self.crossing.state,
            %error,
            "crossing abandoned"
        );
        self.fault(error.clone(), trigger);
        Some(error)
    }

    /// ExceptionConsumed: FAULTED → IDLE.
    pub fn acknowledge_fault(&mut self, handle: &CrossingHandle) -> Result<Ack, KernelError> {
        if self.crossing.state != CrossingState::Faulted {
            return Err(KernelError::NoPendingFault);
        }
        self.check_handle(handle)?;
        let ack = self.faults.consume().ok_or(KernelError::NoPendingFault)?;
        self.transition(ack.correlation_id, Trigger::ExceptionConsumed);
        self.crossing = BoundaryCrossing::default();
        debug!(correlation_id = %ack.correlation_id, error = %ack.error, "fault acknowledged");
        Ok(ack)
    }

    fn require_active(
        &self,
        handle: &CrossingHandle,
        action: &'static str,
    ) -> Result<(), KernelError> {
        self.check_handle(handle)?;
        if self.crossing.state != CrossingState::Active {
            return Err(KernelError::InvalidTransition {
                state: self.crossing.state,
                action,
            });
        }
        Ok(())
    }

    /// Id of the crossing this context hosts, live or faulted.
    fn hosted_id(&self) -> Option<CorrelationId> {
        self.crossing
            .correlation_id
            .or_else(|| self.faults.fault().map(|f| f.correlation_id))
    }

    fn check_handle(&self, handle: &CrossingHandle) -> Result<(), KernelError> {
        let hosted = self.hosted_id();
        if hosted != Some(handle.correlation_id) {
            return Err(KernelError::HandleMismatch {
                expected: hosted,
                got: handle.correlation_id,
            });
        }
        Ok(())
    }

    fn release_correlation(&mut self) -> Option<CorrelationId> {
        let id = self.crossing.correlation_id.take()?;
        self.services.correlations.release(&id);
        Some(id)
    }

    fn fault(&mut self, error: KernelError, trigger: Trigger) {
        let Some(id) = self.release_correlation() else {
            warn!(%error, %trigger, "fault raised without a live crossing");
            return;
        };
        // a faulted crossing never commits, so a retry is not a duplicate
        if let Some(request) = &self.crossing.request {
            self.services
                .in_flight_keys
                .release(&request.idempotency_key(), &id);
        }
        self.faults.raise(Fault::new(id, error, trigger));
        self.transition(id, trigger);
    }

    fn transition(&mut self, id: CorrelationId, trigger: Trigger) {
        let (from, to) = trigger.edge();
        debug_assert_eq!(self.crossing.state, from, "{trigger} fired from wrong state");
        self.crossing.state = to;

        debug_assert!(
            self.snapshot().check().is_ok(),
            "invariant broken after {trigger}: {:?}",
            self.snapshot().check()
        );

        self.state_tx.send_replace(to);
        self.services.events.emit(&KernelEvent::Transition {
            correlation_id: id,
            from,
            to,
            trigger,
            at: Utc::now(),
        });
    }
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("crossing", &self.crossing)
            .field("faults", &self.faults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::ledger::InMemoryAuditLedger;
    use crate::mocks::{
        scripted_gates, scripted_pipeline, FailingLedger, RecordingEventSink, ScriptedGate,
    };
    use serde_json::json;

    fn request() -> CrossingRequest {
        CrossingRequest::new("transfer", "agent-7", json!({"amount": 10}))
    }

    fn context_with(
        gates: &[Arc<ScriptedGate>],
        ledger: Arc<dyn AuditLedger>,
    ) -> (KernelContext, Arc<RecordingEventSink>) {
        let pipeline = scripted_pipeline(gates).build().unwrap();
        let sink = Arc::new(RecordingEventSink::new());
        let services = KernelServices::new(pipeline, ledger, &KernelConfig::default())
            .with_events(sink.clone());
        (KernelContext::new(services), sink)
    }

    #[tokio::test]
    async fn happy_path_returns_to_idle() {
        let ledger = Arc::new(InMemoryAuditLedger::new());
        let (mut ctx, sink) = context_with(&scripted_gates(), ledger.clone());
        let cancel = CancellationToken::new();

        let admission = ctx.enter(request(), &cancel).await.unwrap();
        assert!(admission.is_admitted());
        let handle = *admission.handle();
        assert_eq!(ctx.state(), CrossingState::Active);
        assert!(ctx.snapshot().gates_passed.is_all());

        ctx.record_complete(&handle).unwrap();
        let receipt = ctx.exit(&handle).await.unwrap();
        assert!(receipt.wal_written);
        assert_eq!(ctx.state(), CrossingState::Idle);
        assert_eq!(ctx.snapshot(), CrossingSnapshot::idle());
        assert_eq!(ledger.len().await, 1);
        assert_eq!(
            sink.triggers(),
            vec![
                Trigger::Aenter,
                Trigger::AllGatesPass,
                Trigger::OperationComplete,
                Trigger::ExitSuccess
            ]
        );
    }

    #[tokio::test]
    async fn refusal_faults_and_releases_correlation() {
        let mut gates = scripted_gates();
        gates[1] = Arc::new(ScriptedGate::fail(GateId::K2, "role missing"));
        let (mut ctx, _) = context_with(&gates, Arc::new(InMemoryAuditLedger::new()));

        let admission = ctx.enter(request(), &CancellationToken::new()).await.unwrap();
        let handle = *admission.handle();
        assert!(matches!(
            admission.error(),
            Some(KernelError::PermissionDenied {
                kind: FailureKind::Rejected,
                ..
            })
        ));

        let snap = ctx.snapshot();
        assert_eq!(snap.state, CrossingState::Faulted);
        assert_eq!(snap.correlation_id, None);
        assert!(snap.exception_pending);
        assert!(!ctx.services.correlations.is_live(&handle.correlation_id));

        // exit reports the pending error without clearing it
        assert!(matches!(
            ctx.exit(&handle).await,
            Err(KernelError::PermissionDenied { .. })
        ));
        assert_eq!(ctx.state(), CrossingState::Faulted);

        let ack = ctx.acknowledge_fault(&handle).unwrap();
        assert_eq!(ack.gate(), Some(GateId::K2));
        assert_eq!(ctx.state(), CrossingState::Idle);
    }

    #[tokio::test]
    async fn reentry_is_rejected() {
        let (mut ctx, _) = context_with(&scripted_gates(), Arc::new(InMemoryAuditLedger::new()));
        let cancel = CancellationToken::new();
        ctx.enter(request(), &cancel).await.unwrap();

        let err = ctx.enter(request(), &cancel).await.unwrap_err();
        assert!(matches!(err, KernelError::ReentrancyViolation { .. }));
        assert_eq!(ctx.state(), CrossingState::Active);
    }

    #[tokio::test]
    async fn ledger_failure_faults_on_exit() {
        let (mut ctx, sink) = context_with(&scripted_gates(), Arc::new(FailingLedger::new("disk gone")));
        let handle = *ctx
            .enter(request(), &CancellationToken::new())
            .await
            .unwrap()
            .handle();
        ctx.record_complete(&handle).unwrap();

        let err = ctx.exit(&handle).await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::DurabilityFailure {
                kind: FailureKind::Unavailable,
                ..
            }
        ));
        let snap = ctx.snapshot();
        assert_eq!(snap.state, CrossingState::Faulted);
        assert!(!snap.wal_written);
        assert_eq!(sink.triggers().last(), Some(&Trigger::ExitFails));
    }

    #[tokio::test]
    async fn eval_failure_moves_k8_to_failed() {
        let (mut ctx, _) = context_with(&scripted_gates(), Arc::new(InMemoryAuditLedger::new()));
        let handle = *ctx
            .enter(request(), &CancellationToken::new())
            .await
            .unwrap()
            .handle();

        let err = ctx.record_eval_failure(&handle, "drifted").unwrap();
        assert!(matches!(err, KernelError::EvalGateFailure { .. }));
        let snap = ctx.snapshot();
        assert!(snap.gates_failed.contains(GateId::K8));
        assert!(!snap.gates_passed.contains(GateId::K8));
        assert!(snap.check().is_ok());
    }

    #[tokio::test]
    async fn foreign_handle_is_rejected() {
        let (mut ctx, _) = context_with(&scripted_gates(), Arc::new(InMemoryAuditLedger::new()));
        let handle = *ctx
            .enter(request(), &CancellationToken::new())
            .await
            .unwrap()
            .handle();
        let foreign = CrossingHandle {
            correlation_id: CorrelationId::new(),
            ..handle
        };
        assert!(matches!(
            ctx.record_complete(&foreign),
            Err(KernelError::HandleMismatch { .. })
        ));
        assert!(matches!(
            ctx.acknowledge_fault(&handle),
            Err(KernelError::NoPendingFault)
        ));
    }

    #[tokio::test]
    async fn dropped_evaluation_can_be_abandoned() {
        let mut gates = scripted_gates();
        gates[2] = Arc::new(ScriptedGate::pass(GateId::K3).with_delay(Duration::from_secs(1)));
        let (mut ctx, sink) = context_with(&gates, Arc::new(InMemoryAuditLedger::new()));

        let late = tokio::time::timeout(
            Duration::from_millis(10),
            ctx.enter(request(), &CancellationToken::new()),
        )
        .await;
        assert!(late.is_err());
        assert_eq!(ctx.state(), CrossingState::Entering);
        let id = ctx.crossing().correlation_id.unwrap();

        let err = ctx.abandon("driver dropped").unwrap();
        assert_eq!(
            err,
            KernelError::CancellationFault {
                gate: Some(GateId::K3),
                detail: "driver dropped".into()
            }
        );
        let snap = ctx.snapshot();
        assert_eq!(snap.state, CrossingState::Faulted);
        assert_eq!(snap.gates_failed, [GateId::K3].into_iter().collect::<GateSet>());
        assert!(snap.check().is_ok());
        assert!(!ctx.services.correlations.is_live(&id));
        assert_eq!(sink.triggers().last(), Some(&Trigger::GateFails));

        assert_eq!(ctx.abandon("again"), None);
    }

    #[tokio::test]
    async fn operation_failure_is_not_a_cancellation() {
        let (mut ctx, _) = context_with(&scripted_gates(), Arc::new(InMemoryAuditLedger::new()));
        let handle = *ctx
            .enter(request(), &CancellationToken::new())
            .await
            .unwrap()
            .handle();

        let err = ctx.record_operation_failure(&handle, "upstream 503").unwrap();
        assert_eq!(
            err,
            KernelError::OperationFailed {
                detail: "upstream 503".into()
            }
        );
        assert_eq!(ctx.state(), CrossingState::Faulted);
    }

    #[tokio::test]
    async fn fault_releases_reserved_key() {
        let mut gates = scripted_gates();
        gates[7] = Arc::new(ScriptedGate::fail(GateId::K8, "outlier"));
        let (mut ctx, _) = context_with(&gates, Arc::new(InMemoryAuditLedger::new()));
        let req = request();
        let key = req.idempotency_key();

        let handle = ctx.begin(req).unwrap();
        ctx.services
            .in_flight_keys
            .reserve(key, handle.correlation_id)
            .unwrap();
        ctx.evaluate(&handle, &CancellationToken::new()).await.unwrap();

        assert_eq!(ctx.state(), CrossingState::Faulted);
        assert!(ctx.services.in_flight_keys.is_empty());
    }

    #[tokio::test]
    async fn watch_channel_tracks_state() {
        let (mut ctx, _) = context_with(&scripted_gates(), Arc::new(InMemoryAuditLedger::new()));
        let rx = ctx.subscribe();
        ctx.enter(request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(*rx.borrow(), CrossingState::Active);
    }
}
