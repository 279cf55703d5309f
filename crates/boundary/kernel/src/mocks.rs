//! Test doubles for gates, ledgers, approval resolvers and event sinks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use boundary_types::{CorrelationId, CrossingState, GateId, IdempotencyKey, ResumeToken};

use crate::approval::{ApprovalDecision, ApprovalResolver};
use crate::error::{GateError, LedgerError};
use crate::events::{EventSink, KernelEvent, Trigger};
use crate::gate::{CrossingView, Gate, GateOutcome};
use crate::ledger::{AuditLedger, AuditRecord, IdempotencyIndex, InMemoryAuditLedger};
use crate::pipeline::{GatePipeline, GatePipelineBuilder};
use crate::request::CrossingRequest;

/// Gate that returns a fixed outcome and counts its invocations.
pub struct ScriptedGate {
    id: GateId,
    name: String,
    outcome: GateOutcome,
    error: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedGate {
    pub fn new(id: GateId, outcome: GateOutcome) -> Self {
        Self {
            id,
            name: format!("scripted-{}", id),
            outcome,
            error: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn pass(id: GateId) -> Self {
        Self::new(id, GateOutcome::Pass)
    }

    pub fn fail(id: GateId, detail: impl Into<String>) -> Self {
        Self::new(id, GateOutcome::fail(detail))
    }

    pub fn suspend(id: GateId) -> Self {
        Self::new(id, GateOutcome::Suspend(ResumeToken::new()))
    }

    /// Gate that cannot evaluate at all.
    pub fn error(id: GateId, message: impl Into<String>) -> Self {
        let mut gate = Self::pass(id);
        gate.error = Some(message.into());
        gate
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gate for ScriptedGate {
    fn id(&self) -> GateId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(
        &self,
        _crossing: &CrossingView,
        _request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(message) => Err(GateError::Unavailable(message.clone())),
            None => Ok(self.outcome.clone()),
        }
    }
}

/// Eight passing scripted gates, K1..K8.
pub fn scripted_gates() -> Vec<Arc<ScriptedGate>> {
    GateId::ALL
        .iter()
        .map(|g| Arc::new(ScriptedGate::pass(*g)))
        .collect()
}

/// Builder preloaded with the given gates in order.
pub fn scripted_pipeline(gates: &[Arc<ScriptedGate>]) -> GatePipelineBuilder {
    gates
        .iter()
        .fold(GatePipeline::builder(), |builder, gate| builder.gate(gate.clone()))
}

/// Resolver that answers every suspension the same way.
pub struct StaticApprovalResolver {
    decision: ApprovalDecision,
}

impl StaticApprovalResolver {
    pub fn approve() -> Self {
        Self {
            decision: ApprovalDecision::Approved,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Denied(reason.into()),
        }
    }
}

#[async_trait]
impl ApprovalResolver for StaticApprovalResolver {
    async fn resolve(
        &self,
        _gate: GateId,
        _token: &ResumeToken,
        _crossing: &CrossingView,
    ) -> Result<ApprovalDecision, GateError> {
        Ok(self.decision.clone())
    }
}

/// Ledger that refuses every append.
pub struct FailingLedger {
    reason: String,
}

impl FailingLedger {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AuditLedger for FailingLedger {
    async fn append(&self, _record: AuditRecord) -> Result<(), LedgerError> {
        Err(LedgerError::Unavailable(self.reason.clone()))
    }

    async fn precheck(&self) -> Result<(), LedgerError> {
        Err(LedgerError::Unavailable(self.reason.clone()))
    }
}

/// Ledger that fails the first `n` appends, then stores records in memory.
pub struct FlakyLedger {
    failures_left: AtomicUsize,
    inner: InMemoryAuditLedger,
}

impl FlakyLedger {
    pub fn failing(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            inner: InMemoryAuditLedger::new(),
        }
    }

    pub fn inner(&self) -> &InMemoryAuditLedger {
        &self.inner
    }
}

#[async_trait]
impl AuditLedger for FlakyLedger {
    async fn append(&self, record: AuditRecord) -> Result<(), LedgerError> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LedgerError::Unavailable("injected ledger failure".into()));
        }
        self.inner.append(record).await
    }
}

#[async_trait]
impl IdempotencyIndex for FlakyLedger {
    async fn lookup(&self, key: &IdempotencyKey) -> Option<CorrelationId> {
        self.inner.lookup(key).await
    }
}

/// Ledger whose appends take `delay` before delegating to memory.
pub struct SlowLedger {
    delay: Duration,
    inner: InMemoryAuditLedger,
}

impl SlowLedger {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: InMemoryAuditLedger::new(),
        }
    }

    pub fn inner(&self) -> &InMemoryAuditLedger {
        &self.inner
    }
}

#[async_trait]
impl AuditLedger for SlowLedger {
    async fn append(&self, record: AuditRecord) -> Result<(), LedgerError> {
        tokio::time::sleep(self.delay).await;
        self.inner.append(record).await
    }
}

/// Sink that keeps every event for later inspection.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<KernelEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<KernelEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// `(from, to, trigger)` of every transition event, in order.
    pub fn transitions(&self) -> Vec<(CrossingState, CrossingState, Trigger)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                KernelEvent::Transition {
                    from, to, trigger, ..
                } => Some((from, to, trigger)),
                _ => None,
            })
            .collect()
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.transitions().into_iter().map(|(_, _, t)| t).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &KernelEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
