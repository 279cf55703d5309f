use std::sync::Arc;
use std::time::Duration;

use boundary_types::{GateId, GateSet, ResumeToken};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::approval::{ApprovalDecision, ApprovalResolver};
use crate::config::KernelConfig;
use crate::error::{FailureKind, KernelError};
use crate::events::{EventSink, KernelEvent};
use crate::gate::{CrossingView, Gate, GateFailure, GateOutcome};
use crate::request::CrossingRequest;

/// Sub-phase of ENTERING.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EnteringPhase {
    #[default]
    Evaluating,
    /// A gate suspended and the crossing waits for its resolution.
    AwaitingApproval { gate: GateId, token: ResumeToken },
}

/// Per-crossing gate bookkeeping, owned by the crossing and updated only by
/// the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GateEvaluation {
    passed: GateSet,
    failed: GateSet,
    phase: EnteringPhase,
}

impl GateEvaluation {
    pub fn passed(&self) -> GateSet {
        self.passed
    }

    pub fn failed(&self) -> GateSet {
        self.failed
    }

    pub fn phase(&self) -> &EnteringPhase {
        &self.phase
    }

    pub fn is_awaiting_approval(&self) -> bool {
        matches!(self.phase, EnteringPhase::AwaitingApproval { .. })
    }

    pub(crate) fn record_pass(&mut self, gate: GateId) {
        if !self.failed.contains(gate) {
            self.passed.insert(gate);
        }
    }

    /// A failed gate is never also in the passed set.
    pub(crate) fn record_fail(&mut self, gate: GateId) {
        self.passed.remove(gate);
        self.failed.insert(gate);
    }

    /// Close out an evaluation that stopped mid-flight: the first gate that
    /// had not passed is recorded as failed and any suspension ends.
    pub(crate) fn abandon(&mut self) -> Option<GateId> {
        self.phase = EnteringPhase::Evaluating;
        let pending = GateId::ALL
            .into_iter()
            .find(|g| !self.passed.contains(*g) && !self.failed.contains(*g))?;
        self.record_fail(pending);
        Some(pending)
    }
}

/// Aggregate result of one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    AllPassed,
    /// `gate` was attempted and did not pass; evaluation stopped there.
    Failed { gate: GateId, failure: GateFailure },
    /// Cancellation observed between gates; `pending` was never attempted.
    Cancelled { pending: GateId },
}

/// Ordered, immutable list of the eight gates.
///
/// Evaluation is strictly sequential K1 → K8 and stops at the first gate
/// that does not pass. Only attempted gates are recorded.
pub struct GatePipeline {
    gates: Vec<Arc<dyn Gate>>,
    budgets: [Duration; 8],
    approval_budget: Duration,
    resolver: Option<Arc<dyn ApprovalResolver>>,
}

impl std::fmt::Debug for GatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePipeline")
            .field(
                "gates",
                &self.gates.iter().map(|g| g.name().to_string()).collect::<Vec<_>>(),
            )
            .field("budgets", &self.budgets)
            .field("approval_budget", &self.approval_budget)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl GatePipeline {
    pub fn builder() -> GatePipelineBuilder {
        GatePipelineBuilder::default()
    }

    pub fn gates(&self) -> impl Iterator<Item = &Arc<dyn Gate>> {
        self.gates.iter()
    }

    pub fn budget(&self, gate: GateId) -> Duration {
        self.budgets[gate.index()]
    }

    /// Run every gate against the crossing, updating `evaluation` in place.
    pub async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
        evaluation: &mut GateEvaluation,
        cancel: &CancellationToken,
        events: &dyn EventSink,
    ) -> Verdict {
        for gate in &self.gates {
            let id = gate.id();
            if cancel.is_cancelled() {
                debug!(correlation_id = %crossing.correlation_id, gate = %id, "cancelled before gate");
                return Verdict::Cancelled { pending: id };
            }

            let view = CrossingView {
                gates_passed: evaluation.passed(),
                ..*crossing
            };
            let mut outcome = self.run_gate(gate.as_ref(), &view, request, cancel).await;

            if let GateOutcome::Suspend(token) = outcome {
                outcome = self
                    .await_resolution(id, token, &view, evaluation, cancel, events)
                    .await;
            }

            match outcome {
                GateOutcome::Pass => {
                    evaluation.record_pass(id);
                    debug!(correlation_id = %crossing.correlation_id, gate = %id, "gate passed");
                }
                GateOutcome::Fail(failure) => {
                    evaluation.record_fail(id);
                    warn!(
                        correlation_id = %crossing.correlation_id,
                        gate = %id,
                        kind = %failure.kind,
                        detail = %failure.detail,
                        "gate failed"
                    );
                    return Verdict::Failed { gate: id, failure };
                }
                GateOutcome::Suspend(_) => {
                    // await_resolution never yields another suspension
                    evaluation.record_fail(id);
                    return Verdict::Failed {
                        gate: id,
                        failure: GateFailure::new(
                            FailureKind::Unavailable,
                            "gate suspended twice",
                        ),
                    };
                }
            }
        }

        Verdict::AllPassed
    }

    async fn run_gate(
        &self,
        gate: &dyn Gate,
        view: &CrossingView,
        request: &CrossingRequest,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let budget = self.budget(gate.id());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => GateOutcome::Fail(GateFailure::new(
                FailureKind::Cancelled,
                format!("cancelled during {}", gate.name()),
            )),
            result = tokio::time::timeout(budget, gate.evaluate(view, request)) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => GateOutcome::Fail(GateFailure::new(FailureKind::Unavailable, e.to_string())),
                Err(_) => GateOutcome::Fail(GateFailure::new(
                    FailureKind::Timeout,
                    format!("{} exceeded its {}ms budget", gate.name(), budget.as_millis()),
                )),
            },
        }
    }

    async fn await_resolution(
        &self,
        gate: GateId,
        token: ResumeToken,
        view: &CrossingView,
        evaluation: &mut GateEvaluation,
        cancel: &CancellationToken,
        events: &dyn EventSink,
    ) -> GateOutcome {
        evaluation.phase = EnteringPhase::AwaitingApproval {
            gate,
            token: token.clone(),
        };
        events.emit(&KernelEvent::Suspended {
            correlation_id: view.correlation_id,
            gate,
            token: token.clone(),
            at: Utc::now(),
        });

        let outcome = match &self.resolver {
            None => GateOutcome::Fail(GateFailure::new(
                FailureKind::Unavailable,
                "gate suspended but no approval resolver is configured",
            )),
            Some(resolver) => {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => GateOutcome::Fail(GateFailure::new(
                        FailureKind::Cancelled,
                        format!("cancelled while awaiting approval {}", token),
                    )),
                    result = tokio::time::timeout(self.approval_budget, resolver.resolve(gate, &token, view)) => {
                        match result {
                            Ok(Ok(ApprovalDecision::Approved)) => GateOutcome::Pass,
                            Ok(Ok(ApprovalDecision::Denied(reason))) => GateOutcome::fail(reason),
                            Ok(Err(e)) => GateOutcome::Fail(GateFailure::new(FailureKind::Unavailable, e.to_string())),
                            Err(_) => GateOutcome::Fail(GateFailure::new(
                                FailureKind::Timeout,
                                format!(
                                    "approval {} not granted within {}ms",
                                    token,
                                    self.approval_budget.as_millis()
                                ),
                            )),
                        }
                    }
                };
                resolver.release(&token);
                outcome
            }
        };

        evaluation.phase = EnteringPhase::Evaluating;
        events.emit(&KernelEvent::Resumed {
            correlation_id: view.correlation_id,
            gate,
            approved: outcome.is_pass(),
            at: Utc::now(),
        });
        outcome
    }
}

/// Builds a [`GatePipeline`], refusing anything but K1..K8 in canonical order.
pub struct GatePipelineBuilder {
    gates: Vec<Arc<dyn Gate>>,
    config: KernelConfig,
    resolver: Option<Arc<dyn ApprovalResolver>>,
}

impl Default for GatePipelineBuilder {
    fn default() -> Self {
        Self {
            gates: Vec::new(),
            config: KernelConfig::default(),
            resolver: None,
        }
    }
}

impl GatePipelineBuilder {
    /// Append a gate. Gates must be added in order K1 through K8.
    pub fn gate(mut self, gate: Arc<dyn Gate>) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn config(mut self, config: &KernelConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn approvals(mut self, resolver: Arc<dyn ApprovalResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> Result<GatePipeline, KernelError> {
        if self.gates.len() != GateId::ALL.len() {
            return Err(KernelError::PipelineMisconfigured(format!(
                "expected {} gates, got {}",
                GateId::ALL.len(),
                self.gates.len()
            )));
        }
        for (gate, expected) in self.gates.iter().zip(GateId::ALL) {
            if gate.id() != expected {
                return Err(KernelError::PipelineMisconfigured(format!(
                    "position {} holds {} ({}), expected {}",
                    expected.index() + 1,
                    gate.id(),
                    gate.name(),
                    expected
                )));
            }
        }
        self.config.validate()?;

        let budgets = GateId::ALL.map(|g| self.config.gate_budget(g));
        Ok(GatePipeline {
            gates: self.gates,
            budgets,
            approval_budget: self.config.approval_budget(),
            resolver: self.resolver,
        })
    }
}
