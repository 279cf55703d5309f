//! Reference gates for the boundary kernel.
//!
//! Each gate makes one kind of decision and delegates the business rule to
//! a provider trait, so deployments swap the provider and keep the gate.
//!
//! | Gate | Provider | In-memory provider |
//! |------|----------|--------------------|
//! | K1 [`SchemaGate`] | [`SchemaValidator`] | [`SchemaRegistry`] |
//! | K2 [`PermissionGate`] | [`PermissionProvider`] | [`StaticPermissions`] |
//! | K3 [`BoundsGate`] | [`QuotaProvider`] | [`InMemoryQuota`] |
//! | K4 [`TraceGate`] | [`TraceInjector`] | [`SpanTraceInjector`] |
//! | K5 [`IdempotencyGate`] | `IdempotencyIndex` | `InMemoryAuditLedger` |
//! | K6 [`DurabilityGate`] | `AuditLedger` | `InMemoryAuditLedger` |
//! | K7 [`ApprovalGate`] | [`ApprovalPolicy`] | [`OperationApprovalPolicy`] |
//! | K8 [`BehavioralEvalGate`] | [`BehaviorEvaluator`] | [`RuleBasedEvaluator`] |

use std::sync::Arc;

use boundary_kernel::{Gate, GatePipeline, GatePipelineBuilder};

pub mod error;
pub mod gates;
pub mod traits;

pub use error::{QuotaExceeded, TraceparentError};
pub use gates::*;
pub use traits::{
    ApprovalPolicy, BehaviorAssessment, BehaviorEvaluator, PermissionProvider, QuotaProvider,
    SchemaValidator, TraceContext, TraceInjector,
};

/// One gate per category, ready to be assembled into a pipeline.
pub struct ReferenceGates {
    pub schema: Arc<SchemaGate>,
    pub permission: Arc<PermissionGate>,
    pub bounds: Arc<BoundsGate>,
    pub trace: Arc<TraceGate>,
    pub idempotency: Arc<IdempotencyGate>,
    pub durability: Arc<DurabilityGate>,
    pub approval: Arc<ApprovalGate>,
    pub behavioral: Arc<BehavioralEvalGate>,
}

impl ReferenceGates {
    /// The gates in canonical K1..K8 order.
    pub fn into_gates(self) -> [Arc<dyn Gate>; 8] {
        [
            self.schema,
            self.permission,
            self.bounds,
            self.trace,
            self.idempotency,
            self.durability,
            self.approval,
            self.behavioral,
        ]
    }

    /// Pipeline builder preloaded with the eight gates.
    pub fn into_builder(self) -> GatePipelineBuilder {
        self.into_gates()
            .into_iter()
            .fold(GatePipeline::builder(), |builder, gate| builder.gate(gate))
    }
}
