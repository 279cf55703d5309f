use std::fmt;

use boundary_types::{CorrelationId, CrossingState, GateId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a gate did not pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The gate evaluated the crossing and refused it.
    Rejected,
    /// The gate (or the approval it waited on) exceeded its budget.
    Timeout,
    /// The gate could not reach its backing service.
    Unavailable,
    /// The crossing was cancelled while the gate was evaluating.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Rejected => "rejected",
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Caller-facing errors of the boundary kernel.
///
/// One variant per gate category plus the structural errors of the state
/// machine. Gate variants keep the failure kind and the gate's own detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("K1 schema violation ({kind}): {detail}")]
    SchemaViolation { kind: FailureKind, detail: String },

    #[error("K2 permission denied ({kind}): {detail}")]
    PermissionDenied { kind: FailureKind, detail: String },

    #[error("K3 bounds exceeded ({kind}): {detail}")]
    BoundsExceeded { kind: FailureKind, detail: String },

    #[error("K4 trace injection failed ({kind}): {detail}")]
    TraceInjectionFailure { kind: FailureKind, detail: String },

    #[error("K5 idempotency conflict ({kind}): {detail}")]
    IdempotencyConflict { kind: FailureKind, detail: String },

    #[error("durability failure ({kind}): {detail}")]
    DurabilityFailure { kind: FailureKind, detail: String },

    #[error("K7 approval required: {detail}")]
    ApprovalRequired { detail: String },

    #[error("K7 approval denied: {detail}")]
    ApprovalDenied { detail: String },

    #[error("K8 behavioral evaluation failed ({kind}): {detail}")]
    EvalGateFailure { kind: FailureKind, detail: String },

    #[error("reentrancy violation: {detail}")]
    ReentrancyViolation { detail: String },

    #[error("crossing cancelled: {detail}")]
    CancellationFault { gate: Option<GateId>, detail: String },

    #[error("operation failed: {detail}")]
    OperationFailed { detail: String },

    #[error("invalid transition: cannot {action} while {state}")]
    InvalidTransition {
        state: CrossingState,
        action: &'static str,
    },

    #[error("handle {got} does not belong to this context (hosting {expected:?})")]
    HandleMismatch {
        expected: Option<CorrelationId>,
        got: CorrelationId,
    },

    #[error("unknown crossing: {0}")]
    UnknownCrossing(CorrelationId),

    #[error("no fault pending")]
    NoPendingFault,

    #[error("pipeline misconfigured: {0}")]
    PipelineMisconfigured(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl KernelError {
    /// Map a gate's failure to the caller-facing error of its category.
    pub fn from_gate_failure(gate: GateId, kind: FailureKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if kind == FailureKind::Cancelled {
            return KernelError::CancellationFault {
                gate: Some(gate),
                detail,
            };
        }
        match gate {
            GateId::K1 => KernelError::SchemaViolation { kind, detail },
            GateId::K2 => KernelError::PermissionDenied { kind, detail },
            GateId::K3 => KernelError::BoundsExceeded { kind, detail },
            GateId::K4 => KernelError::TraceInjectionFailure { kind, detail },
            GateId::K5 => KernelError::IdempotencyConflict { kind, detail },
            GateId::K6 => KernelError::DurabilityFailure { kind, detail },
            GateId::K7 => match kind {
                FailureKind::Rejected => KernelError::ApprovalDenied { detail },
                _ => KernelError::ApprovalRequired { detail },
            },
            GateId::K8 => KernelError::EvalGateFailure { kind, detail },
        }
    }

    /// The gate this error is attributed to, if any.
    pub fn gate(&self) -> Option<GateId> {
        match self {
            KernelError::SchemaViolation { .. } => Some(GateId::K1),
            KernelError::PermissionDenied { .. } => Some(GateId::K2),
            KernelError::BoundsExceeded { .. } => Some(GateId::K3),
            KernelError::TraceInjectionFailure { .. } => Some(GateId::K4),
            KernelError::IdempotencyConflict { .. } => Some(GateId::K5),
            KernelError::DurabilityFailure { .. } => Some(GateId::K6),
            KernelError::ApprovalRequired { .. } | KernelError::ApprovalDenied { .. } => {
                Some(GateId::K7)
            }
            KernelError::EvalGateFailure { .. } => Some(GateId::K8),
            KernelError::CancellationFault { gate, .. } => *gate,
            _ => None,
        }
    }

    /// Whether a fresh crossing carrying the same idempotency key may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            KernelError::DurabilityFailure { .. }
            | KernelError::ApprovalRequired { .. }
            | KernelError::CancellationFault { .. }
            | KernelError::OperationFailed { .. } => true,
            KernelError::SchemaViolation { kind, .. }
            | KernelError::PermissionDenied { kind, .. }
            | KernelError::BoundsExceeded { kind, .. }
            | KernelError::TraceInjectionFailure { kind, .. }
            | KernelError::IdempotencyConflict { kind, .. }
            | KernelError::EvalGateFailure { kind, .. } => *kind != FailureKind::Rejected,
            _ => false,
        }
    }
}

/// Errors raised by a gate that could not evaluate at all.
///
/// The pipeline turns these into `Fail(Unavailable, ..)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("backing service unavailable: {0}")]
    Unavailable(String),

    #[error("gate internal error: {0}")]
    Internal(String),
}

/// Errors from an [`AuditLedger`](crate::ledger::AuditLedger) sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("audit record already written for crossing {0}")]
    DuplicateRecord(CorrelationId),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger write exceeded {0}ms")]
    Timeout(u64),
}
