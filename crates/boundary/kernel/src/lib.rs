//! Boundary Kernel, the invariant kernel every agent action crosses before
//! it reaches the outside world.
//!
//! Each crossing is evaluated by eight independent gates, executed by the
//! caller, and committed to an append-only audit ledger. Any failure along
//! the way leaves the crossing FAULTED until the caller acknowledges it.
//!
//! ## Invariants
//!
//! - **Closed state set**: a crossing is IDLE, ENTERING, ACTIVE, EXITING or
//!   FAULTED, nothing else.
//! - **All gates before action**: ACTIVE implies all eight gates passed and
//!   none failed.
//! - **Disjoint gate sets**: no gate is both passed and failed.
//! - **No early audit**: nothing is written to the ledger while ENTERING.
//! - **Correlation**: a correlation id exists exactly while the crossing is
//!   live (ENTERING, ACTIVE, EXITING).
//! - **Explicit faults**: an exception is pending exactly while FAULTED and
//!   is cleared only by acknowledgment.
//!
//! ## Gate pipeline
//!
//! 1. **K1 Schema**: request structure
//! 2. **K2 Permission**: actor may perform the operation
//! 3. **K3 Bounds**: rate and resource quotas
//! 4. **K4 Trace**: tracing context injected
//! 5. **K5 Idempotency**: no duplicate of a committed crossing
//! 6. **K6 Durability**: audit ledger reachable
//! 7. **K7 Approval**: human-in-the-loop sign-off, may suspend
//! 8. **K8 Behavioral**: behavioral evaluation
//!
//! ## Components
//!
//! - [`GatePipeline`]: ordered, fail-closed K1..K8 evaluation with budgets
//! - [`KernelContext`]: the per-crossing state machine
//! - [`BoundaryKernel`]: concurrent registry of crossings in flight
//! - [`CorrelationAssigner`] / [`IdempotencyKeyDeriver`]: crossing identity
//! - [`InFlightKeys`]: idempotency keys reserved by unfinished crossings
//! - [`AuditLedger`]: append-only audit sink contract
//! - [`FaultTracker`]: pending-exception bookkeeping

pub mod approval;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod events;
pub mod fault;
pub mod gate;
pub mod idempotency;
pub mod kernel;
pub mod ledger;
pub mod mocks;
pub mod pipeline;
pub mod redact;
pub mod request;
pub mod snapshot;

pub use approval::{ApprovalDecision, ApprovalInbox, ApprovalRequest, ApprovalResolver};
pub use config::{KernelConfig, LoggingConfig};
pub use context::{
    Admission, AuditReceipt, BoundaryCrossing, CrossingHandle, KernelContext, KernelServices,
};
pub use correlation::CorrelationAssigner;
pub use error::{FailureKind, GateError, KernelError, LedgerError};
pub use events::{
    BroadcastEventSink, EventSink, FanoutEventSink, KernelEvent, TracingEventSink, Trigger,
};
pub use fault::{Ack, Fault, FaultTracker};
pub use gate::{CrossingView, Gate, GateFailure, GateOutcome};
pub use idempotency::{IdempotencyKeyDeriver, InFlightKeys};
pub use kernel::{BoundaryKernel, CrossingFailure};
pub use ledger::{AuditLedger, AuditRecord, CrossingOutcome, IdempotencyIndex, InMemoryAuditLedger};
pub use pipeline::{EnteringPhase, GateEvaluation, GatePipeline, GatePipelineBuilder, Verdict};
pub use redact::{FieldShape, RedactedSummary, Redactor};
pub use request::CrossingRequest;
pub use snapshot::{CrossingSnapshot, InvariantViolation};

pub use boundary_types::{
    CorrelationId, CrossingState, GateCategory, GateId, GateSet, IdempotencyKey, ResumeToken, Sil,
};
