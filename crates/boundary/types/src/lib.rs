//! # boundary-types
//!
//! Value types shared across the boundary-crossing kernel.
//!
//! - [`GateId`] / [`GateSet`]: the fixed eight-gate set K1–K8 and compact
//!   subsets of it (passed / failed sets of one crossing).
//! - [`CrossingState`]: the closed five-state set of a crossing.
//! - [`CorrelationId`], [`IdempotencyKey`], [`ResumeToken`]: identifiers
//!   binding the events of one crossing together.

pub mod gate;
pub mod ids;
pub mod state;

pub use gate::{GateCategory, GateId, GateIdError, GateSet, Sil};
pub use ids::{CorrelationId, IdempotencyKey, IdempotencyKeyError, ResumeToken};
pub use state::CrossingState;
