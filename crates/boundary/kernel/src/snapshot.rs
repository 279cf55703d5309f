use boundary_types::{CorrelationId, CrossingState, GateSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Observable fields of one crossing at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossingSnapshot {
    pub state: CrossingState,
    pub correlation_id: Option<CorrelationId>,
    pub gates_passed: GateSet,
    pub gates_failed: GateSet,
    pub wal_written: bool,
    pub exception_pending: bool,
    pub awaiting_approval: bool,
}

/// A safety invariant that does not hold.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("ACTIVE with gates_passed={passed} gates_failed={failed}")]
    ActiveWithoutAllGates { passed: GateSet, failed: GateSet },

    #[error("gates {0} both passed and failed")]
    GatePassedAndFailed(GateSet),

    #[error("wal_written set while ENTERING")]
    WalBeforeGatesResolved,

    #[error("{0} without a correlation id")]
    MissingCorrelation(CrossingState),

    #[error("correlation id present while {0}")]
    StrayCorrelation(CrossingState),

    #[error("exception_pending={pending} while {state}")]
    FaultMismatch { state: CrossingState, pending: bool },

    #[error("awaiting approval while {0}")]
    SuspendedOutsideEntering(CrossingState),
}

impl CrossingSnapshot {
    pub fn idle() -> Self {
        Self {
            state: CrossingState::Idle,
            correlation_id: None,
            gates_passed: GateSet::empty(),
            gates_failed: GateSet::empty(),
            wal_written: false,
            exception_pending: false,
            awaiting_approval: false,
        }
    }

    /// Check every safety invariant of the crossing model.
    pub fn check(&self) -> Result<(), InvariantViolation> {
        if self.state == CrossingState::Active
            && !(self.gates_passed.is_all() && self.gates_failed.is_empty())
        {
            return Err(InvariantViolation::ActiveWithoutAllGates {
                passed: self.gates_passed,
                failed: self.gates_failed,
            });
        }

        let both = self.gates_passed.intersection(&self.gates_failed);
        if !both.is_empty() {
            return Err(InvariantViolation::GatePassedAndFailed(both));
        }

        if self.state == CrossingState::Entering && self.wal_written {
            return Err(InvariantViolation::WalBeforeGatesResolved);
        }

        match (self.state.is_live(), self.correlation_id.is_some()) {
            (true, false) => return Err(InvariantViolation::MissingCorrelation(self.state)),
            (false, true) => return Err(InvariantViolation::StrayCorrelation(self.state)),
            _ => {}
        }

        if self.exception_pending != (self.state == CrossingState::Faulted) {
            return Err(InvariantViolation::FaultMismatch {
                state: self.state,
                pending: self.exception_pending,
            });
        }

        if self.awaiting_approval && self.state != CrossingState::Entering {
            return Err(InvariantViolation::SuspendedOutsideEntering(self.state));
        }

        Ok(())
    }
}

impl Default for CrossingSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
