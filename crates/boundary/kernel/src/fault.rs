use boundary_types::{CorrelationId, GateId};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::KernelError;
use crate::events::Trigger;

/// A pending exception raised by a non-success transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Crossing the fault belongs to
    pub correlation_id: CorrelationId,
    pub error: KernelError,
    /// Transition that raised it
    pub trigger: Trigger,
    pub raised_at: DateTime<Utc>,
}

impl Fault {
    pub fn new(correlation_id: CorrelationId, error: KernelError, trigger: Trigger) -> Self {
        Self {
            correlation_id,
            error,
            trigger,
            raised_at: Utc::now(),
        }
    }

    pub fn gate(&self) -> Option<GateId> {
        self.error.gate()
    }
}

/// Acknowledgment returned when a caller consumes a fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub correlation_id: CorrelationId,
    pub error: KernelError,
    pub trigger: Trigger,
    pub raised_at: DateTime<Utc>,
    pub acknowledged_at: DateTime<Utc>,
}

impl Ack {
    pub fn gate(&self) -> Option<GateId> {
        self.error.gate()
    }
}

/// Tracks whether an exception is pending.
///
/// The pending flag only goes from true to false through [`consume`](Self::consume).
#[derive(Debug, Default)]
pub struct FaultTracker {
    pending: Option<Fault>,
}

impl FaultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault. If one is already pending the first is kept and
    /// `false` is returned.
    pub fn raise(&mut self, fault: Fault) -> bool {
        if let Some(existing) = &self.pending {
            warn!(
                correlation_id = %existing.correlation_id,
                dropped = %fault.error,
                "fault already pending; keeping the first"
            );
            return false;
        }
        self.pending = Some(fault);
        true
    }

    pub fn pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.pending.as_ref()
    }

    /// Explicitly acknowledge the pending fault.
    pub fn consume(&mut self) -> Option<Ack> {
        self.pending.take().map(|fault| Ack {
            correlation_id: fault.correlation_id,
            error: fault.error,
            trigger: fault.trigger,
            raised_at: fault.raised_at,
            acknowledged_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn fault() -> Fault {
        Fault::new(
            CorrelationId::new(),
            KernelError::from_gate_failure(GateId::K2, FailureKind::Rejected, "no role"),
            Trigger::GateFails,
        )
    }

    #[test]
    fn raise_then_consume() {
        let mut tracker = FaultTracker::new();
        assert!(!tracker.pending());
        assert!(tracker.consume().is_none());

        let f = fault();
        assert!(tracker.raise(f.clone()));
        assert!(tracker.pending());
        assert_eq!(tracker.fault(), Some(&f));

        let ack = tracker.consume().unwrap();
        assert_eq!(ack.correlation_id, f.correlation_id);
        assert_eq!(ack.gate(), Some(GateId::K2));
        assert!(!tracker.pending());
    }

    #[test]
    fn first_fault_wins() {
        let mut tracker = FaultTracker::new();
        let first = fault();
        tracker.raise(first.clone());
        assert!(!tracker.raise(fault()));
        assert_eq!(tracker.fault(), Some(&first));
    }
}
