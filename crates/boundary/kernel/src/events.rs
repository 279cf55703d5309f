//! Observability hook: one event per state transition.

use std::fmt;

use boundary_types::{CorrelationId, CrossingState, GateId, ResumeToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Named transitions of the crossing state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    Aenter,
    AllGatesPass,
    GateFails,
    OperationComplete,
    AsyncCancelOrK8Fail,
    ExitSuccess,
    ExitFails,
    ExceptionConsumed,
}

impl Trigger {
    /// The (from, to) pair this trigger is defined for.
    pub fn edge(&self) -> (CrossingState, CrossingState) {
        use CrossingState::*;
        match self {
            Trigger::Aenter => (Idle, Entering),
            Trigger::AllGatesPass => (Entering, Active),
            Trigger::GateFails => (Entering, Faulted),
            Trigger::OperationComplete => (Active, Exiting),
            Trigger::AsyncCancelOrK8Fail => (Active, Faulted),
            Trigger::ExitSuccess => (Exiting, Idle),
            Trigger::ExitFails => (Exiting, Faulted),
            Trigger::ExceptionConsumed => (Faulted, Idle),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    Transition {
        correlation_id: CorrelationId,
        from: CrossingState,
        to: CrossingState,
        trigger: Trigger,
        at: DateTime<Utc>,
    },
    /// A gate suspended; the crossing waits for approval (still ENTERING).
    Suspended {
        correlation_id: CorrelationId,
        gate: GateId,
        token: ResumeToken,
        at: DateTime<Utc>,
    },
    /// A suspended gate was resolved.
    Resumed {
        correlation_id: CorrelationId,
        gate: GateId,
        approved: bool,
        at: DateTime<Utc>,
    },
}

impl KernelEvent {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            KernelEvent::Transition { correlation_id, .. }
            | KernelEvent::Suspended { correlation_id, .. }
            | KernelEvent::Resumed { correlation_id, .. } => *correlation_id,
        }
    }
}

/// Receives kernel events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &KernelEvent);
}

/// Logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &KernelEvent) {
        match event {
            KernelEvent::Transition {
                correlation_id,
                from,
                to,
                trigger,
                ..
            } => match to {
                CrossingState::Faulted => warn!(
                    correlation_id = %correlation_id,
                    %from, %to, %trigger,
                    "crossing faulted"
                ),
                CrossingState::Idle if *trigger == Trigger::ExitSuccess => info!(
                    correlation_id = %correlation_id,
                    %from, %to, %trigger,
                    "crossing committed"
                ),
                _ => debug!(
                    correlation_id = %correlation_id,
                    %from, %to, %trigger,
                    "crossing transition"
                ),
            },
            KernelEvent::Suspended {
                correlation_id,
                gate,
                token,
                ..
            } => info!(
                correlation_id = %correlation_id,
                %gate, %token,
                "gate suspended awaiting approval"
            ),
            KernelEvent::Resumed {
                correlation_id,
                gate,
                approved,
                ..
            } => debug!(
                correlation_id = %correlation_id,
                %gate, approved,
                "suspended gate resolved"
            ),
        }
    }
}

/// Fans events out to any number of subscribers (dashboards, telemetry).
///
/// Slow subscribers lag and drop events; emitters never block.
#[derive(Clone, Debug)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<KernelEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &KernelEvent) {
        // no subscribers is not an error
        let _ = self.tx.send(event.clone());
    }
}

/// Emits to several sinks in order.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: &KernelEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
