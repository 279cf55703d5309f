use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{CrossingRequest, CrossingView, Gate, GateError, GateOutcome};
use boundary_types::{CorrelationId, GateId};
use dashmap::DashMap;
use tracing::info_span;
use uuid::Uuid;

use crate::error::TraceparentError;
use crate::traits::{TraceContext, TraceInjector};

/// Request attribute carrying an upstream W3C `traceparent`.
pub const TRACEPARENT_ATTRIBUTE: &str = "traceparent";

/// Parse `00-<32 hex trace id>-<16 hex parent id>-<2 hex flags>`.
pub fn parse_traceparent(value: &str) -> Result<(String, String), TraceparentError> {
    let err = |reason| TraceparentError {
        value: value.to_string(),
        reason,
    };
    let parts: Vec<&str> = value.split('-').collect();
    let [version, trace_id, parent_id, flags] = parts[..] else {
        return Err(err("expected four dash-separated fields"));
    };
    let is_hex = |s: &str, len: usize| {
        s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    };
    if !is_hex(version, 2) || version == "ff" {
        return Err(err("unsupported version"));
    }
    if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
        return Err(err("invalid trace id"));
    }
    if !is_hex(parent_id, 16) || parent_id.bytes().all(|b| b == b'0') {
        return Err(err("invalid parent id"));
    }
    if !is_hex(flags, 2) {
        return Err(err("invalid flags"));
    }
    Ok((trace_id.to_string(), parent_id.to_string()))
}

/// Builds W3C trace contexts and remembers them per crossing.
///
/// An upstream `traceparent` attribute is continued; otherwise the trace id
/// is derived from the correlation id.
#[derive(Default)]
pub struct SpanTraceInjector {
    contexts: DashMap<CorrelationId, TraceContext>,
}

impl SpanTraceInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context_for(&self, id: &CorrelationId) -> Option<TraceContext> {
        self.contexts.get(id).map(|c| c.clone())
    }

    pub fn forget(&self, id: &CorrelationId) -> Option<TraceContext> {
        self.contexts.remove(id).map(|(_, c)| c)
    }
}

impl TraceInjector for SpanTraceInjector {
    fn inject(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<TraceContext, String> {
        let trace_id = match request.attribute(TRACEPARENT_ATTRIBUTE) {
            Some(upstream) => parse_traceparent(upstream).map_err(|e| e.to_string())?.0,
            None => crossing.correlation_id.as_uuid().simple().to_string(),
        };
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        let context = TraceContext {
            traceparent: format!("00-{trace_id}-{span_id}-01"),
            trace_id,
            span_id,
        };

        let span = info_span!(
            "boundary_crossing",
            correlation_id = %crossing.correlation_id,
            trace_id = %context.trace_id,
            span_id = %context.span_id,
            operation = request.operation(),
        );
        span.in_scope(|| tracing::debug!("trace context injected"));

        self.contexts.insert(crossing.correlation_id, context.clone());
        Ok(context)
    }
}

/// K4: Trace
///
/// Attaches a tracing context to the crossing before it may act.
pub struct TraceGate {
    injector: Arc<dyn TraceInjector>,
}

impl TraceGate {
    pub fn new(injector: Arc<dyn TraceInjector>) -> Self {
        Self { injector }
    }
}

#[async_trait]
impl Gate for TraceGate {
    fn id(&self) -> GateId {
        GateId::K4
    }

    fn name(&self) -> &str {
        "trace"
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        match self.injector.inject(crossing, request) {
            Ok(_) => Ok(GateOutcome::Pass),
            Err(reason) => Ok(GateOutcome::fail(reason)),
        }
    }
}
