use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boundary_kernel::{CrossingRequest, CrossingView, Gate, GateError, GateOutcome};
use boundary_types::GateId;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

use crate::error::QuotaExceeded;
use crate::traits::QuotaProvider;

/// Request attribute carrying the quota cost of a crossing (default 1).
pub const COST_ATTRIBUTE: &str = "cost";

struct Window {
    started: Instant,
    used: u64,
}

/// Fixed-window quota per `(actor, operation)`.
pub struct InMemoryQuota {
    default_limit: Option<u64>,
    limits: HashMap<String, u64>,
    window: Duration,
    usage: DashMap<(String, String), Window>,
}

impl InMemoryQuota {
    /// `window` is the length of one accounting window.
    pub fn new(window: Duration) -> Self {
        Self {
            default_limit: None,
            limits: HashMap::new(),
            window,
            usage: DashMap::new(),
        }
    }

    /// Limit applied to operations without their own limit. Unset means
    /// unlimited.
    pub fn default_limit(mut self, limit: u64) -> Self {
        self.default_limit = Some(limit);
        self
    }

    pub fn limit(mut self, operation: impl Into<String>, limit: u64) -> Self {
        self.limits.insert(operation.into(), limit);
        self
    }

    fn limit_for(&self, operation: &str) -> Option<u64> {
        self.limits.get(operation).copied().or(self.default_limit)
    }
}

impl QuotaProvider for InMemoryQuota {
    fn acquire(&self, actor: &str, operation: &str, cost: u64) -> Result<u64, QuotaExceeded> {
        let Some(limit) = self.limit_for(operation) else {
            return Ok(u64::MAX);
        };

        let now = Instant::now();
        let mut window = self
            .usage
            .entry((actor.to_string(), operation.to_string()))
            .or_insert_with(|| Window {
                started: now,
                used: 0,
            });
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.used = 0;
        }

        if window.used.saturating_add(cost) > limit {
            return Err(QuotaExceeded {
                actor: actor.to_string(),
                operation: operation.to_string(),
                limit,
                used: window.used,
                requested: cost,
            });
        }
        window.used += cost;
        Ok(limit - window.used)
    }
}

/// K3: Bounds
///
/// Enforces the payload size limit and the actor's quota.
pub struct BoundsGate {
    quota: Arc<dyn QuotaProvider>,
    max_payload_bytes: Option<usize>,
}

impl BoundsGate {
    pub fn new(quota: Arc<dyn QuotaProvider>) -> Self {
        Self {
            quota,
            max_payload_bytes: None,
        }
    }

    pub fn max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = Some(max);
        self
    }
}

#[async_trait]
impl Gate for BoundsGate {
    fn id(&self) -> GateId {
        GateId::K3
    }

    fn name(&self) -> &str {
        "bounds"
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        if let Some(max) = self.max_payload_bytes {
            let size = serde_json::to_vec(request.payload())
                .map_err(|e| GateError::Internal(e.to_string()))?
                .len();
            if size > max {
                return Ok(GateOutcome::fail(format!(
                    "payload is {size} bytes, limit {max}"
                )));
            }
        }

        let cost = match request.attribute(COST_ATTRIBUTE) {
            None => 1,
            Some(raw) => match raw.parse::<u64>() {
                Ok(cost) => cost,
                Err(_) => return Ok(GateOutcome::fail(format!("invalid cost {raw:?}"))),
            },
        };

        match self.quota.acquire(request.actor(), request.operation(), cost) {
            Ok(_) => Ok(GateOutcome::Pass),
            Err(exceeded) => {
                warn!(correlation_id = %crossing.correlation_id, %exceeded, "quota exceeded");
                Ok(GateOutcome::fail(exceeded.to_string()))
            }
        }
    }
}
