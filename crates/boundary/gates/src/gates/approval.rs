use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{
    ApprovalInbox, ApprovalRequest, CrossingRequest, CrossingView, Gate, GateError, GateOutcome,
};
use boundary_types::{GateId, ResumeToken, Sil};
use chrono::Utc;
use tracing::info;

use crate::traits::ApprovalPolicy;

/// Requires approval for listed operations, and for any request whose
/// numeric payload field exceeds a threshold.
#[derive(Clone, Debug, Default)]
pub struct OperationApprovalPolicy {
    operations: HashSet<String>,
    amount: Option<(String, f64)>,
}

impl OperationApprovalPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(mut self, operation: impl Into<String>) -> Self {
        self.operations.insert(operation.into());
        self
    }

    /// Require approval when `payload[field] > limit`.
    pub fn above(mut self, field: impl Into<String>, limit: f64) -> Self {
        self.amount = Some((field.into(), limit));
        self
    }
}

impl ApprovalPolicy for OperationApprovalPolicy {
    fn requires_approval(&self, request: &CrossingRequest) -> Option<String> {
        if self.operations.contains(request.operation()) {
            return Some(format!("{} always requires approval", request.operation()));
        }
        let (field, limit) = self.amount.as_ref()?;
        let value = request.payload().get(field)?.as_f64()?;
        (value > *limit).then(|| format!("{field} {value} exceeds {limit}"))
    }
}

/// K7: Approval
///
/// Suspends requests the policy flags, opening a request in the inbox for a
/// human to decide.
pub struct ApprovalGate {
    policy: Arc<dyn ApprovalPolicy>,
    inbox: Arc<ApprovalInbox>,
}

impl ApprovalGate {
    pub fn new(policy: Arc<dyn ApprovalPolicy>, inbox: Arc<ApprovalInbox>) -> Self {
        Self { policy, inbox }
    }
}

#[async_trait]
impl Gate for ApprovalGate {
    fn id(&self) -> GateId {
        GateId::K7
    }

    fn name(&self) -> &str {
        "approval"
    }

    fn sil(&self) -> Sil {
        Sil::Sil3
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        let Some(reason) = self.policy.requires_approval(request) else {
            return Ok(GateOutcome::Pass);
        };

        let token = ResumeToken::new();
        info!(
            correlation_id = %crossing.correlation_id,
            %token,
            %reason,
            "approval required"
        );
        self.inbox.open(ApprovalRequest {
            token: token.clone(),
            correlation_id: crossing.correlation_id,
            operation: request.operation().to_string(),
            actor: request.actor().to_string(),
            requested_at: Utc::now(),
        });
        Ok(GateOutcome::Suspend(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::view;
    use serde_json::json;

    #[test]
    fn policy_thresholds() {
        let policy = OperationApprovalPolicy::new()
            .always("accounts.close")
            .above("amount", 1_000.0);

        let close = CrossingRequest::new("accounts.close", "a", json!({}));
        assert!(policy.requires_approval(&close).is_some());

        let small = CrossingRequest::new("transfer", "a", json!({"amount": 10}));
        assert!(policy.requires_approval(&small).is_none());

        let large = CrossingRequest::new("transfer", "a", json!({"amount": 5_000}));
        assert!(policy.requires_approval(&large).is_some());

        let odd = CrossingRequest::new("transfer", "a", json!({"amount": "lots"}));
        assert!(policy.requires_approval(&odd).is_none());
    }

    #[tokio::test]
    async fn suspends_and_opens_inbox_request() {
        let inbox = Arc::new(ApprovalInbox::new());
        let gate = ApprovalGate::new(
            Arc::new(OperationApprovalPolicy::new().always("accounts.close")),
            inbox.clone(),
        );
        let view = view();
        let req = CrossingRequest::new("accounts.close", "agent-9", json!({}));

        let token = match gate.evaluate(&view, &req).await.unwrap() {
            GateOutcome::Suspend(token) => token,
            other => panic!("expected suspension, got {other:?}"),
        };
        let pending = inbox.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].token, token);
        assert_eq!(pending[0].correlation_id, view.correlation_id);
        assert_eq!(pending[0].actor, "agent-9");
    }
}
