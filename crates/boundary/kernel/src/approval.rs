//! Resolution of suspended gates.
//!
//! A gate that cannot decide on its own (the human-approval gate, K7)
//! returns `Suspend(token)`. The pipeline parks the crossing in its
//! awaiting-approval phase and asks an [`ApprovalResolver`] for the decision,
//! bounded by the approval budget.

use async_trait::async_trait;
use boundary_types::{CorrelationId, GateId, ResumeToken};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::gate::CrossingView;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Approved,
    Denied(String),
}

/// Resolves the token of a suspended gate into a decision.
#[async_trait]
pub trait ApprovalResolver: Send + Sync {
    async fn resolve(
        &self,
        gate: GateId,
        token: &ResumeToken,
        crossing: &CrossingView,
    ) -> Result<ApprovalDecision, GateError>;

    /// Forget `token` once the pipeline stops waiting on it, whether or not
    /// a decision arrived.
    fn release(&self, _token: &ResumeToken) {}
}

/// What an approver sees for a pending request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub token: ResumeToken,
    pub correlation_id: CorrelationId,
    pub operation: String,
    pub actor: String,
    pub requested_at: DateTime<Utc>,
}

struct PendingApproval {
    request: ApprovalRequest,
    sender: Option<oneshot::Sender<ApprovalDecision>>,
    receiver: Option<oneshot::Receiver<ApprovalDecision>>,
}

/// In-process approval workflow.
///
/// Gates `open` a token; an approval UI lists [`pending`](Self::pending)
/// requests and calls [`approve`](Self::approve) or [`deny`](Self::deny).
/// A decision may arrive before the pipeline starts waiting; it is buffered.
#[derive(Default)]
pub struct ApprovalInbox {
    pending: DashMap<ResumeToken, PendingApproval>,
}

impl ApprovalInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request awaiting a decision.
    pub fn open(&self, request: ApprovalRequest) {
        let (tx, rx) = oneshot::channel();
        info!(
            token = %request.token,
            correlation_id = %request.correlation_id,
            operation = %request.operation,
            "approval requested"
        );
        self.pending.insert(
            request.token.clone(),
            PendingApproval {
                request,
                sender: Some(tx),
                receiver: Some(rx),
            },
        );
    }

    /// Requests still waiting for a decision.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut out: Vec<ApprovalRequest> = self
            .pending
            .iter()
            .filter(|e| e.sender.is_some())
            .map(|e| e.request.clone())
            .collect();
        out.sort_by_key(|r| r.requested_at);
        out
    }

    pub fn approve(&self, token: &ResumeToken) -> bool {
        self.decide(token, ApprovalDecision::Approved)
    }

    pub fn deny(&self, token: &ResumeToken, reason: impl Into<String>) -> bool {
        self.decide(token, ApprovalDecision::Denied(reason.into()))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Withdraw a request; a waiting pipeline sees it as denied.
    pub fn withdraw(&self, token: &ResumeToken) -> bool {
        self.pending.remove(token).is_some()
    }

    fn decide(&self, token: &ResumeToken, decision: ApprovalDecision) -> bool {
        let sender = match self.pending.get_mut(token) {
            Some(mut entry) => entry.sender.take(),
            None => None,
        };
        match sender {
            Some(tx) => {
                debug!(token = %token, ?decision, "approval decided");
                tx.send(decision).is_ok()
            }
            None => {
                warn!(token = %token, "no open approval for token");
                false
            }
        }
    }
}

/// Removes a token from the inbox when its waiter goes away.
struct Waiting<'a> {
    pending: &'a DashMap<ResumeToken, PendingApproval>,
    token: &'a ResumeToken,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.pending.remove(self.token).is_some() {
            debug!(token = %self.token, "approval closed");
        }
    }
}

#[async_trait]
impl ApprovalResolver for ApprovalInbox {
    async fn resolve(
        &self,
        gate: GateId,
        token: &ResumeToken,
        crossing: &CrossingView,
    ) -> Result<ApprovalDecision, GateError> {
        let receiver = match self.pending.get_mut(token) {
            Some(mut entry) => entry.receiver.take(),
            None => None,
        };
        let receiver = receiver.ok_or_else(|| {
            GateError::Unavailable(format!("no open approval for token {}", token))
        })?;
        let _waiting = Waiting {
            pending: &self.pending,
            token,
        };

        debug!(
            gate = %gate,
            token = %token,
            correlation_id = %crossing.correlation_id,
            "waiting for approval"
        );
        let decision = receiver
            .await
            .unwrap_or_else(|_| ApprovalDecision::Denied("approval request withdrawn".into()));
        Ok(decision)
    }

    fn release(&self, token: &ResumeToken) {
        self.withdraw(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boundary_types::GateSet;
    use std::sync::Arc;

    fn view() -> CrossingView {
        CrossingView {
            correlation_id: CorrelationId::new(),
            gates_passed: GateSet::empty(),
            opened_at: Utc::now(),
        }
    }

    fn request(token: &ResumeToken) -> ApprovalRequest {
        ApprovalRequest {
            token: token.clone(),
            correlation_id: CorrelationId::new(),
            operation: "wire_transfer".into(),
            actor: "agent-7".into(),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn decision_before_wait_is_buffered() {
        let inbox = ApprovalInbox::new();
        let token = ResumeToken::new();
        inbox.open(request(&token));
        assert!(inbox.approve(&token));
        assert!(inbox.pending().is_empty());

        let decision = inbox.resolve(GateId::K7, &token, &view()).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Approved);
        assert!(inbox.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_wait_closes_the_request() {
        let inbox = ApprovalInbox::new();
        let token = ResumeToken::new();
        inbox.open(request(&token));

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            inbox.resolve(GateId::K7, &token, &view()),
        )
        .await;
        assert!(waited.is_err());
        assert!(inbox.pending().is_empty());
        assert!(inbox.is_empty());
        assert!(!inbox.approve(&token));
    }

    #[tokio::test]
    async fn release_closes_an_unwaited_request() {
        let inbox = ApprovalInbox::new();
        let token = ResumeToken::new();
        inbox.open(request(&token));

        inbox.release(&token);
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn decision_after_wait() {
        let inbox = Arc::new(ApprovalInbox::new());
        let token = ResumeToken::new();
        inbox.open(request(&token));
        assert_eq!(inbox.pending().len(), 1);

        let waiter = {
            let inbox = inbox.clone();
            let token = token.clone();
            tokio::spawn(async move { inbox.resolve(GateId::K7, &token, &view()).await })
        };
        tokio::task::yield_now().await;
        assert!(inbox.deny(&token, "too large"));

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision, ApprovalDecision::Denied("too large".into()));
    }

    #[tokio::test]
    async fn unknown_token_is_unavailable() {
        let inbox = ApprovalInbox::new();
        let err = inbox
            .resolve(GateId::K7, &ResumeToken::new(), &view())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Unavailable(_)));
        assert!(!inbox.approve(&ResumeToken::new()));
    }

    #[tokio::test]
    async fn withdrawn_request_resolves_as_denied() {
        let inbox = Arc::new(ApprovalInbox::new());
        let token = ResumeToken::new();
        inbox.open(request(&token));

        let waiter = {
            let inbox = inbox.clone();
            let token = token.clone();
            tokio::spawn(async move { inbox.resolve(GateId::K7, &token, &view()).await })
        };
        tokio::task::yield_now().await;
        inbox.withdraw(&token);

        let decision = waiter.await.unwrap().unwrap();
        assert!(matches!(decision, ApprovalDecision::Denied(_)));
    }
}
