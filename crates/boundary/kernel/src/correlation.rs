use std::sync::atomic::{AtomicU64, Ordering};

use boundary_types::CorrelationId;
use dashmap::DashSet;
use tracing::debug;

/// Issues correlation ids for crossings.
///
/// An id is never handed out again while a crossing referencing it is live.
/// The assigner has no authority to reject a crossing.
#[derive(Debug, Default)]
pub struct CorrelationAssigner {
    live: DashSet<CorrelationId>,
    issued: AtomicU64,
}

impl CorrelationAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh id and mark it live.
    pub fn issue(&self) -> CorrelationId {
        loop {
            let id = CorrelationId::new();
            if self.live.insert(id) {
                self.issued.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, "correlation id issued");
                return id;
            }
        }
    }

    /// Clear a live id. Returns false if it was not live.
    pub fn release(&self, id: &CorrelationId) -> bool {
        let released = self.live.remove(id).is_some();
        if released {
            debug!(correlation_id = %id, "correlation id released");
        }
        released
    }

    pub fn is_live(&self, id: &CorrelationId) -> bool {
        self.live.contains(id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Total ids issued over the assigner's lifetime.
    pub fn issued_total(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn issue_and_release() {
        let assigner = CorrelationAssigner::new();
        let id = assigner.issue();
        assert!(assigner.is_live(&id));
        assert_eq!(assigner.live_count(), 1);

        assert!(assigner.release(&id));
        assert!(!assigner.is_live(&id));
        assert!(!assigner.release(&id));
        assert_eq!(assigner.issued_total(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_issue_yields_distinct_ids() {
        let assigner = Arc::new(CorrelationAssigner::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let assigner = assigner.clone();
            tasks.push(tokio::spawn(async move {
                (0..100).map(|_| assigner.issue()).collect::<Vec<_>>()
            }));
        }

        let mut all = std::collections::HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(assigner.live_count(), 800);
    }
}
