use std::collections::HashMap;

use async_trait::async_trait;
use boundary_types::{CorrelationId, GateSet, IdempotencyKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LedgerError;
use crate::redact::RedactedSummary;

/// Outcome written to the ledger.
///
/// Only committed crossings reach the ledger; a failed crossing leaves no
/// record behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingOutcome {
    Committed,
}

/// Write-once record of one committed crossing. Never mutated after append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub correlation_id: CorrelationId,
    pub outcome: CrossingOutcome,
    pub gates_passed: GateSet,
    pub summary: RedactedSummary,
    pub opened_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.summary.idempotency_key
    }
}

/// Append-only sink for audit records.
///
/// Implementations must accept concurrent appends without interleaving
/// partial records, and must refuse a second record for the same crossing.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), LedgerError>;

    /// Cheap reachability check used by the durability gate before execution.
    async fn precheck(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Lookup of committed crossings by idempotency key.
#[async_trait]
pub trait IdempotencyIndex: Send + Sync {
    async fn lookup(&self, key: &IdempotencyKey) -> Option<CorrelationId>;
}

#[derive(Default)]
struct LedgerInner {
    records: Vec<AuditRecord>,
    by_correlation: HashMap<CorrelationId, usize>,
    by_key: HashMap<IdempotencyKey, usize>,
}

/// In-memory audit ledger.
///
/// Appends take a write lock for the whole insert, so concurrent appends are
/// serialized and a reader never observes a half-written record.
#[derive(Default)]
pub struct InMemoryAuditLedger {
    inner: RwLock<LedgerInner>,
}

impl InMemoryAuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &CorrelationId) -> Option<AuditRecord> {
        let inner = self.inner.read().await;
        inner
            .by_correlation
            .get(id)
            .map(|&i| inner.records[i].clone())
    }

    /// First committed record carrying this idempotency key.
    pub async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Option<AuditRecord> {
        let inner = self.inner.read().await;
        inner.by_key.get(key).map(|&i| inner.records[i].clone())
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.inner.read().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait]
impl AuditLedger for InMemoryAuditLedger {
    async fn append(&self, record: AuditRecord) -> Result<(), LedgerError> {
        let mut inner = self.inner.write().await;
        if inner.by_correlation.contains_key(&record.correlation_id) {
            return Err(LedgerError::DuplicateRecord(record.correlation_id));
        }

        let index = inner.records.len();
        inner.by_correlation.insert(record.correlation_id, index);
        inner.by_key.entry(record.idempotency_key()).or_insert(index);
        debug!(
            correlation_id = %record.correlation_id,
            index,
            "audit record appended"
        );
        inner.records.push(record);
        Ok(())
    }
}

#[async_trait]
impl IdempotencyIndex for InMemoryAuditLedger {
    async fn lookup(&self, key: &IdempotencyKey) -> Option<CorrelationId> {
        let inner = self.inner.read().await;
        inner
            .by_key
            .get(key)
            .map(|&i| inner.records[i].correlation_id)
    }
}
