//! Failure memory: normalized failure records and repetition queries.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::store::{LedgerStore, Txn};
use crate::core::signature::{DefaultNormalizer, SignatureNormalizer};
use crate::core::types::{FailureRecord, Task};
use crate::error::LedgerResult;

#[derive(Clone)]
pub struct FailureMemory {
    store: Arc<LedgerStore>,
    normalizer: Arc<dyn SignatureNormalizer>,
    retention: u32,
}

impl FailureMemory {
    pub fn new(store: Arc<LedgerStore>, retention: u32) -> Self {
        Self::with_normalizer(store, Arc::new(DefaultNormalizer), retention)
    }

    pub fn with_normalizer(
        store: Arc<LedgerStore>,
        normalizer: Arc<dyn SignatureNormalizer>,
        retention: u32,
    ) -> Self {
        Self {
            store,
            normalizer,
            retention,
        }
    }

    /// Failures kept per task; also the scan depth for known-bad signatures.
    pub fn retention(&self) -> u32 {
        self.retention
    }

    pub fn signature(&self, raw_error: &str) -> String {
        self.normalizer.normalize(raw_error)
    }

    /// Normalize and append one failure in its own write.
    pub fn record(
        &self,
        task_id: &str,
        strategy: &str,
        raw_error: &str,
    ) -> LedgerResult<FailureRecord> {
        self.store.write(|txn| {
            let task = txn.get_task(task_id)?;
            self.record_in(txn, &task, strategy, raw_error)
        })
    }

    /// Append inside a caller's transaction.
    pub fn record_in(
        &self,
        txn: &Txn<'_>,
        task: &Task,
        strategy: &str,
        raw_error: &str,
    ) -> LedgerResult<FailureRecord> {
        let signature = self.signature(raw_error);
        debug!(task_id = %task.id, %signature, "recording failure");
        txn.insert_failure(task, strategy, &signature, raw_error, self.retention)
    }

    pub fn recent_count(&self, task_id: &str, signature: &str, window: u32) -> LedgerResult<u32> {
        self.store.count_recent_failures(task_id, signature, window)
    }

    pub fn recent(&self, task_id: &str, limit: u32) -> LedgerResult<Vec<FailureRecord>> {
        self.store.recent_failures(task_id, limit)
    }

    pub fn known_bad_signatures(&self, task_id: &str, limit: u32) -> LedgerResult<Vec<String>> {
        self.store.read(|txn| {
            txn.get_task(task_id)?;
            known_bad_signatures_in(txn, task_id, limit, self.retention)
        })
    }
}

/// Distinct signatures of the task's retained failures, most recent first.
pub fn known_bad_signatures_in(
    txn: &Txn<'_>,
    task_id: &str,
    limit: u32,
    retention: u32,
) -> LedgerResult<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut signatures = Vec::new();
    for failure in txn.recent_failures(task_id, retention.max(limit))? {
        if signatures.len() >= limit as usize {
            break;
        }
        if seen.insert(failure.signature.clone()) {
            signatures.push(failure.signature);
        }
    }
    Ok(signatures)
}
