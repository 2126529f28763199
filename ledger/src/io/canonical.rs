//! Canonical state tracking per lineage.
//!
//! Promotion happens only inside the write that applies `VERIFYING -> COMPLETED`.
//! Restoration writes a fresh snapshot seeded from the canonical payload when a
//! task enters `ROLLBACK`.

use serde_json::Value;
use tracing::{debug, warn};

use super::store::{LedgerStore, Txn};
use crate::core::types::{CanonicalState, ContextSnapshot, SnapshotPayload, Task, TaskState};
use crate::error::LedgerResult;

/// Annotation key naming the canonical snapshot a restored snapshot came from.
pub const RESTORED_FROM: &str = "restored_from";

/// Promote `snapshot` (or an empty payload) to the canonical state of `task`'s lineage.
pub fn promote(
    txn: &Txn<'_>,
    task: &Task,
    snapshot: Option<&ContextSnapshot>,
) -> LedgerResult<CanonicalState> {
    let empty = SnapshotPayload::default();
    let (snapshot_id, payload) = match snapshot {
        Some(snapshot) => (Some(snapshot.id.as_str()), &snapshot.payload),
        None => (None, &empty),
    };
    let canonical = txn.upsert_canonical(task, TaskState::Completed, snapshot_id, payload)?;
    debug!(
        task_id = %task.id,
        lineage = %task.lineage,
        snapshot_id = ?canonical.snapshot_id,
        "canonical state promoted"
    );
    Ok(canonical)
}

/// Write a snapshot for `task` seeded from its lineage's canonical state.
///
/// Returns `None` when the lineage has no canonical state yet.
pub fn restore(txn: &Txn<'_>, task: &Task) -> LedgerResult<Option<ContextSnapshot>> {
    let Some(canonical) = txn.canonical_for_lineage(&task.lineage)? else {
        warn!(task_id = %task.id, lineage = %task.lineage, "no canonical state to restore");
        return Ok(None);
    };
    let mut payload = canonical.payload.clone();
    let source = canonical
        .snapshot_id
        .clone()
        .unwrap_or_else(|| format!("canonical:{}", canonical.lineage));
    payload
        .annotations
        .insert(RESTORED_FROM.to_string(), Value::String(source));
    txn.insert_snapshot(&task.id, &payload).map(Some)
}

pub fn get(store: &LedgerStore, task_id: &str) -> LedgerResult<Option<CanonicalState>> {
    store.get_canonical(task_id)
}
