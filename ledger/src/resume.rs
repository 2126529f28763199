//! Resume packages: everything a fresh agent session needs to continue a task.
//!
//! Building a package never writes. Two builds with no write in between are
//! byte-identical, including the digest.

use anyhow::Result;
use minijinja::Environment;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::policy::{Decision, RetryPolicy};
use crate::core::recommend::{HintContext, next_action};
use crate::core::types::{CanonicalState, FailureRecord, TaskState};
use crate::error::{LedgerError, LedgerResult};
use crate::io::failure_memory::known_bad_signatures_in;
use crate::machine::StateMachine;

const HANDOVER_TEMPLATE: &str = include_str!("prompts/handover.md");

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumePackage {
    pub task_id: String,
    pub lineage: String,
    pub goal: String,
    pub state: TaskState,
    pub constraints: String,
    pub protected_paths: Vec<String>,
    pub safe_to_edit: Vec<String>,
    pub files: Vec<String>,
    pub last_snapshot_id: Option<String>,
    pub retry_count: u32,
    pub cycle: u32,
    pub policy: RetryPolicy,
    pub decision: Decision,
    /// Newest first.
    pub recent_failures: Vec<FailureRecord>,
    pub known_bad_signatures: Vec<String>,
    pub canonical: Option<CanonicalState>,
    pub next_recommended_action: String,
    /// SHA-256 over every other field.
    pub digest: String,
}

/// Build the package for `task_id`, or for the active task when `None`.
pub fn build_resume(
    machine: &StateMachine,
    task_id: Option<&str>,
    failure_limit: u32,
) -> LedgerResult<ResumePackage> {
    machine.store().read(|txn| {
        let task = match task_id {
            Some(id) => txn.get_task(id)?,
            None => txn
                .active_task()?
                .ok_or_else(|| LedgerError::NotFound("no active task".to_string()))?,
        };
        let snapshot = txn.last_snapshot(&task.id)?;
        let recent_failures = txn.recent_failures(&task.id, failure_limit)?;
        let known_bad_signatures = known_bad_signatures_in(
            txn,
            &task.id,
            failure_limit,
            machine.failures().retention(),
        )?;
        let canonical = txn.canonical_for_lineage(&task.lineage)?;
        let decision = machine.decision_in(txn, &task)?;
        let next_recommended_action = next_action(
            task.state,
            &HintContext {
                known_bad_signatures: &known_bad_signatures,
                has_canonical: canonical.is_some(),
                decision: Some(decision),
            },
        );

        let (safe_to_edit, files, last_snapshot_id) = match snapshot {
            Some(snapshot) => (
                snapshot.payload.safe_to_edit,
                snapshot.payload.files,
                Some(snapshot.id),
            ),
            None => (Vec::new(), Vec::new(), None),
        };

        let mut package = ResumePackage {
            task_id: task.id,
            lineage: task.lineage,
            goal: task.goal,
            state: task.state,
            constraints: task.constraints,
            protected_paths: task.protected_paths,
            safe_to_edit,
            files,
            last_snapshot_id,
            retry_count: task.retry_count,
            cycle: task.cycle,
            policy: *machine.policy(),
            decision,
            recent_failures,
            known_bad_signatures,
            canonical,
            next_recommended_action,
            digest: String::new(),
        };
        package.digest = digest(&package)?;
        debug!(task_id = %package.task_id, digest = %package.digest, "resume package built");
        Ok(package)
    })
}

fn digest(package: &ResumePackage) -> LedgerResult<String> {
    let bytes = serde_json::to_vec(package)
        .map_err(|err| LedgerError::Storage(format!("serialize resume package: {err}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Render the package as a Markdown handover note.
pub fn render_handover(package: &ResumePackage) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("handover", HANDOVER_TEMPLATE)?;
    let rendered = env.get_template("handover")?.render(package)?;
    Ok(rendered)
}
