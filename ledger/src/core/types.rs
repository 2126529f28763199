//! Shared deterministic types for the ledger core.
//!
//! These types define stable contracts between the store, the state machine and
//! the resume builder. Serialized names are part of the wire contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Planning,
    Coding,
    Executing,
    Verifying,
    Completed,
    FailedRetry,
    Rollback,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Planning,
        TaskState::Coding,
        TaskState::Executing,
        TaskState::Verifying,
        TaskState::Completed,
        TaskState::FailedRetry,
        TaskState::Rollback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Planning => "PLANNING",
            TaskState::Coding => "CODING",
            TaskState::Executing => "EXECUTING",
            TaskState::Verifying => "VERIFYING",
            TaskState::Completed => "COMPLETED",
            TaskState::FailedRetry => "FAILED_RETRY",
            TaskState::Rollback => "ROLLBACK",
        }
    }

    /// Terminal for the current cycle: the task is no longer active.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Rollback)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_uppercase().replace('-', "_");
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| {
                let valid: Vec<&str> = TaskState::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown state '{raw}' (valid: {})", valid.join(", "))
            })
    }
}

/// One unit of agent-driven work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub lineage: String,
    pub goal: String,
    pub state: TaskState,
    /// Entries into `FAILED_RETRY` since the last completion or restart.
    pub retry_count: u32,
    /// Restarts from `ROLLBACK` so far.
    pub cycle: u32,
    pub active: bool,
    pub superseded_by: Option<String>,
    pub constraints: String,
    pub protected_paths: Vec<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Input for task creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTask {
    pub goal: String,
    pub constraints: String,
    pub protected_paths: Vec<String>,
    /// Explicit id; generated from the store counter when absent.
    pub task_id: Option<String>,
    /// Lineage name; the configured default lineage when absent.
    pub lineage: Option<String>,
    /// Deactivate the current active task instead of failing with a conflict.
    pub supersede: bool,
    /// Write an initial snapshot copied from the lineage's canonical state.
    pub seed_from_canonical: bool,
}

/// Immutable audit record of a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub seq: i64,
    pub task_id: String,
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub at_ms: i64,
    pub reason: Option<String>,
    /// True when policy chose this edge rather than the caller.
    pub forced: bool,
}

/// Working context captured at a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotPayload {
    pub files: Vec<String>,
    pub safe_to_edit: Vec<String>,
    pub tool_outputs: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub seq: i64,
    pub task_id: String,
    pub created_at_ms: i64,
    pub payload: SnapshotPayload,
}

/// Last state of a lineage proven good by verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalState {
    pub lineage: String,
    pub task_id: String,
    pub state: TaskState,
    pub snapshot_id: Option<String>,
    pub payload: SnapshotPayload,
    pub promoted_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub seq: i64,
    pub task_id: String,
    pub cycle: u32,
    pub strategy: String,
    pub signature: String,
    pub raw_error: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Success,
    Failure,
}

impl ToolOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolOutcome::Success => "success",
            ToolOutcome::Failure => "failure",
        }
    }
}

impl FromStr for ToolOutcome {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(ToolOutcome::Success),
            "failure" => Ok(ToolOutcome::Failure),
            other => Err(format!("unknown tool outcome '{other}' (valid: success, failure)")),
        }
    }
}

/// Aggregated usage counter for one tool and outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsagePattern {
    pub tool: String,
    pub outcome: ToolOutcome,
    pub count: u64,
    pub last_used_ms: i64,
}
