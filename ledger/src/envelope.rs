//! The uniform response envelope returned by every operation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::recommend::NO_ACTION;
use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub observations: Map<String, Value>,
    pub errors: Vec<String>,
    pub next_recommended_action: String,
}

impl Envelope {
    pub fn success(observations: Map<String, Value>, next_recommended_action: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            observations,
            errors: Vec::new(),
            next_recommended_action: next_recommended_action.into(),
        }
    }

    pub fn failure(error: &LedgerError) -> Self {
        let mut observations = Map::new();
        observations.insert(
            "error_kind".to_string(),
            Value::String(error.kind().as_str().to_string()),
        );
        if error.is_retryable() {
            observations.insert("retryable".to_string(), Value::Bool(true));
        }
        Self {
            status: Status::Failure,
            observations,
            errors: vec![error.to_string()],
            next_recommended_action: recovery_hint(error).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.observations.get("error_kind").and_then(Value::as_str)
    }
}

fn recovery_hint(error: &LedgerError) -> &'static str {
    match error {
        LedgerError::NotFound(_) => "Check the task id with list_tasks or get_active_task.",
        LedgerError::InvalidTransition { .. } => {
            "Re-read the task state with get_task_state and request a legal successor."
        }
        LedgerError::Conflict(_) => {
            "Finish or supersede the active task before starting another."
        }
        LedgerError::InvalidInput(_) => "Fix the request arguments and retry.",
        LedgerError::Sqlite(_) | LedgerError::Storage(_) => {
            "Storage failed; re-read state before retrying the same request."
        }
    }
}

/// Build an observation map from `(key, value)` pairs.
pub fn observations<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Placeholder action for envelopes with nothing to recommend.
pub fn no_action() -> String {
    NO_ACTION.to_string()
}
