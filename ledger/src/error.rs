//! Error taxonomy for ledger operations.
//!
//! Caller errors (`NotFound`, `InvalidTransition`, `Conflict`, `InvalidInput`)
//! leave stored state untouched. `Storage` means the durable layer failed and
//! the host decides whether to retry or abort.

use serde::Serialize;
use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition for task {task_id}: {detail}")]
    InvalidTransition { task_id: String, detail: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    Conflict,
    InvalidInput,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Storage => "storage",
        }
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::InvalidInput(_) => ErrorKind::InvalidInput,
            LedgerError::Sqlite(_) | LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Storage failures may succeed on re-issue; caller errors never will.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }

    pub(crate) fn invalid_transition(task_id: &str, detail: impl Into<String>) -> Self {
        LedgerError::InvalidTransition {
            task_id: task_id.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        LedgerError::Storage(format!("corrupt record: {}", detail.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_errors_are_storage_and_retryable() {
        let err = LedgerError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("storage error"));
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        let err = LedgerError::invalid_transition("task-0001", "CODING -> COMPLETED");
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "invalid transition for task task-0001: CODING -> COMPLETED"
        );
    }
}
