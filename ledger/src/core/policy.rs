//! Retry-versus-rollback policy.
//!
//! `decide_next` is pure: it sees only the task state, the retry counter and the
//! number of recent identical failures. The state machine applies its verdict.

use serde::{Deserialize, Serialize};

use crate::core::types::TaskState;

/// Limits that bound retries for one task cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// A retry counter above this forces rollback.
    pub max_retries: u32,
    /// This many identical signatures within the window force rollback.
    pub identical_failure_threshold: u32,
    /// Number of most recent failures inspected for repetition.
    pub failure_window: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            identical_failure_threshold: 3,
            failure_window: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackCause {
    RepeatedFailure,
    RetriesExhausted,
}

impl RollbackCause {
    pub fn describe(self) -> &'static str {
        match self {
            RollbackCause::RepeatedFailure => "repeated identical failure signature",
            RollbackCause::RetriesExhausted => "retry budget exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "cause", rename_all = "snake_case")]
pub enum Decision {
    /// No policy constraint applies in this state.
    Proceed,
    /// Another `CODING` attempt is allowed.
    Retry,
    /// The next transition must be `ROLLBACK`.
    Rollback(RollbackCause),
}

/// Informational signal: policy replaced the caller's requested edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyForced {
    pub cause: RollbackCause,
    pub requested: Option<TaskState>,
    pub applied: TaskState,
}

pub fn decide_next(
    state: TaskState,
    retry_count: u32,
    recent_failure_count: u32,
    policy: &RetryPolicy,
) -> Decision {
    if state != TaskState::FailedRetry {
        return Decision::Proceed;
    }
    // Repetition wins over exhaustion so the audit names the sharper cause.
    if recent_failure_count >= policy.identical_failure_threshold {
        return Decision::Rollback(RollbackCause::RepeatedFailure);
    }
    if retry_count > policy.max_retries {
        return Decision::Rollback(RollbackCause::RetriesExhausted);
    }
    Decision::Retry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_failed_states_proceed() {
        let policy = RetryPolicy::default();
        for state in [
            TaskState::Planning,
            TaskState::Coding,
            TaskState::Executing,
            TaskState::Verifying,
            TaskState::Completed,
            TaskState::Rollback,
        ] {
            assert_eq!(decide_next(state, 99, 99, &policy), Decision::Proceed);
        }
    }

    #[test]
    fn third_identical_failure_forces_rollback_before_budget_runs_out() {
        let policy = RetryPolicy::default();
        assert_eq!(
            decide_next(TaskState::FailedRetry, 3, 3, &policy),
            Decision::Rollback(RollbackCause::RepeatedFailure)
        );
        assert_eq!(
            decide_next(TaskState::FailedRetry, 2, 2, &policy),
            Decision::Retry
        );
    }

    #[test]
    fn retry_counter_above_max_forces_rollback() {
        let policy = RetryPolicy::default();
        assert_eq!(decide_next(TaskState::FailedRetry, 3, 1, &policy), Decision::Retry);
        assert_eq!(
            decide_next(TaskState::FailedRetry, 4, 1, &policy),
            Decision::Rollback(RollbackCause::RetriesExhausted)
        );
    }

    #[test]
    fn threshold_of_one_rolls_back_on_first_failure() {
        let policy = RetryPolicy {
            identical_failure_threshold: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(
            decide_next(TaskState::FailedRetry, 1, 1, &policy),
            Decision::Rollback(RollbackCause::RepeatedFailure)
        );
    }

    #[test]
    fn decision_serializes_with_cause() {
        let json = serde_json::to_value(Decision::Rollback(RollbackCause::RetriesExhausted))
            .expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({"decision": "rollback", "cause": "retries_exhausted"})
        );
    }
}
