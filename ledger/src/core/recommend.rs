//! Deterministic next-action hints derived from task state.

use crate::core::policy::Decision;
use crate::core::types::TaskState;

/// Hint returned once a task needs nothing further.
pub const NO_ACTION: &str = "none";

/// Inputs that shape the hint beyond the bare state.
#[derive(Debug, Clone, Copy, Default)]
pub struct HintContext<'a> {
    /// Signatures already seen failing for the task, most recent first.
    pub known_bad_signatures: &'a [String],
    /// Whether the lineage has a canonical state to restore.
    pub has_canonical: bool,
    /// Policy verdict for the current state, if already computed.
    pub decision: Option<Decision>,
}

pub fn next_action(state: TaskState, ctx: &HintContext<'_>) -> String {
    match state {
        TaskState::Planning => {
            "Complete the plan, then transition to CODING.".to_string()
        }
        TaskState::Coding => "Apply code changes, then transition to EXECUTING.".to_string(),
        TaskState::Executing => {
            "Run commands and tests; transition to VERIFYING, or record the step failure."
                .to_string()
        }
        TaskState::Verifying => {
            "Verify the result; transition to COMPLETED, or record the step failure.".to_string()
        }
        TaskState::FailedRetry => failed_retry_hint(ctx),
        TaskState::Rollback => {
            if ctx.has_canonical {
                "Restart from the canonical snapshot: transition to PLANNING and re-plan."
                    .to_string()
            } else {
                "No canonical state to restore; transition to PLANNING and re-plan from scratch."
                    .to_string()
            }
        }
        TaskState::Completed => NO_ACTION.to_string(),
    }
}

fn failed_retry_hint(ctx: &HintContext<'_>) -> String {
    if let Some(Decision::Rollback(cause)) = ctx.decision {
        return format!(
            "Retry blocked ({}); transition to ROLLBACK.",
            cause.describe()
        );
    }
    if ctx.known_bad_signatures.is_empty() {
        return "Re-attempt with a different strategy, then transition to CODING.".to_string();
    }
    format!(
        "Re-attempt with a different strategy, then transition to CODING; avoid known-bad signatures: {}.",
        ctx.known_bad_signatures.join("; ")
    )
}
