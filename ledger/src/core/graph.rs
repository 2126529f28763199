//! The task state graph.

use crate::core::types::TaskState;

/// Every legal `(from, to)` edge.
pub const EDGES: [(TaskState, TaskState); 9] = [
    (TaskState::Planning, TaskState::Coding),
    (TaskState::Coding, TaskState::Executing),
    (TaskState::Executing, TaskState::Verifying),
    (TaskState::Executing, TaskState::FailedRetry),
    (TaskState::Verifying, TaskState::Completed),
    (TaskState::Verifying, TaskState::FailedRetry),
    (TaskState::FailedRetry, TaskState::Coding),
    (TaskState::FailedRetry, TaskState::Rollback),
    (TaskState::Rollback, TaskState::Planning),
];

pub const INITIAL_STATE: TaskState = TaskState::Planning;

pub fn is_legal(from: TaskState, to: TaskState) -> bool {
    EDGES.contains(&(from, to))
}

/// Legal successors of `state`, in edge-table order.
pub fn successors(state: TaskState) -> Vec<TaskState> {
    EDGES
        .iter()
        .filter(|(from, _)| *from == state)
        .map(|(_, to)| *to)
        .collect()
}
