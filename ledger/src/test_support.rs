//! Test-only helpers for building ledgers and driving tasks.

use tempfile::TempDir;

use crate::core::types::{NewTask, Task, TaskState};
use crate::io::config::LedgerConfig;
use crate::io::init::{InitOptions, init_ledger};
use crate::machine::StateMachine;
use crate::ops::Ledger;

/// Happy path from creation to completion, excluding the initial `PLANNING`.
pub const HAPPY_PATH: [TaskState; 4] = [
    TaskState::Coding,
    TaskState::Executing,
    TaskState::Verifying,
    TaskState::Completed,
];

/// Task input with a goal and defaults elsewhere.
pub fn new_task(goal: &str) -> NewTask {
    NewTask {
        goal: goal.to_string(),
        ..NewTask::default()
    }
}

/// Volatile ledger with default config.
pub fn memory_ledger() -> Ledger {
    Ledger::open_in_memory(LedgerConfig::default()).expect("in-memory ledger")
}

/// Initialized project directory with a file-backed ledger.
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub fn scratch_ledger() -> (TempDir, Ledger) {
    let temp = tempfile::tempdir().expect("tempdir");
    init_ledger(temp.path(), &InitOptions { force: false }).expect("init ledger");
    let ledger = Ledger::open(temp.path()).expect("open ledger");
    (temp, ledger)
}

/// Create a task and return it.
pub fn create(machine: &StateMachine, goal: &str) -> Task {
    machine.create_task(&new_task(goal)).expect("create task").task
}

/// Apply each transition in order, panicking with context on the first failure.
pub fn walk(machine: &StateMachine, task_id: &str, states: &[TaskState]) -> Task {
    let mut task = machine.store().get_task(task_id).expect("task");
    for state in states {
        task = machine
            .transition(task_id, *state, None)
            .unwrap_or_else(|err| panic!("transition {task_id} to {state}: {err}"))
            .task;
    }
    task
}
