//! End-to-end ledger scenarios across the state machine, store and resume builder.
//!
//! These tests drive tasks through full walks, forced rollbacks, restarts and
//! concurrent transitions, then check the durable records left behind.

use std::sync::{Arc, Barrier};
use std::thread;

use ledger::core::policy::{Decision, RollbackCause};
use ledger::core::recommend::NO_ACTION;
use ledger::core::types::{NewTask, SnapshotPayload, TaskState};
use ledger::error::LedgerError;
use ledger::io::config::{LedgerConfig, write_config};
use ledger::io::init::{InitOptions, LedgerPaths, init_ledger};
use ledger::ops::{Ledger, Operation};
use ledger::resume::build_resume;
use ledger::test_support::{HAPPY_PATH, create, memory_ledger, new_task, scratch_ledger, walk};
use serde_json::json;

fn files(paths: &[&str]) -> SnapshotPayload {
    SnapshotPayload {
        files: paths.iter().map(|p| p.to_string()).collect(),
        ..SnapshotPayload::default()
    }
}

/// A full successful walk leaves a valid history, an inactive task, a canonical
/// state and a resume package that recommends nothing further.
#[test]
fn happy_path_completes_and_resumes_with_no_action() {
    let ledger = memory_ledger();
    let machine = ledger.machine();
    let created = machine
        .create_task(&NewTask {
            goal: "add pagination".to_string(),
            constraints: "keep the v1 response shape".to_string(),
            protected_paths: vec!["api/v1.json".to_string()],
            ..NewTask::default()
        })
        .expect("create");
    let id = created.task.id;

    walk(machine, &id, &HAPPY_PATH[..3]);
    machine
        .store()
        .write_snapshot(&id, &files(&["src/page.rs"]))
        .expect("snapshot");
    let task = walk(machine, &id, &HAPPY_PATH[3..]);

    assert_eq!(task.state, TaskState::Completed);
    assert!(!task.active);
    assert!(machine.store().verify_history(&id).expect("verify").is_empty());
    let history = machine.store().transitions(&id).expect("history");
    let walked: Vec<TaskState> = history.iter().map(|t| t.to).collect();
    assert_eq!(walked[0], TaskState::Planning);
    assert_eq!(&walked[1..], &HAPPY_PATH);

    let package = build_resume(machine, Some(&id), 20).expect("resume");
    assert_eq!(package.goal, "add pagination");
    assert_eq!(package.constraints, "keep the v1 response shape");
    assert_eq!(package.protected_paths, vec!["api/v1.json"]);
    assert_eq!(package.next_recommended_action, NO_ACTION);
    assert_eq!(
        package.canonical.expect("canonical").payload,
        files(&["src/page.rs"])
    );
}

/// Three identical `timeout:build` failures force ROLLBACK even though the
/// retry budget alone would still allow another attempt.
#[test]
fn identical_failures_force_rollback_before_budget_is_spent() {
    let ledger = memory_ledger();
    let machine = ledger.machine();
    let task = create(machine, "stabilize the build");
    walk(machine, &task.id, &[TaskState::Coding, TaskState::Executing]);

    let mut outcomes = Vec::new();
    for attempt in 0..3 {
        let outcome = machine
            .record_step_failure(&task.id, "cargo build --release", "timeout:build")
            .expect("record failure");
        outcomes.push(outcome);
        if attempt < 2 {
            walk(machine, &task.id, &[TaskState::Coding, TaskState::Executing]);
        }
    }

    let last = outcomes.last().expect("outcome");
    assert_eq!(last.task.state, TaskState::Rollback);
    assert!(last.task.retry_count <= machine.policy().max_retries);
    assert_eq!(
        last.policy_forced.map(|f| f.cause),
        Some(RollbackCause::RepeatedFailure)
    );
    assert!(outcomes[..2].iter().all(|o| o.task.state == TaskState::FailedRetry));

    let history = machine.store().transitions(&task.id).expect("history");
    let forced: Vec<_> = history.iter().filter(|t| t.forced).collect();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].from, Some(TaskState::FailedRetry));
    assert_eq!(forced[0].to, TaskState::Rollback);
    assert!(machine.store().verify_history(&task.id).expect("verify").is_empty());
}

/// A retry request after the threshold is met is replaced by ROLLBACK.
#[test]
fn retry_request_is_rerouted_to_rollback() {
    let ledger = memory_ledger();
    let machine = ledger.machine();
    let task = create(machine, "retry gate");
    walk(machine, &task.id, &[TaskState::Coding, TaskState::Executing]);
    machine
        .record_step_failure(&task.id, "s", "timeout:build")
        .expect("failure");
    walk(machine, &task.id, &[TaskState::Coding, TaskState::Executing]);
    machine
        .record_step_failure(&task.id, "s", "timeout:build")
        .expect("failure");
    // Third identical signature recorded without a transition.
    machine
        .failures()
        .record(&task.id, "s", "timeout:build")
        .expect("record");

    let outcome = machine
        .transition(&task.id, TaskState::Coding, Some("try again"))
        .expect("transition");
    assert_eq!(outcome.task.state, TaskState::Rollback);
    let forced = outcome.policy_forced.expect("forced");
    assert_eq!(forced.requested, Some(TaskState::Coding));
    assert_eq!(forced.applied, TaskState::Rollback);
}

/// Canonical state follows verified completions only; a later failing task in
/// the same lineage neither changes it nor loses it on rollback.
#[test]
fn canonical_state_never_regresses() {
    let ledger = memory_ledger();
    let machine = ledger.machine();
    let first = create(machine, "first feature");
    walk(machine, &first.id, &HAPPY_PATH[..3]);
    let verified = machine
        .store()
        .write_snapshot(&first.id, &files(&["src/a.rs"]))
        .expect("snapshot");
    walk(machine, &first.id, &HAPPY_PATH[3..]);

    let second = create(machine, "second feature");
    walk(machine, &second.id, &[TaskState::Coding, TaskState::Executing]);
    machine
        .store()
        .write_snapshot(&second.id, &files(&["src/broken.rs"]))
        .expect("snapshot");
    let outcome = machine
        .record_step_failure(&second.id, "s", "assertion failed: left == right")
        .expect("failure");
    assert_eq!(outcome.task.state, TaskState::FailedRetry);

    let canonical = machine
        .store()
        .get_canonical(&second.id)
        .expect("canonical")
        .expect("some");
    assert_eq!(canonical.task_id, first.id);
    assert_eq!(canonical.snapshot_id, Some(verified.id.clone()));

    let outcome = machine
        .transition(&second.id, TaskState::Rollback, Some("give up"))
        .expect("rollback");
    assert_eq!(outcome.canonical_restored, Some(true));
    let restored = outcome.restored_snapshot.expect("restored");
    assert_eq!(restored.payload.files, vec!["src/a.rs"]);
    assert_eq!(
        machine
            .store()
            .get_canonical(&first.id)
            .expect("canonical")
            .expect("some")
            .snapshot_id,
        Some(verified.id)
    );
}

/// CODING -> COMPLETED is not an edge: the request fails and nothing changes.
#[test]
fn skipping_verification_is_rejected() {
    let ledger = memory_ledger();
    let machine = ledger.machine();
    let task = create(machine, "no shortcuts");
    walk(machine, &task.id, &[TaskState::Coding]);
    let before = machine.store().transitions(&task.id).expect("history");

    let err = machine
        .transition(&task.id, TaskState::Completed, None)
        .expect_err("illegal");
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    assert_eq!(
        machine.store().get_task(&task.id).expect("task").state,
        TaskState::Coding
    );
    assert_eq!(machine.store().transitions(&task.id).expect("history"), before);
}

/// Two threads race the same compare-and-swap; exactly one wins.
#[test]
fn concurrent_transitions_have_exactly_one_winner() {
    let (_temp, ledger) = scratch_ledger();
    let machine = ledger.machine().clone();
    let task = create(&machine, "race");

    for _ in 0..5 {
        let current = machine.store().get_task(&task.id).expect("task").state;
        let next = match current {
            TaskState::Planning => TaskState::Coding,
            TaskState::Coding => TaskState::Executing,
            _ => break,
        };
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|n| {
                let machine = machine.clone();
                let barrier = barrier.clone();
                let id = task.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    machine.transition_from(&id, current, next, Some(&format!("thread {n}")))
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let losers: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(losers.len(), 1);
        assert!(matches!(losers[0], LedgerError::InvalidTransition { .. }));

        let stored = machine.store().get_task(&task.id).expect("task");
        assert_eq!(stored.state, next);
        assert_eq!(stored.state, winners[0].task.state);
    }
    assert!(machine.store().verify_history(&task.id).expect("verify").is_empty());
}

/// Two callers who both saw EXECUTING request different edges. However the
/// writes interleave, exactly one lands and the other is rejected as stale.
#[test]
fn racing_operations_from_same_observed_state_have_one_winner() {
    for _ in 0..10 {
        let (_temp, ledger) = scratch_ledger();
        let ledger = Arc::new(ledger);
        let task = create(ledger.machine(), "verify or fail");
        walk(ledger.machine(), &task.id, &[TaskState::Coding, TaskState::Executing]);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [TaskState::Verifying, TaskState::FailedRetry]
            .into_iter()
            .map(|to| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                let id = task.id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let envelope = ledger.execute(Operation::Transition {
                        task_id: Some(id),
                        to,
                        from: TaskState::Executing,
                        reason: None,
                    });
                    (to, envelope)
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();

        let winners: Vec<_> = results.iter().filter(|(_, env)| env.is_success()).collect();
        assert_eq!(winners.len(), 1, "{results:?}");
        let loser = results
            .iter()
            .find(|(_, env)| !env.is_success())
            .expect("loser");
        assert_eq!(loser.1.error_kind(), Some("invalid_transition"));

        let stored = ledger.store().get_task(&task.id).expect("task");
        assert_eq!(stored.state, winners[0].0);
        let history = ledger.store().transitions(&task.id).expect("history");
        assert_eq!(history.last().and_then(|t| t.from), Some(TaskState::Executing));
    }
}

/// A store locked by another writer yields a retryable storage failure and
/// leaves the task where it was.
#[test]
fn locked_store_reports_retryable_storage_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = LedgerPaths::new(temp.path());
    init_ledger(temp.path(), &InitOptions { force: false }).expect("init");
    write_config(
        &paths.config_path,
        &LedgerConfig {
            busy_timeout_ms: 50,
            ..LedgerConfig::default()
        },
    )
    .expect("config");
    let ledger = Ledger::open(temp.path()).expect("open");
    let task = create(ledger.machine(), "contended");

    let other = rusqlite::Connection::open(&paths.store_path).expect("second connection");
    other.execute_batch("BEGIN IMMEDIATE").expect("hold write lock");

    let env = ledger.execute(Operation::Transition {
        task_id: Some(task.id.clone()),
        to: TaskState::Coding,
        from: TaskState::Planning,
        reason: None,
    });
    assert!(!env.is_success());
    assert_eq!(env.error_kind(), Some("storage"));
    assert_eq!(env.observations["retryable"], json!(true));

    other.execute_batch("ROLLBACK").expect("release write lock");
    let stored = ledger.store().get_task(&task.id).expect("task");
    assert_eq!(stored.state, TaskState::Planning);
    assert_eq!(ledger.store().transitions(&task.id).expect("history").len(), 1);
}

/// A file-backed ledger keeps its records across reopen.
#[test]
fn state_survives_reopen() {
    let (temp, ledger) = scratch_ledger();
    let task = create(ledger.machine(), "durable");
    walk(ledger.machine(), &task.id, &[TaskState::Coding, TaskState::Executing]);
    ledger
        .machine()
        .record_step_failure(&task.id, "pytest", "FAILED tests/test_io.py::test_read - 3 errors")
        .expect("failure");
    drop(ledger);

    let reopened = Ledger::open(temp.path()).expect("reopen");
    let active = reopened
        .store()
        .get_active_task()
        .expect("active")
        .expect("some");
    assert_eq!(active.id, task.id);
    assert_eq!(active.state, TaskState::FailedRetry);
    assert_eq!(active.retry_count, 1);
    let failures = reopened.machine().failures().recent(&task.id, 10).expect("recent");
    assert_eq!(failures.len(), 1);
    assert_eq!(reopened.machine().decision(&task.id).expect("decision"), Decision::Retry);
}

/// Two resume builds with no write in between are bit-identical.
#[test]
fn resume_package_is_idempotent() {
    let ledger = memory_ledger();
    ledger.execute(Operation::CreateTask(new_task("idempotent")));
    ledger.execute(
        serde_json::from_value(json!({"op": "transition", "from": "PLANNING", "to": "CODING"}))
            .expect("op"),
    );

    let op = Operation::GetModelResumePackage { task_id: None };
    let first = ledger.execute(op.clone());
    let second = ledger.execute(op);
    assert!(first.is_success());
    assert_eq!(
        serde_json::to_string(&first.observations).expect("json"),
        serde_json::to_string(&second.observations).expect("json")
    );
}

/// Superseding keeps exactly one active task at any time.
#[test]
fn supersede_keeps_single_active_task() {
    let ledger = memory_ledger();
    let machine = ledger.machine();
    let first = create(machine, "first");
    let second = machine
        .create_task(&NewTask {
            supersede: true,
            ..new_task("second")
        })
        .expect("supersede");
    assert_eq!(second.superseded, Some(first.id.clone()));

    let tasks = machine.store().list_tasks().expect("list");
    assert_eq!(tasks.iter().filter(|t| t.active).count(), 1);
    let err = machine
        .transition(&first.id, TaskState::Coding, None)
        .expect_err("superseded");
    assert!(matches!(err, LedgerError::Conflict(_)));
}
