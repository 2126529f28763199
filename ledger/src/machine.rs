//! Task state machine: guarded transitions with policy and canonical side effects.
//!
//! Every operation here runs in a single store write. The transition, its audit
//! record, the failure record, a forced rollback and canonical promotion or
//! restoration either all commit or none do.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::graph::is_legal;
use crate::core::policy::{Decision, PolicyForced, RetryPolicy, RollbackCause, decide_next};
use crate::core::types::{
    CanonicalState, ContextSnapshot, FailureRecord, NewTask, StateTransition, Task, TaskState,
};
use crate::error::{LedgerError, LedgerResult};
use crate::io::canonical;
use crate::io::failure_memory::FailureMemory;
use crate::io::store::{LedgerStore, Txn};

/// Result of `create_task`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOutcome {
    pub task: Task,
    pub superseded: Option<String>,
    /// Initial snapshot copied from the lineage's canonical state, when requested.
    pub seeded_snapshot: Option<ContextSnapshot>,
}

/// Everything one state-changing call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    /// Task after the write.
    pub task: Task,
    /// Audit records appended, in order.
    pub applied: Vec<StateTransition>,
    pub policy_forced: Option<PolicyForced>,
    /// Policy verdict for the task's resulting state.
    pub decision: Decision,
    pub canonical_promoted: Option<CanonicalState>,
    /// Set when the call entered `ROLLBACK`: whether a canonical state was restored.
    pub canonical_restored: Option<bool>,
    pub restored_snapshot: Option<ContextSnapshot>,
    pub failure: Option<FailureRecord>,
}

impl TransitionOutcome {
    fn new(task: Task) -> Self {
        Self {
            task,
            applied: Vec::new(),
            policy_forced: None,
            decision: Decision::Proceed,
            canonical_promoted: None,
            canonical_restored: None,
            restored_snapshot: None,
            failure: None,
        }
    }
}

#[derive(Clone)]
pub struct StateMachine {
    store: Arc<LedgerStore>,
    failures: FailureMemory,
    policy: RetryPolicy,
    default_lineage: String,
}

impl StateMachine {
    pub fn new(
        store: Arc<LedgerStore>,
        failures: FailureMemory,
        policy: RetryPolicy,
        default_lineage: impl Into<String>,
    ) -> Self {
        Self {
            store,
            failures,
            policy,
            default_lineage: default_lineage.into(),
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn failures(&self) -> &FailureMemory {
        &self.failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn create_task(&self, new: &NewTask) -> LedgerResult<CreateOutcome> {
        self.store.write(|txn| {
            let created = txn.insert_task(new, &self.default_lineage)?;
            let seeded_snapshot = if new.seed_from_canonical {
                canonical::restore(txn, &created.task)?
            } else {
                None
            };
            Ok(CreateOutcome {
                task: txn.get_task(&created.task.id)?,
                superseded: created.superseded,
                seeded_snapshot,
            })
        })
    }

    /// Move `task_id` from the state it is observed in now to `to`.
    ///
    /// The state is read before the write lock is taken and then checked as in
    /// [`transition_from`](Self::transition_from), so a concurrent writer that
    /// moves the task in between makes this call fail instead of landing on a
    /// different edge.
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskState,
        reason: Option<&str>,
    ) -> LedgerResult<TransitionOutcome> {
        let observed = self.store.read(|txn| Ok(txn.get_task(task_id)?.state))?;
        self.transition_from(task_id, observed, to, reason)
    }

    /// Compare-and-swap form of [`transition`](Self::transition).
    ///
    /// Fails with `InvalidTransition` when the stored state is not `expected_from`.
    pub fn transition_from(
        &self,
        task_id: &str,
        expected_from: TaskState,
        to: TaskState,
        reason: Option<&str>,
    ) -> LedgerResult<TransitionOutcome> {
        self.store.write(|txn| {
            let task = txn.get_task(task_id)?;
            self.apply(txn, task, expected_from, to, reason)
        })
    }

    /// Record a failed step and move the task to `FAILED_RETRY`, or straight
    /// through to `ROLLBACK` when policy says retrying is pointless.
    pub fn record_step_failure(
        &self,
        task_id: &str,
        strategy: &str,
        raw_error: &str,
    ) -> LedgerResult<TransitionOutcome> {
        self.store.write(|txn| {
            let task = txn.get_task(task_id)?;
            if !is_legal(task.state, TaskState::FailedRetry) {
                return Err(LedgerError::invalid_transition(
                    task_id,
                    format!(
                        "cannot record a step failure in state {}: {} -> {} is not an edge of the state graph",
                        task.state,
                        task.state,
                        TaskState::FailedRetry
                    ),
                ));
            }
            let failure = self.failures.record_in(txn, &task, strategy, raw_error)?;
            let reason = format!("step failure: {}", failure.signature);
            let (task, record) = txn.append_transition(
                task_id,
                task.state,
                TaskState::FailedRetry,
                Some(&reason),
                false,
            )?;

            let recent =
                txn.count_recent_failures(&task, &failure.signature, self.policy.failure_window)?;
            let decision = decide_next(task.state, task.retry_count, recent, &self.policy);
            let mut outcome = TransitionOutcome::new(task);
            outcome.applied.push(record);
            outcome.failure = Some(failure);
            if let Decision::Rollback(cause) = decision {
                self.force_rollback(txn, &mut outcome, cause, TaskState::FailedRetry)?;
            }
            self.finish(txn, outcome)
        })
    }

    /// Policy verdict for the task's current state.
    pub fn decision(&self, task_id: &str) -> LedgerResult<Decision> {
        self.store.read(|txn| {
            let task = txn.get_task(task_id)?;
            self.decision_in(txn, &task)
        })
    }

    pub(crate) fn decision_in(&self, txn: &Txn<'_>, task: &Task) -> LedgerResult<Decision> {
        if task.state != TaskState::FailedRetry {
            return Ok(Decision::Proceed);
        }
        let recent = match txn.latest_failure(task)? {
            Some(latest) => {
                txn.count_recent_failures(task, &latest.signature, self.policy.failure_window)?
            }
            None => 0,
        };
        Ok(decide_next(task.state, task.retry_count, recent, &self.policy))
    }

    fn apply(
        &self,
        txn: &Txn<'_>,
        task: Task,
        from: TaskState,
        to: TaskState,
        reason: Option<&str>,
    ) -> LedgerResult<TransitionOutcome> {
        // A retry is only granted if policy still allows it.
        if task.state == from && from == TaskState::FailedRetry && to == TaskState::Coding {
            if let Decision::Rollback(cause) = self.decision_in(txn, &task)? {
                let mut outcome = TransitionOutcome::new(task);
                self.force_rollback(txn, &mut outcome, cause, to)?;
                return self.finish(txn, outcome);
            }
        }

        let (task, record) = txn.append_transition(&task.id, from, to, reason, false)?;
        let mut outcome = TransitionOutcome::new(task);
        outcome.applied.push(record);
        self.enter(txn, &mut outcome, from, to)?;

        if to == TaskState::FailedRetry {
            if let Decision::Rollback(cause) = self.decision_in(txn, &outcome.task)? {
                self.force_rollback(txn, &mut outcome, cause, to)?;
            }
        }
        self.finish(txn, outcome)
    }

    fn force_rollback(
        &self,
        txn: &Txn<'_>,
        outcome: &mut TransitionOutcome,
        cause: RollbackCause,
        requested: TaskState,
    ) -> LedgerResult<()> {
        warn!(
            task_id = %outcome.task.id,
            cause = cause.describe(),
            requested = %requested,
            retry_count = outcome.task.retry_count,
            "policy forced rollback"
        );
        let (task, record) = txn.append_transition(
            &outcome.task.id,
            TaskState::FailedRetry,
            TaskState::Rollback,
            Some(cause.describe()),
            true,
        )?;
        outcome.task = task;
        outcome.applied.push(record);
        outcome.policy_forced = Some(PolicyForced {
            cause,
            requested: Some(requested),
            applied: TaskState::Rollback,
        });
        self.enter(txn, outcome, TaskState::FailedRetry, TaskState::Rollback)
    }

    /// Side effects of arriving in `to`.
    fn enter(
        &self,
        txn: &Txn<'_>,
        outcome: &mut TransitionOutcome,
        from: TaskState,
        to: TaskState,
    ) -> LedgerResult<()> {
        match (from, to) {
            (TaskState::Verifying, TaskState::Completed) => {
                let snapshot = txn.last_snapshot(&outcome.task.id)?;
                let promoted = canonical::promote(txn, &outcome.task, snapshot.as_ref())?;
                info!(
                    task_id = %outcome.task.id,
                    lineage = %promoted.lineage,
                    "task completed; canonical state promoted"
                );
                outcome.canonical_promoted = Some(promoted);
            }
            (_, TaskState::Rollback) => {
                let restored = canonical::restore(txn, &outcome.task)?;
                outcome.canonical_restored = Some(restored.is_some());
                outcome.restored_snapshot = restored;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(
        &self,
        txn: &Txn<'_>,
        mut outcome: TransitionOutcome,
    ) -> LedgerResult<TransitionOutcome> {
        outcome.task = txn.get_task(&outcome.task.id)?;
        outcome.decision = self.decision_in(txn, &outcome.task)?;
        Ok(outcome)
    }
}
