//! The closed operation set and the `Ledger` facade that executes it.
//!
//! Every operation returns an [`Envelope`]. Caller and storage errors become
//! `failure` envelopes; they never escape as panics or process exits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::core::graph::successors;
use crate::core::recommend::{HintContext, next_action};
use crate::core::types::{NewTask, Task, TaskState, ToolOutcome};
use crate::envelope::{Envelope, no_action, observations};
use crate::error::{LedgerError, LedgerResult};
use crate::io::config::{LedgerConfig, load_config};
use crate::io::failure_memory::FailureMemory;
use crate::io::init::LedgerPaths;
use crate::io::payload::parse_payload;
use crate::io::store::LedgerStore;
use crate::machine::{StateMachine, TransitionOutcome};
use crate::resume::build_resume;

/// One request to the ledger. Serialized with an `op` tag, e.g.
/// `{"op": "transition", "task_id": "task-0001", "from": "PLANNING", "to": "CODING"}`.
///
/// Operations that take an optional `task_id` fall back to the active task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTask(NewTask),
    GetActiveTask,
    GetLastState,
    GetCanonicalState {
        task_id: Option<String>,
    },
    GetTaskState {
        task_id: Option<String>,
    },
    ListTasks,
    Transition {
        task_id: Option<String>,
        to: TaskState,
        /// State the caller last observed. The transition is rejected if the
        /// stored state has moved on since.
        from: TaskState,
        reason: Option<String>,
    },
    RecordStepFailure {
        task_id: Option<String>,
        #[serde(default)]
        strategy: String,
        raw_error: String,
    },
    /// Remember a failed strategy without changing state.
    RecordFailure {
        task_id: Option<String>,
        #[serde(default)]
        strategy: String,
        raw_error: String,
    },
    WriteSnapshot {
        task_id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    ResumeTask {
        task_id: Option<String>,
    },
    GetModelResumePackage {
        task_id: Option<String>,
    },
    RecordToolUsage {
        tool: String,
        outcome: ToolOutcome,
        task_id: Option<String>,
    },
    ToolUsageSummary,
    VerifyHistory {
        task_id: Option<String>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateTask(_) => "create_task",
            Operation::GetActiveTask => "get_active_task",
            Operation::GetLastState => "get_last_state",
            Operation::GetCanonicalState { .. } => "get_canonical_state",
            Operation::GetTaskState { .. } => "get_task_state",
            Operation::ListTasks => "list_tasks",
            Operation::Transition { .. } => "transition",
            Operation::RecordStepFailure { .. } => "record_step_failure",
            Operation::RecordFailure { .. } => "record_failure",
            Operation::WriteSnapshot { .. } => "write_snapshot",
            Operation::ResumeTask { .. } => "resume_task",
            Operation::GetModelResumePackage { .. } => "get_model_resume_package",
            Operation::RecordToolUsage { .. } => "record_tool_usage",
            Operation::ToolUsageSummary => "tool_usage_summary",
            Operation::VerifyHistory { .. } => "verify_history",
        }
    }
}

/// A project's ledger: config, store and state machine.
pub struct Ledger {
    root: Option<PathBuf>,
    config: LedgerConfig,
    machine: StateMachine,
}

impl Ledger {
    /// Open the ledger of the project at `root`, creating the store if missing.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = LedgerPaths::new(root);
        let config = load_config(&paths.config_path)?;
        let store = LedgerStore::open(&paths.store_path, config.busy_timeout())
            .with_context(|| format!("open store {}", paths.store_path.display()))?;
        Ok(Self::from_parts(Some(paths.root), config, Arc::new(store)))
    }

    pub fn open_in_memory(config: LedgerConfig) -> LedgerResult<Self> {
        let store = LedgerStore::open_in_memory()?;
        Ok(Self::from_parts(None, config, Arc::new(store)))
    }

    pub fn from_parts(root: Option<PathBuf>, config: LedgerConfig, store: Arc<LedgerStore>) -> Self {
        let failures = FailureMemory::new(store.clone(), config.failure_retention_per_task);
        let machine = StateMachine::new(
            store,
            failures,
            config.policy(),
            config.default_lineage.clone(),
        );
        Self {
            root,
            config,
            machine,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        self.machine.store()
    }

    /// Execute one operation and wrap the result in an envelope.
    pub fn execute(&self, op: Operation) -> Envelope {
        let name = op.name();
        debug!(op = name, "executing operation");
        match self.dispatch(op) {
            Ok(envelope) => envelope,
            Err(err) => {
                if err.is_retryable() {
                    warn!(op = name, error = %err, "operation failed in storage");
                } else {
                    debug!(op = name, error = %err, "operation rejected");
                }
                Envelope::failure(&err)
            }
        }
    }

    fn dispatch(&self, op: Operation) -> LedgerResult<Envelope> {
        match op {
            Operation::CreateTask(new) => self.create_task(&new),
            Operation::GetActiveTask => self.get_active_task(),
            Operation::GetLastState => self.get_last_state(),
            Operation::GetCanonicalState { task_id } => self.get_canonical_state(task_id),
            Operation::GetTaskState { task_id } => self.get_task_state(task_id),
            Operation::ListTasks => self.list_tasks(),
            Operation::Transition {
                task_id,
                to,
                from,
                reason,
            } => {
                let task_id = self.resolve_task_id(task_id)?;
                let outcome = self
                    .machine
                    .transition_from(&task_id, from, to, reason.as_deref())?;
                self.transition_envelope(outcome)
            }
            Operation::RecordStepFailure {
                task_id,
                strategy,
                raw_error,
            } => {
                let task_id = self.resolve_task_id(task_id)?;
                let outcome = self
                    .machine
                    .record_step_failure(&task_id, &strategy, &raw_error)?;
                self.transition_envelope(outcome)
            }
            Operation::RecordFailure {
                task_id,
                strategy,
                raw_error,
            } => self.record_failure(task_id, &strategy, &raw_error),
            Operation::WriteSnapshot { task_id, payload } => self.write_snapshot(task_id, &payload),
            Operation::ResumeTask { task_id } => self.resume_task(task_id),
            Operation::GetModelResumePackage { task_id } => {
                let package = build_resume(
                    &self.machine,
                    task_id.as_deref(),
                    self.config.resume_failure_limit,
                )?;
                let next = package.next_recommended_action.clone();
                let mut obs = match to_value(&package)? {
                    Value::Object(map) => map,
                    other => observations([("package", other)]),
                };
                if let Some(root) = &self.root {
                    obs.insert("project_root".to_string(), json!(root.display().to_string()));
                }
                Ok(Envelope::success(obs, next))
            }
            Operation::RecordToolUsage {
                tool,
                outcome,
                task_id,
            } => {
                let pattern = self
                    .store()
                    .record_tool_usage(&tool, outcome, task_id.as_deref())?;
                Ok(Envelope::success(
                    observations([("pattern", to_value(&pattern)?)]),
                    no_action(),
                ))
            }
            Operation::ToolUsageSummary => self.tool_usage_summary(),
            Operation::VerifyHistory { task_id } => self.verify_history(task_id),
        }
    }

    fn resolve_task_id(&self, task_id: Option<String>) -> LedgerResult<String> {
        match task_id {
            Some(id) => Ok(id),
            None => self
                .store()
                .get_active_task()?
                .map(|task| task.id)
                .ok_or_else(|| LedgerError::NotFound("no active task; pass a task id".to_string())),
        }
    }

    fn hint_for(&self, task: &Task, outcome: Option<&TransitionOutcome>) -> LedgerResult<String> {
        let known_bad = self
            .machine
            .failures()
            .known_bad_signatures(&task.id, self.config.resume_failure_limit)?;
        let has_canonical = match outcome.and_then(|o| o.canonical_restored) {
            Some(restored) => restored,
            None => self.store().get_canonical(&task.id)?.is_some(),
        };
        let decision = match outcome {
            Some(outcome) => outcome.decision,
            None => self.machine.decision(&task.id)?,
        };
        Ok(next_action(
            task.state,
            &HintContext {
                known_bad_signatures: &known_bad,
                has_canonical,
                decision: Some(decision),
            },
        ))
    }

    fn create_task(&self, new: &NewTask) -> LedgerResult<Envelope> {
        let created = self.machine.create_task(new)?;
        let next = self.hint_for(&created.task, None)?;
        Ok(Envelope::success(
            observations([
                ("task_id", json!(created.task.id)),
                ("task", to_value(&created.task)?),
                ("superseded", json!(created.superseded)),
                (
                    "seeded_snapshot_id",
                    json!(created.seeded_snapshot.map(|s| s.id)),
                ),
            ]),
            next,
        ))
    }

    fn get_active_task(&self) -> LedgerResult<Envelope> {
        let Some(task) = self.store().get_active_task()? else {
            return Ok(Envelope::success(
                observations([("active_task", Value::Null)]),
                "Create a task to start tracking work.",
            ));
        };
        let next = self.hint_for(&task, None)?;
        Ok(Envelope::success(
            observations([("active_task", to_value(&task)?)]),
            next,
        ))
    }

    fn get_last_state(&self) -> LedgerResult<Envelope> {
        let (snapshot, active) = self
            .store()
            .read(|txn| Ok((txn.latest_snapshot()?, txn.active_task()?)))?;
        let mut obs = observations([
            ("has_snapshot", json!(snapshot.is_some())),
            ("last_snapshot", to_value(&snapshot)?),
            ("active_task", to_value(&active)?),
        ]);
        if let Some(root) = &self.root {
            obs.insert("project_root".to_string(), json!(root.display().to_string()));
        }
        let next = match (&active, &snapshot) {
            (Some(task), _) => self.hint_for(task, None)?,
            (None, None) => "No prior state; create a task and write a first snapshot.".to_string(),
            (None, Some(_)) => "No active task; resume a previous task or create a new one.".to_string(),
        };
        Ok(Envelope::success(obs, next))
    }

    fn get_canonical_state(&self, task_id: Option<String>) -> LedgerResult<Envelope> {
        let (lineage, canonical) = self.store().read(|txn| {
            let lineage = match &task_id {
                Some(id) => txn.get_task(id)?.lineage,
                None => match txn.active_task()? {
                    Some(task) => task.lineage,
                    None => self.config.default_lineage.clone(),
                },
            };
            let canonical = txn.canonical_for_lineage(&lineage)?;
            Ok((lineage, canonical))
        })?;
        let next = if canonical.is_some() {
            "Use the canonical state for rollback or handover."
        } else {
            "Complete a verified run to establish a canonical state."
        };
        Ok(Envelope::success(
            observations([
                ("lineage", json!(lineage)),
                ("has_canonical", json!(canonical.is_some())),
                ("canonical", to_value(&canonical)?),
            ]),
            next,
        ))
    }

    fn get_task_state(&self, task_id: Option<String>) -> LedgerResult<Envelope> {
        let task_id = self.resolve_task_id(task_id)?;
        let task = self.store().get_task(&task_id)?;
        let history = self.store().transitions(&task_id)?;
        let decision = self.machine.decision(&task_id)?;
        let next = self.hint_for(&task, None)?;
        Ok(Envelope::success(
            observations([
                ("task", to_value(&task)?),
                ("decision", to_value(&decision)?),
                ("legal_next", to_value(&successors(task.state))?),
                ("history", to_value(&history)?),
            ]),
            next,
        ))
    }

    fn list_tasks(&self) -> LedgerResult<Envelope> {
        let tasks = self.store().list_tasks()?;
        Ok(Envelope::success(
            observations([("count", json!(tasks.len())), ("tasks", to_value(&tasks)?)]),
            no_action(),
        ))
    }

    fn transition_envelope(&self, outcome: TransitionOutcome) -> LedgerResult<Envelope> {
        let next = self.hint_for(&outcome.task, Some(&outcome))?;
        let mut obs = observations([
            ("task_id", json!(outcome.task.id)),
            ("state", json!(outcome.task.state)),
            ("retry_count", json!(outcome.task.retry_count)),
            ("cycle", json!(outcome.task.cycle)),
            ("active", json!(outcome.task.active)),
            ("decision", to_value(&outcome.decision)?),
            ("applied", to_value(&outcome.applied)?),
        ]);
        if let Some(forced) = &outcome.policy_forced {
            obs.insert("policy_forced".to_string(), to_value(forced)?);
        }
        if let Some(promoted) = &outcome.canonical_promoted {
            obs.insert("canonical_promoted".to_string(), to_value(promoted)?);
        }
        if let Some(restored) = outcome.canonical_restored {
            obs.insert("canonical_restored".to_string(), json!(restored));
        }
        if let Some(snapshot) = &outcome.restored_snapshot {
            obs.insert("restored_snapshot_id".to_string(), json!(snapshot.id));
        }
        if let Some(failure) = &outcome.failure {
            obs.insert("failure".to_string(), to_value(failure)?);
        }
        Ok(Envelope::success(obs, next))
    }

    fn record_failure(
        &self,
        task_id: Option<String>,
        strategy: &str,
        raw_error: &str,
    ) -> LedgerResult<Envelope> {
        let task_id = self.resolve_task_id(task_id)?;
        let failure = self.machine.failures().record(&task_id, strategy, raw_error)?;
        let repeats = self.machine.failures().recent_count(
            &task_id,
            &failure.signature,
            self.config.failure_window,
        )?;
        Ok(Envelope::success(
            observations([
                ("failure", to_value(&failure)?),
                ("recent_identical", json!(repeats)),
            ]),
            format!(
                "Avoid repeating this strategy (signature `{}`); try a different approach.",
                failure.signature
            ),
        ))
    }

    fn write_snapshot(&self, task_id: Option<String>, payload: &Value) -> LedgerResult<Envelope> {
        let task_id = self.resolve_task_id(task_id)?;
        let payload = if payload.is_null() {
            Default::default()
        } else {
            parse_payload(payload)?
        };
        let snapshot = self.store().write_snapshot(&task_id, &payload)?;
        Ok(Envelope::success(
            observations([
                ("snapshot_id", json!(snapshot.id)),
                ("snapshot", to_value(&snapshot)?),
            ]),
            no_action(),
        ))
    }

    fn resume_task(&self, task_id: Option<String>) -> LedgerResult<Envelope> {
        let task_id = self.resolve_task_id(task_id)?;
        let limit = self.config.resume_failure_limit;
        let (task, snapshot, failures) = self.store().read(|txn| {
            let task = txn.get_task(&task_id)?;
            let snapshot = txn.last_snapshot(&task_id)?;
            let failures = txn.recent_failures(&task_id, limit)?;
            Ok((task, snapshot, failures))
        })?;
        let next = self.hint_for(&task, None)?;
        Ok(Envelope::success(
            observations([
                ("task", to_value(&task)?),
                ("latest_snapshot", to_value(&snapshot)?),
                ("recent_failures", to_value(&failures)?),
            ]),
            next,
        ))
    }

    fn tool_usage_summary(&self) -> LedgerResult<Envelope> {
        let patterns = self.store().tool_usage()?;
        let mut totals = Map::new();
        for outcome in [ToolOutcome::Success, ToolOutcome::Failure] {
            let total: u64 = patterns
                .iter()
                .filter(|p| p.outcome == outcome)
                .map(|p| p.count)
                .sum();
            totals.insert(outcome.as_str().to_string(), json!(total));
        }
        Ok(Envelope::success(
            observations([
                ("patterns", to_value(&patterns)?),
                ("totals", Value::Object(totals)),
            ]),
            no_action(),
        ))
    }

    fn verify_history(&self, task_id: Option<String>) -> LedgerResult<Envelope> {
        let task_ids = match task_id {
            Some(id) => vec![id],
            None => self
                .store()
                .list_tasks()?
                .into_iter()
                .map(|task| task.id)
                .collect(),
        };
        let mut violations = Map::new();
        for id in &task_ids {
            let errors = self.store().verify_history(id)?;
            if !errors.is_empty() {
                violations.insert(id.clone(), json!(errors));
            }
        }
        let valid = violations.is_empty();
        let next = if valid {
            no_action()
        } else {
            "Stored history is inconsistent; inspect the listed tasks before continuing.".to_string()
        };
        Ok(Envelope::success(
            observations([
                ("checked", json!(task_ids.len())),
                ("valid", json!(valid)),
                ("violations", Value::Object(violations)),
            ]),
            next,
        ))
    }
}

fn to_value<T: Serialize>(value: &T) -> LedgerResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| LedgerError::Storage(format!("serialize observation: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::open_in_memory(LedgerConfig::default()).expect("ledger")
    }

    fn op(value: Value) -> Operation {
        serde_json::from_value(value).expect("operation")
    }

    #[test]
    fn operations_parse_from_tagged_json() {
        assert_eq!(
            op(json!({"op": "create_task", "goal": "g", "supersede": true})),
            Operation::CreateTask(NewTask {
                goal: "g".to_string(),
                supersede: true,
                ..NewTask::default()
            })
        );
        assert_eq!(
            op(json!({"op": "transition", "from": "EXECUTING", "to": "FAILED_RETRY"})).name(),
            "transition"
        );
        assert!(serde_json::from_value::<Operation>(json!({"op": "drop_tables"})).is_err());
        assert!(
            serde_json::from_value::<Operation>(json!({"op": "transition", "to": "CODING"}))
                .is_err()
        );
    }

    #[test]
    fn create_then_query_active_task() {
        let ledger = ledger();
        let env = ledger.execute(op(json!({"op": "create_task", "goal": "wire the CLI"})));
        assert!(env.is_success(), "{env:?}");
        assert_eq!(env.observations["task_id"], json!("task-0001"));

        let env = ledger.execute(Operation::GetActiveTask);
        assert_eq!(env.observations["active_task"]["goal"], json!("wire the CLI"));
        assert!(env.next_recommended_action.contains("CODING"));
    }

    #[test]
    fn caller_errors_become_failure_envelopes() {
        let ledger = ledger();
        let env = ledger.execute(op(json!({"op": "transition", "from": "PLANNING", "to": "CODING"})));
        assert!(!env.is_success());
        assert_eq!(env.error_kind(), Some("not_found"));

        ledger.execute(op(json!({"op": "create_task", "goal": "g"})));
        let env = ledger.execute(op(json!({"op": "transition", "from": "PLANNING", "to": "COMPLETED"})));
        assert_eq!(env.error_kind(), Some("invalid_transition"));

        let env = ledger.execute(op(json!({"op": "transition", "from": "CODING", "to": "EXECUTING"})));
        assert_eq!(env.error_kind(), Some("invalid_transition"));
        assert_eq!(
            ledger.execute(Operation::GetActiveTask).observations["active_task"]["state"],
            json!("PLANNING")
        );

        let env = ledger.execute(op(json!({"op": "create_task", "goal": "second"})));
        assert_eq!(env.error_kind(), Some("conflict"));
    }

    #[test]
    fn forced_rollback_is_reported_as_success() {
        let ledger = ledger();
        ledger.execute(op(json!({"op": "create_task", "goal": "g"})));
        for (from, to) in [("PLANNING", "CODING"), ("CODING", "EXECUTING")] {
            ledger.execute(op(json!({"op": "transition", "from": from, "to": to})));
        }
        let mut last = None;
        for attempt in 0..3 {
            let env = ledger.execute(op(json!({
                "op": "record_step_failure",
                "strategy": "cargo build",
                "raw_error": "timeout:build"
            })));
            assert!(env.is_success(), "{env:?}");
            if attempt < 2 {
                for (from, to) in [("FAILED_RETRY", "CODING"), ("CODING", "EXECUTING")] {
                    let env = ledger.execute(op(json!({"op": "transition", "from": from, "to": to})));
                    assert!(env.is_success(), "{env:?}");
                }
            }
            last = Some(env);
        }
        let env = last.expect("envelope");
        assert_eq!(env.observations["state"], json!("ROLLBACK"));
        assert_eq!(env.observations["policy_forced"]["cause"], json!("repeated_failure"));
        assert_eq!(env.observations["canonical_restored"], json!(false));
        assert!(env.next_recommended_action.contains("PLANNING"));
    }

    #[test]
    fn snapshot_payload_is_schema_checked() {
        let ledger = ledger();
        ledger.execute(op(json!({"op": "create_task", "goal": "g"})));
        let env = ledger.execute(op(json!({
            "op": "write_snapshot",
            "payload": {"files": ["src/lib.rs"], "bogus": 1}
        })));
        assert_eq!(env.error_kind(), Some("invalid_input"));

        let env = ledger.execute(op(json!({
            "op": "write_snapshot",
            "payload": {"files": ["src/lib.rs"]}
        })));
        assert!(env.is_success());
        let env = ledger.execute(Operation::GetLastState);
        assert_eq!(env.observations["has_snapshot"], json!(true));
        assert_eq!(
            env.observations["last_snapshot"]["payload"]["files"],
            json!(["src/lib.rs"])
        );
    }

    #[test]
    fn tool_usage_summary_totals_outcomes() {
        let ledger = ledger();
        for outcome in ["success", "success", "failure"] {
            let env = ledger.execute(op(json!({
                "op": "record_tool_usage",
                "tool": "terminal_execute",
                "outcome": outcome
            })));
            assert!(env.is_success());
        }
        let env = ledger.execute(Operation::ToolUsageSummary);
        assert_eq!(env.observations["totals"], json!({"success": 2, "failure": 1}));
    }

    #[test]
    fn verify_history_reports_clean_store() {
        let ledger = ledger();
        ledger.execute(op(json!({"op": "create_task", "goal": "g"})));
        ledger.execute(op(json!({"op": "transition", "from": "PLANNING", "to": "CODING"})));
        let env = ledger.execute(op(json!({"op": "verify_history"})));
        assert_eq!(env.observations["valid"], json!(true));
        assert_eq!(env.observations["checked"], json!(1));
    }

    #[test]
    fn canonical_state_defaults_to_configured_lineage() {
        let ledger = ledger();
        let env = ledger.execute(op(json!({"op": "get_canonical_state"})));
        assert!(env.is_success());
        assert_eq!(env.observations["lineage"], json!("main"));
        assert_eq!(env.observations["has_canonical"], json!(false));
    }

    #[test]
    fn hints_and_resume_package_agree_on_known_bad_signatures() {
        let ledger = Ledger::open_in_memory(LedgerConfig {
            resume_failure_limit: 2,
            ..LedgerConfig::default()
        })
        .expect("ledger");
        ledger.execute(op(json!({"op": "create_task", "goal": "g"})));
        for (from, to) in [("PLANNING", "CODING"), ("CODING", "EXECUTING")] {
            ledger.execute(op(json!({"op": "transition", "from": from, "to": to})));
        }
        let env = ledger.execute(op(json!({
            "op": "record_step_failure",
            "raw_error": "oom:linker"
        })));
        assert_eq!(env.observations["state"], json!("FAILED_RETRY"));
        // The older signature falls outside the newest `resume_failure_limit` records.
        for _ in 0..2 {
            ledger.execute(op(json!({"op": "record_failure", "raw_error": "timeout:build"})));
        }

        let state = ledger.execute(op(json!({"op": "get_task_state"})));
        let package = ledger.execute(op(json!({"op": "get_model_resume_package"})));
        assert!(state.is_success() && package.is_success());
        assert!(state.next_recommended_action.contains("oom:linker"));
        assert_eq!(state.next_recommended_action, package.next_recommended_action);
        assert_eq!(
            package.observations["known_bad_signatures"],
            json!(["timeout:build", "oom:linker"])
        );
    }
}
