//! SQLite-backed ledger store.
//!
//! The store is the only owner of persisted records. All writes go through
//! [`LedgerStore::write`], which holds the connection lock and a `BEGIN
//! IMMEDIATE` transaction, so a multi-record update (transition, audit record,
//! canonical promotion) commits or rolls back as one unit. Reads run inside a
//! deferred transaction and see a consistent snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::core::graph::{INITIAL_STATE, is_legal};
use crate::core::invariants::validate_walk;
use crate::core::types::{
    CanonicalState, ContextSnapshot, FailureRecord, NewTask, SnapshotPayload, StateTransition,
    Task, TaskState, ToolOutcome, ToolUsagePattern,
};
use crate::error::{LedgerError, LedgerResult};

const SCHEMA_VERSION: &str = "1";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS counters (
  name TEXT PRIMARY KEY,
  value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  lineage TEXT NOT NULL,
  goal TEXT NOT NULL,
  state TEXT NOT NULL,
  retry_count INTEGER NOT NULL DEFAULT 0,
  cycle INTEGER NOT NULL DEFAULT 0,
  active INTEGER NOT NULL,
  superseded_by TEXT,
  constraints TEXT NOT NULL,
  protected_paths TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_single_active ON tasks(active) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_tasks_lineage ON tasks(lineage);

CREATE TABLE IF NOT EXISTS transitions (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL REFERENCES tasks(id),
  from_state TEXT,
  to_state TEXT NOT NULL,
  at_ms INTEGER NOT NULL,
  reason TEXT,
  forced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_transitions_task_seq ON transitions(task_id, seq);

CREATE TABLE IF NOT EXISTS snapshots (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  task_id TEXT NOT NULL REFERENCES tasks(id),
  created_at_ms INTEGER NOT NULL,
  payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_task_seq ON snapshots(task_id, seq);

CREATE TABLE IF NOT EXISTS canonical_states (
  lineage TEXT PRIMARY KEY,
  task_id TEXT NOT NULL REFERENCES tasks(id),
  state TEXT NOT NULL,
  snapshot_id TEXT,
  payload TEXT NOT NULL,
  promoted_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS failures (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL REFERENCES tasks(id),
  cycle INTEGER NOT NULL,
  strategy TEXT NOT NULL,
  signature TEXT NOT NULL,
  raw_error TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_failures_task_cycle_seq ON failures(task_id, cycle, seq);
CREATE INDEX IF NOT EXISTS idx_failures_created ON failures(created_at_ms);

CREATE TABLE IF NOT EXISTS tool_usage (
  tool TEXT NOT NULL,
  outcome TEXT NOT NULL,
  count INTEGER NOT NULL,
  last_used_ms INTEGER NOT NULL,
  PRIMARY KEY (tool, outcome)
);
"#;

const TASK_COLUMNS: &str = "id, lineage, goal, state, retry_count, cycle, active, superseded_by, \
     constraints, protected_paths, created_at_ms, updated_at_ms";
const TRANSITION_COLUMNS: &str = "seq, task_id, from_state, to_state, at_ms, reason, forced";
const SNAPSHOT_COLUMNS: &str = "seq, id, task_id, created_at_ms, payload";
const FAILURE_COLUMNS: &str =
    "seq, task_id, cycle, strategy, signature, raw_error, created_at_ms";

#[derive(Debug)]
pub struct LedgerStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl LedgerStore {
    /// Open (or create) the store file and apply the schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> LedgerResult<Self> {
        debug!(path = %path.display(), "opening ledger store");
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "journal mode set");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Volatile store for tests and dry runs.
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> LedgerResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params!["schema_version", SCHEMA_VERSION],
        )?;
        let version: String = conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        if version != SCHEMA_VERSION {
            return Err(LedgerError::Storage(format!(
                "unsupported schema version {version} (expected {SCHEMA_VERSION})"
            )));
        }
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Storage("store lock poisoned".to_string()))
    }

    /// Run `f` inside one serialized write transaction.
    ///
    /// Commits only if `f` succeeds; any error rolls back every record `f` wrote.
    pub fn write<T>(&self, f: impl FnOnce(&Txn<'_>) -> LedgerResult<T>) -> LedgerResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = Txn {
            tx,
            now_ms: now_ms(),
        };
        let value = f(&txn)?;
        txn.tx.commit()?;
        Ok(value)
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Txn<'_>) -> LedgerResult<T>) -> LedgerResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let txn = Txn {
            tx,
            now_ms: now_ms(),
        };
        let value = f(&txn)?;
        txn.tx.finish()?;
        Ok(value)
    }

    pub fn create_task(
        &self,
        new: &NewTask,
        default_lineage: &str,
    ) -> LedgerResult<CreatedTask> {
        self.write(|txn| txn.insert_task(new, default_lineage))
    }

    pub fn get_task(&self, task_id: &str) -> LedgerResult<Task> {
        self.read(|txn| txn.get_task(task_id))
    }

    pub fn get_active_task(&self) -> LedgerResult<Option<Task>> {
        self.read(|txn| txn.active_task())
    }

    pub fn list_tasks(&self) -> LedgerResult<Vec<Task>> {
        self.read(|txn| txn.list_tasks())
    }

    pub fn append_transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        reason: Option<&str>,
    ) -> LedgerResult<StateTransition> {
        self.write(|txn| txn.append_transition(task_id, from, to, reason, false))
            .map(|(_, record)| record)
    }

    pub fn transitions(&self, task_id: &str) -> LedgerResult<Vec<StateTransition>> {
        self.read(|txn| {
            txn.get_task(task_id)?;
            txn.transitions(task_id)
        })
    }

    /// Check the stored history of `task_id` against the state graph.
    pub fn verify_history(&self, task_id: &str) -> LedgerResult<Vec<String>> {
        self.read(|txn| {
            let task = txn.get_task(task_id)?;
            let history = txn.transitions(task_id)?;
            Ok(validate_walk(&history, Some(&task)))
        })
    }

    pub fn write_snapshot(
        &self,
        task_id: &str,
        payload: &SnapshotPayload,
    ) -> LedgerResult<ContextSnapshot> {
        self.write(|txn| txn.insert_snapshot(task_id, payload))
    }

    pub fn get_last_snapshot(&self, task_id: &str) -> LedgerResult<Option<ContextSnapshot>> {
        self.read(|txn| {
            txn.get_task(task_id)?;
            txn.last_snapshot(task_id)
        })
    }

    /// Most recent snapshot of any task.
    pub fn latest_snapshot(&self) -> LedgerResult<Option<ContextSnapshot>> {
        self.read(|txn| txn.latest_snapshot())
    }

    pub fn set_canonical(
        &self,
        task_id: &str,
        state: TaskState,
        payload: &SnapshotPayload,
    ) -> LedgerResult<CanonicalState> {
        self.write(|txn| {
            let task = txn.get_task(task_id)?;
            txn.upsert_canonical(&task, state, None, payload)
        })
    }

    pub fn get_canonical(&self, task_id: &str) -> LedgerResult<Option<CanonicalState>> {
        self.read(|txn| {
            let task = txn.get_task(task_id)?;
            txn.canonical_for_lineage(&task.lineage)
        })
    }

    pub fn append_failure(
        &self,
        task_id: &str,
        strategy: &str,
        signature: &str,
        raw_error: &str,
        retention: u32,
    ) -> LedgerResult<FailureRecord> {
        self.write(|txn| {
            let task = txn.get_task(task_id)?;
            txn.insert_failure(&task, strategy, signature, raw_error, retention)
        })
    }

    /// Matches of `signature` among the last `window` failures of the task's current cycle.
    pub fn count_recent_failures(
        &self,
        task_id: &str,
        signature: &str,
        window: u32,
    ) -> LedgerResult<u32> {
        self.read(|txn| {
            let task = txn.get_task(task_id)?;
            txn.count_recent_failures(&task, signature, window)
        })
    }

    pub fn recent_failures(&self, task_id: &str, limit: u32) -> LedgerResult<Vec<FailureRecord>> {
        self.read(|txn| {
            txn.get_task(task_id)?;
            txn.recent_failures(task_id, limit)
        })
    }

    pub fn latest_failure(&self, task_id: &str) -> LedgerResult<Option<FailureRecord>> {
        self.read(|txn| {
            let task = txn.get_task(task_id)?;
            txn.latest_failure(&task)
        })
    }

    pub fn record_tool_usage(
        &self,
        tool: &str,
        outcome: ToolOutcome,
        task_id: Option<&str>,
    ) -> LedgerResult<ToolUsagePattern> {
        self.write(|txn| txn.bump_tool_usage(tool, outcome, task_id))
    }

    pub fn tool_usage(&self) -> LedgerResult<Vec<ToolUsagePattern>> {
        self.read(|txn| txn.tool_usage())
    }
}

/// Result of inserting a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTask {
    pub task: Task,
    pub initial: StateTransition,
    /// Id of the task that was active before and got superseded.
    pub superseded: Option<String>,
}

/// Transaction handle handed to [`LedgerStore::write`] and [`LedgerStore::read`].
///
/// Every record written through one handle shares the same timestamp.
pub struct Txn<'c> {
    tx: Transaction<'c>,
    now_ms: i64,
}

impl Txn<'_> {
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn find_task(&self, task_id: &str) -> LedgerResult<Option<Task>> {
        let raw = self
            .tx
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
                raw_task,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    pub fn get_task(&self, task_id: &str) -> LedgerResult<Task> {
        self.find_task(task_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("task {task_id}")))
    }

    pub fn active_task(&self) -> LedgerResult<Option<Task>> {
        let raw = self
            .tx
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE active = 1"),
                [],
                raw_task,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    pub fn list_tasks(&self) -> LedgerResult<Vec<Task>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], raw_task)?;
        let mut tasks = Vec::new();
        for raw in rows {
            tasks.push(raw?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn insert_task(&self, new: &NewTask, default_lineage: &str) -> LedgerResult<CreatedTask> {
        if new.goal.trim().is_empty() {
            return Err(LedgerError::InvalidInput("goal must not be empty".to_string()));
        }
        let lineage = new.lineage.as_deref().unwrap_or(default_lineage);
        validate_id(lineage)?;

        let task_id = match &new.task_id {
            Some(id) => {
                validate_id(id)?;
                if self.find_task(id)?.is_some() {
                    return Err(LedgerError::Conflict(format!("task id {id} already exists")));
                }
                id.clone()
            }
            None => self.generate_task_id()?,
        };

        let superseded = match self.active_task()? {
            Some(active) if !new.supersede => {
                return Err(LedgerError::Conflict(format!(
                    "task {} is active in state {} (request supersede to replace it)",
                    active.id, active.state
                )));
            }
            Some(active) => {
                self.tx.execute(
                    "UPDATE tasks SET active = 0, superseded_by = ?2, updated_at_ms = ?3 WHERE id = ?1",
                    params![active.id, task_id, self.now_ms],
                )?;
                info!(task_id = %active.id, superseded_by = %task_id, "task superseded");
                Some(active.id)
            }
            None => None,
        };

        let task = Task {
            id: task_id,
            lineage: lineage.to_string(),
            goal: new.goal.clone(),
            state: INITIAL_STATE,
            retry_count: 0,
            cycle: 0,
            active: true,
            superseded_by: None,
            constraints: new.constraints.clone(),
            protected_paths: new.protected_paths.clone(),
            created_at_ms: self.now_ms,
            updated_at_ms: self.now_ms,
        };
        let protected = serde_json::to_string(&task.protected_paths)
            .map_err(|err| LedgerError::InvalidInput(err.to_string()))?;
        self.tx.execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                task.id,
                task.lineage,
                task.goal,
                task.state.as_str(),
                task.retry_count,
                task.cycle,
                task.active,
                task.superseded_by,
                task.constraints,
                protected,
                task.created_at_ms,
                task.updated_at_ms
            ],
        )?;

        let reason = match &superseded {
            Some(old) => format!("created (supersedes {old})"),
            None => "created".to_string(),
        };
        let initial = self.insert_transition(&task.id, None, INITIAL_STATE, Some(&reason), false)?;
        info!(task_id = %task.id, lineage = %task.lineage, "task created");
        Ok(CreatedTask {
            task,
            initial,
            superseded,
        })
    }

    fn generate_task_id(&self) -> LedgerResult<String> {
        loop {
            let n = self.next_counter("task_seq")?;
            let id = format!("task-{n:04}");
            if self.find_task(&id)?.is_none() {
                return Ok(id);
            }
        }
    }

    /// Apply one guarded edge and its bookkeeping.
    ///
    /// Fails without writing when `from` is not the stored state, the edge is
    /// not in the graph, or the task was superseded. Maintains the retry
    /// counter, cycle and active flag.
    pub fn append_transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        reason: Option<&str>,
        forced: bool,
    ) -> LedgerResult<(Task, StateTransition)> {
        let task = self.get_task(task_id)?;
        if task.state != from {
            return Err(LedgerError::invalid_transition(
                task_id,
                format!("stale from-state {from}: stored state is {}", task.state),
            ));
        }
        if !is_legal(from, to) {
            return Err(LedgerError::invalid_transition(
                task_id,
                format!("{from} -> {to} is not an edge of the state graph"),
            ));
        }
        if let Some(successor) = &task.superseded_by {
            return Err(LedgerError::Conflict(format!(
                "task {task_id} was superseded by {successor}"
            )));
        }

        let mut next = task.clone();
        next.state = to;
        match (from, to) {
            (_, TaskState::FailedRetry) => next.retry_count += 1,
            (TaskState::Verifying, TaskState::Completed) => next.retry_count = 0,
            (TaskState::Rollback, TaskState::Planning) => {
                if let Some(active) = self.active_task()? {
                    return Err(LedgerError::Conflict(format!(
                        "cannot restart {task_id}: task {} is active",
                        active.id
                    )));
                }
                next.cycle += 1;
                next.retry_count = 0;
            }
            _ => {}
        }
        next.active = !to.is_terminal();
        next.updated_at_ms = self.now_ms;

        let changed = self.tx.execute(
            "UPDATE tasks SET state = ?2, retry_count = ?3, cycle = ?4, active = ?5, updated_at_ms = ?6 \
             WHERE id = ?1 AND state = ?7",
            params![
                task_id,
                to.as_str(),
                next.retry_count,
                next.cycle,
                next.active,
                next.updated_at_ms,
                from.as_str()
            ],
        )?;
        if changed != 1 {
            return Err(LedgerError::invalid_transition(
                task_id,
                format!("stale from-state {from}"),
            ));
        }

        let record = self.insert_transition(task_id, Some(from), to, reason, forced)?;
        info!(task_id, from = %from, to = %to, forced, retry_count = next.retry_count, "transition applied");
        Ok((next, record))
    }

    fn insert_transition(
        &self,
        task_id: &str,
        from: Option<TaskState>,
        to: TaskState,
        reason: Option<&str>,
        forced: bool,
    ) -> LedgerResult<StateTransition> {
        self.tx.execute(
            "INSERT INTO transitions (task_id, from_state, to_state, at_ms, reason, forced) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                from.map(TaskState::as_str),
                to.as_str(),
                self.now_ms,
                reason,
                forced
            ],
        )?;
        Ok(StateTransition {
            seq: self.tx.last_insert_rowid(),
            task_id: task_id.to_string(),
            from,
            to,
            at_ms: self.now_ms,
            reason: reason.map(str::to_string),
            forced,
        })
    }

    pub fn transitions(&self, task_id: &str) -> LedgerResult<Vec<StateTransition>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {TRANSITION_COLUMNS} FROM transitions WHERE task_id = ?1 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, bool>(6)?,
            ))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (seq, task_id, from, to, at_ms, reason, forced) = row?;
            history.push(StateTransition {
                seq,
                task_id,
                from: from.as_deref().map(parse_state).transpose()?,
                to: parse_state(&to)?,
                at_ms,
                reason,
                forced,
            });
        }
        Ok(history)
    }

    pub fn insert_snapshot(
        &self,
        task_id: &str,
        payload: &SnapshotPayload,
    ) -> LedgerResult<ContextSnapshot> {
        self.get_task(task_id)?;
        let encoded = encode_payload(payload)?;
        let n = self.next_counter("snapshot_seq")?;
        let id = format!("snap-{n:06}");
        self.tx.execute(
            "INSERT INTO snapshots (id, task_id, created_at_ms, payload) VALUES (?1, ?2, ?3, ?4)",
            params![id, task_id, self.now_ms, encoded],
        )?;
        let seq = self.tx.last_insert_rowid();
        self.touch_task(task_id)?;
        debug!(task_id, snapshot_id = %id, "snapshot written");
        Ok(ContextSnapshot {
            id,
            seq,
            task_id: task_id.to_string(),
            created_at_ms: self.now_ms,
            payload: payload.clone(),
        })
    }

    pub fn last_snapshot(&self, task_id: &str) -> LedgerResult<Option<ContextSnapshot>> {
        let raw = self
            .tx
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                params![task_id],
                raw_snapshot,
            )
            .optional()?;
        raw.map(RawSnapshot::into_snapshot).transpose()
    }

    pub fn latest_snapshot(&self) -> LedgerResult<Option<ContextSnapshot>> {
        let raw = self
            .tx
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY seq DESC LIMIT 1"),
                [],
                raw_snapshot,
            )
            .optional()?;
        raw.map(RawSnapshot::into_snapshot).transpose()
    }

    /// Replace the canonical record of `task`'s lineage.
    pub fn upsert_canonical(
        &self,
        task: &Task,
        state: TaskState,
        snapshot_id: Option<&str>,
        payload: &SnapshotPayload,
    ) -> LedgerResult<CanonicalState> {
        let encoded = encode_payload(payload)?;
        self.tx.execute(
            "INSERT INTO canonical_states (lineage, task_id, state, snapshot_id, payload, promoted_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(lineage) DO UPDATE SET task_id = excluded.task_id, state = excluded.state, \
             snapshot_id = excluded.snapshot_id, payload = excluded.payload, \
             promoted_at_ms = excluded.promoted_at_ms",
            params![
                task.lineage,
                task.id,
                state.as_str(),
                snapshot_id,
                encoded,
                self.now_ms
            ],
        )?;
        self.touch_task(&task.id)?;
        Ok(CanonicalState {
            lineage: task.lineage.clone(),
            task_id: task.id.clone(),
            state,
            snapshot_id: snapshot_id.map(str::to_string),
            payload: payload.clone(),
            promoted_at_ms: self.now_ms,
        })
    }

    pub fn canonical_for_lineage(&self, lineage: &str) -> LedgerResult<Option<CanonicalState>> {
        let raw = self
            .tx
            .query_row(
                "SELECT lineage, task_id, state, snapshot_id, payload, promoted_at_ms \
                 FROM canonical_states WHERE lineage = ?1",
                params![lineage],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((lineage, task_id, state, snapshot_id, payload, promoted_at_ms)) = raw else {
            return Ok(None);
        };
        Ok(Some(CanonicalState {
            lineage,
            task_id,
            state: parse_state(&state)?,
            snapshot_id,
            payload: decode_payload(&payload)?,
            promoted_at_ms,
        }))
    }

    /// Append a failure for the task's current cycle, pruning beyond `retention`.
    pub fn insert_failure(
        &self,
        task: &Task,
        strategy: &str,
        signature: &str,
        raw_error: &str,
        retention: u32,
    ) -> LedgerResult<FailureRecord> {
        self.tx.execute(
            &format!("INSERT INTO failures ({FAILURE_COLUMNS}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6)"),
            params![task.id, task.cycle, strategy, signature, raw_error, self.now_ms],
        )?;
        let seq = self.tx.last_insert_rowid();
        let pruned = self.tx.execute(
            "DELETE FROM failures WHERE task_id = ?1 AND seq NOT IN \
             (SELECT seq FROM failures WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2)",
            params![task.id, retention.max(1)],
        )?;
        if pruned > 0 {
            debug!(task_id = %task.id, pruned, "pruned old failure records");
        }
        self.touch_task(&task.id)?;
        Ok(FailureRecord {
            seq,
            task_id: task.id.clone(),
            cycle: task.cycle,
            strategy: strategy.to_string(),
            signature: signature.to_string(),
            raw_error: raw_error.to_string(),
            created_at_ms: self.now_ms,
        })
    }

    pub fn count_recent_failures(
        &self,
        task: &Task,
        signature: &str,
        window: u32,
    ) -> LedgerResult<u32> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM \
             (SELECT signature FROM failures WHERE task_id = ?1 AND cycle = ?2 ORDER BY seq DESC LIMIT ?3) \
             WHERE signature = ?4",
            params![task.id, task.cycle, window, signature],
            |row| row.get(0),
        )?;
        u32::try_from(count).map_err(|_| LedgerError::corrupt(format!("failure count {count}")))
    }

    /// Most recent failures of the task across all cycles, newest first.
    pub fn recent_failures(&self, task_id: &str, limit: u32) -> LedgerResult<Vec<FailureRecord>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {FAILURE_COLUMNS} FROM failures WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![task_id, limit], failure_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::from)
    }

    /// Newest failure of the task's current cycle.
    pub fn latest_failure(&self, task: &Task) -> LedgerResult<Option<FailureRecord>> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {FAILURE_COLUMNS} FROM failures WHERE task_id = ?1 AND cycle = ?2 \
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![task.id, task.cycle],
                failure_from_row,
            )
            .optional()
            .map_err(LedgerError::from)
    }

    pub fn bump_tool_usage(
        &self,
        tool: &str,
        outcome: ToolOutcome,
        task_id: Option<&str>,
    ) -> LedgerResult<ToolUsagePattern> {
        if tool.trim().is_empty() {
            return Err(LedgerError::InvalidInput("tool name must not be empty".to_string()));
        }
        if let Some(task_id) = task_id {
            self.get_task(task_id)?;
            self.touch_task(task_id)?;
        }
        let count: i64 = self.tx.query_row(
            "INSERT INTO tool_usage (tool, outcome, count, last_used_ms) VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(tool, outcome) DO UPDATE SET count = count + 1, last_used_ms = excluded.last_used_ms \
             RETURNING count",
            params![tool, outcome.as_str(), self.now_ms],
            |row| row.get(0),
        )?;
        Ok(ToolUsagePattern {
            tool: tool.to_string(),
            outcome,
            count: count.max(0) as u64,
            last_used_ms: self.now_ms,
        })
    }

    pub fn tool_usage(&self) -> LedgerResult<Vec<ToolUsagePattern>> {
        let mut stmt = self.tx.prepare(
            "SELECT tool, outcome, count, last_used_ms FROM tool_usage ORDER BY tool ASC, outcome ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut patterns = Vec::new();
        for row in rows {
            let (tool, outcome, count, last_used_ms) = row?;
            patterns.push(ToolUsagePattern {
                tool,
                outcome: outcome.parse().map_err(LedgerError::corrupt)?,
                count: count.max(0) as u64,
                last_used_ms,
            });
        }
        Ok(patterns)
    }

    fn touch_task(&self, task_id: &str) -> LedgerResult<()> {
        self.tx.execute(
            "UPDATE tasks SET updated_at_ms = ?2 WHERE id = ?1",
            params![task_id, self.now_ms],
        )?;
        Ok(())
    }

    fn next_counter(&self, name: &str) -> LedgerResult<i64> {
        let value: i64 = self.tx.query_row(
            "INSERT INTO counters (name, value) VALUES (?1, 1) \
             ON CONFLICT(name) DO UPDATE SET value = value + 1 RETURNING value",
            params![name],
            |row| row.get(0),
        )?;
        Ok(value)
    }
}

/// Validate that an id is safe to print, log and pass on command lines.
pub fn validate_id(id: &str) -> LedgerResult<()> {
    if id.is_empty() {
        return Err(LedgerError::InvalidInput("id must not be empty".to_string()));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(LedgerError::InvalidInput(format!(
            "id must be [A-Za-z0-9._-] only (got '{id}')"
        )));
    }
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_state(raw: &str) -> LedgerResult<TaskState> {
    raw.parse().map_err(LedgerError::corrupt)
}

fn encode_payload(payload: &SnapshotPayload) -> LedgerResult<String> {
    serde_json::to_string(payload).map_err(|err| LedgerError::InvalidInput(err.to_string()))
}

fn decode_payload(raw: &str) -> LedgerResult<SnapshotPayload> {
    serde_json::from_str(raw).map_err(|err| LedgerError::corrupt(format!("snapshot payload: {err}")))
}

struct RawTask {
    id: String,
    lineage: String,
    goal: String,
    state: String,
    retry_count: u32,
    cycle: u32,
    active: bool,
    superseded_by: Option<String>,
    constraints: String,
    protected_paths: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl RawTask {
    fn into_task(self) -> LedgerResult<Task> {
        let protected_paths = serde_json::from_str(&self.protected_paths).map_err(|err| {
            LedgerError::corrupt(format!("protected paths of {}: {err}", self.id))
        })?;
        Ok(Task {
            state: parse_state(&self.state)?,
            id: self.id,
            lineage: self.lineage,
            goal: self.goal,
            retry_count: self.retry_count,
            cycle: self.cycle,
            active: self.active,
            superseded_by: self.superseded_by,
            constraints: self.constraints,
            protected_paths,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

fn raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        lineage: row.get(1)?,
        goal: row.get(2)?,
        state: row.get(3)?,
        retry_count: row.get(4)?,
        cycle: row.get(5)?,
        active: row.get(6)?,
        superseded_by: row.get(7)?,
        constraints: row.get(8)?,
        protected_paths: row.get(9)?,
        created_at_ms: row.get(10)?,
        updated_at_ms: row.get(11)?,
    })
}

struct RawSnapshot {
    seq: i64,
    id: String,
    task_id: String,
    created_at_ms: i64,
    payload: String,
}

impl RawSnapshot {
    fn into_snapshot(self) -> LedgerResult<ContextSnapshot> {
        Ok(ContextSnapshot {
            payload: decode_payload(&self.payload)?,
            id: self.id,
            seq: self.seq,
            task_id: self.task_id,
            created_at_ms: self.created_at_ms,
        })
    }
}

fn raw_snapshot(row: &Row<'_>) -> rusqlite::Result<RawSnapshot> {
    Ok(RawSnapshot {
        seq: row.get(0)?,
        id: row.get(1)?,
        task_id: row.get(2)?,
        created_at_ms: row.get(3)?,
        payload: row.get(4)?,
    })
}

fn failure_from_row(row: &Row<'_>) -> rusqlite::Result<FailureRecord> {
    Ok(FailureRecord {
        seq: row.get(0)?,
        task_id: row.get(1)?,
        cycle: row.get(2)?,
        strategy: row.get(3)?,
        signature: row.get(4)?,
        raw_error: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}
