//! Command-line front end for the task ledger.
//!
//! Stores state in `<root>/.taskledger.db` and reads `<root>/.taskledger.toml`.
//! Every command except `handover` prints a JSON envelope on stdout.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use ledger::core::types::{NewTask, TaskState, ToolOutcome};
use ledger::envelope::{Envelope, observations};
use ledger::error::{LedgerError, LedgerResult};
use ledger::exit_codes;
use ledger::io::init::{InitOptions, detect_project_root, init_ledger};
use ledger::io::payload::parse_payload_str;
use ledger::logging;
use ledger::ops::{Ledger, Operation};
use ledger::resume::{build_resume, render_handover};

#[derive(Parser)]
#[command(
    name = "ledger",
    version,
    about = "Persistent task state machine and failure ledger for agent-driven work"
)]
struct Cli {
    /// Project root. Defaults to the nearest ancestor holding a store, `.git`,
    /// `Cargo.toml` or `pyproject.toml`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.taskledger.toml` (if missing) and create the store.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a task in PLANNING and make it the active task.
    Create {
        #[arg(long)]
        goal: String,
        #[arg(long, default_value = "")]
        constraints: String,
        /// Path the agent must not modify (repeatable).
        #[arg(long = "protect")]
        protected_paths: Vec<String>,
        /// Explicit task id (`[A-Za-z0-9._-]`).
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        lineage: Option<String>,
        /// Deactivate the current active task instead of failing.
        #[arg(long)]
        supersede: bool,
        /// Seed the first snapshot from the lineage's canonical state.
        #[arg(long)]
        seed: bool,
    },
    /// Show the active task.
    Active,
    /// Show the most recent snapshot and the active task.
    LastState,
    /// Show the canonical state of a task's lineage.
    Canonical {
        #[arg(long)]
        task: Option<String>,
    },
    /// Show a task with its policy decision and history.
    State {
        #[arg(long)]
        task: Option<String>,
    },
    /// List every task.
    List,
    /// Move a task along an edge of the state graph.
    Transition {
        #[arg(long)]
        to: TaskState,
        /// State the caller last observed; the transition fails if it changed.
        #[arg(long)]
        from: TaskState,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Record a failed step and move the task to FAILED_RETRY (or ROLLBACK).
    Fail {
        #[arg(long)]
        error: String,
        #[arg(long, default_value = "")]
        strategy: String,
        #[arg(long)]
        task: Option<String>,
    },
    /// Remember a failed strategy without changing state.
    RecordFailure {
        #[arg(long)]
        error: String,
        #[arg(long, default_value = "")]
        strategy: String,
        #[arg(long)]
        task: Option<String>,
    },
    /// Write a context snapshot. The payload JSON is read from `--payload`
    /// or from stdin when `--payload -` is given.
    Snapshot {
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value = "")]
        payload: String,
    },
    /// Show a task with its latest snapshot and recent failures.
    Resume {
        #[arg(long)]
        task: Option<String>,
    },
    /// Print the Markdown handover for a task (or the full package with `--json`).
    Handover {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Count one tool invocation.
    Usage {
        #[arg(long)]
        tool: String,
        #[arg(long)]
        outcome: ToolOutcome,
        #[arg(long)]
        task: Option<String>,
    },
    /// Summarize tool usage counters.
    UsageReport,
    /// Check stored histories against the state graph.
    Validate {
        #[arg(long)]
        task: Option<String>,
    },
    /// Execute one JSON operation read from stdin, e.g. `{"op": "list_tasks"}`.
    Call,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = match err.downcast_ref::<LedgerError>() {
                Some(ledger_err) if ledger_err.is_retryable() => exit_codes::STORAGE,
                _ => exit_codes::REJECTED,
            };
            std::process::exit(code);
        }
    }
}

/// What to do once the ledger is open.
enum Request {
    Execute(Operation),
    Validate(Option<String>),
    Handover(Option<String>),
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => {
            let cwd = std::env::current_dir().context("read current directory")?;
            detect_project_root(&cwd)
        }
    };

    let request = match cli.command {
        Command::Init { force } => return Ok(init(&root, force)),
        Command::Create {
            goal,
            constraints,
            protected_paths,
            id,
            lineage,
            supersede,
            seed,
        } => Request::Execute(Operation::CreateTask(NewTask {
            goal,
            constraints,
            protected_paths,
            task_id: id,
            lineage,
            supersede,
            seed_from_canonical: seed,
        })),
        Command::Active => Request::Execute(Operation::GetActiveTask),
        Command::LastState => Request::Execute(Operation::GetLastState),
        Command::Canonical { task } => {
            Request::Execute(Operation::GetCanonicalState { task_id: task })
        }
        Command::State { task } => Request::Execute(Operation::GetTaskState { task_id: task }),
        Command::List => Request::Execute(Operation::ListTasks),
        Command::Transition {
            to,
            from,
            task,
            reason,
        } => Request::Execute(Operation::Transition {
            task_id: task,
            to,
            from,
            reason,
        }),
        Command::Fail {
            error,
            strategy,
            task,
        } => Request::Execute(Operation::RecordStepFailure {
            task_id: task,
            strategy,
            raw_error: error,
        }),
        Command::RecordFailure {
            error,
            strategy,
            task,
        } => Request::Execute(Operation::RecordFailure {
            task_id: task,
            strategy,
            raw_error: error,
        }),
        Command::Snapshot { task, payload } => {
            let raw = if payload == "-" {
                read_stdin()
            } else {
                Ok(payload)
            };
            let parsed = raw
                .and_then(|raw| parse_payload_str(&raw))
            .and_then(|p| {
                serde_json::to_value(p).map_err(|err| LedgerError::InvalidInput(err.to_string()))
            });
            match parsed {
                Ok(payload) => Request::Execute(Operation::WriteSnapshot {
                    task_id: task,
                    payload,
                }),
                Err(err) => return Ok(emit(&Envelope::failure(&err))),
            }
        }
        Command::Resume { task } => Request::Execute(Operation::ResumeTask { task_id: task }),
        Command::Handover { task, json: true } => {
            Request::Execute(Operation::GetModelResumePackage { task_id: task })
        }
        Command::Handover { task, json: false } => Request::Handover(task),
        Command::Usage {
            tool,
            outcome,
            task,
        } => Request::Execute(Operation::RecordToolUsage {
            tool,
            outcome,
            task_id: task,
        }),
        Command::UsageReport => Request::Execute(Operation::ToolUsageSummary),
        Command::Validate { task } => Request::Validate(task),
        Command::Call => {
            let parsed = read_stdin().and_then(|raw| {
                serde_json::from_str::<Operation>(&raw)
                    .map_err(|err| LedgerError::InvalidInput(format!("operation: {err}")))
            });
            match parsed {
                Ok(op) => Request::Execute(op),
                Err(err) => return Ok(emit(&Envelope::failure(&err))),
            }
        }
    };

    let ledger = match Ledger::open(&root) {
        Ok(ledger) => ledger,
        Err(err) => return Ok(emit(&Envelope::failure(&startup_failure(err)))),
    };
    Ok(match request {
        Request::Execute(op) => emit(&ledger.execute(op)),
        Request::Validate(task) => {
            let envelope = ledger.execute(Operation::VerifyHistory { task_id: task });
            let code = emit(&envelope);
            let valid = envelope
                .observations
                .get("valid")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if code == exit_codes::OK && !valid {
                exit_codes::REJECTED
            } else {
                code
            }
        }
        Request::Handover(task) => handover(&ledger, task.as_deref())?,
    })
}

fn init(root: &Path, force: bool) -> i32 {
    match init_ledger(root, &InitOptions { force }) {
        Ok(paths) => emit(&Envelope::success(
            observations([
                ("root", json!(paths.root.display().to_string())),
                ("store_path", json!(paths.store_path.display().to_string())),
                ("config_path", json!(paths.config_path.display().to_string())),
            ]),
            "Create a task to start tracking work.",
        )),
        Err(err) => emit(&Envelope::failure(&startup_failure(err))),
    }
}

/// Classify a failure to open the project: store errors stay retryable,
/// anything else (config, paths) is a caller error.
fn startup_failure(err: anyhow::Error) -> LedgerError {
    let message = format!("{err:#}");
    match err.downcast_ref::<LedgerError>() {
        Some(cause) if cause.is_retryable() => LedgerError::Storage(message),
        _ => LedgerError::InvalidInput(message),
    }
}

fn handover(ledger: &Ledger, task_id: Option<&str>) -> Result<i32> {
    match build_resume(ledger.machine(), task_id, ledger.config().resume_failure_limit) {
        Ok(package) => {
            print!("{}", render_handover(&package)?);
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::for_envelope(&Envelope::failure(&err)))
        }
    }
}

/// Print `envelope` as pretty JSON and return its exit code.
fn emit(envelope: &Envelope) -> i32 {
    match serde_json::to_string_pretty(envelope) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("serialize envelope: {err}"),
    }
    exit_codes::for_envelope(envelope)
}

fn read_stdin() -> LedgerResult<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|err| LedgerError::InvalidInput(format!("read stdin: {err}")))?;
    Ok(buf)
}
