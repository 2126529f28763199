//! Ledger configuration stored at `<root>/.taskledger.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::RetryPolicy;

/// Ledger configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    /// A retry counter above this forces `ROLLBACK`.
    pub max_retries: u32,

    /// Identical failure signatures within the window that force `ROLLBACK`.
    pub identical_failure_threshold: u32,

    /// Most recent failures (per task cycle) inspected for repetition.
    pub failure_window: u32,

    /// Failure records kept per task; older ones are pruned.
    pub failure_retention_per_task: u32,

    /// Failure records included in a resume package.
    pub resume_failure_limit: u32,

    /// How long a write waits for another process holding the store.
    pub busy_timeout_ms: u64,

    /// Lineage for tasks created without an explicit one.
    pub default_lineage: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            identical_failure_threshold: policy.identical_failure_threshold,
            failure_window: policy.failure_window,
            failure_retention_per_task: 200,
            resume_failure_limit: 20,
            busy_timeout_ms: 5_000,
            default_lineage: "main".to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.identical_failure_threshold == 0 {
            return Err(anyhow!("identical_failure_threshold must be > 0"));
        }
        if self.failure_window < self.identical_failure_threshold {
            return Err(anyhow!(
                "failure_window ({}) must be >= identical_failure_threshold ({})",
                self.failure_window,
                self.identical_failure_threshold
            ));
        }
        if self.failure_retention_per_task < self.failure_window {
            return Err(anyhow!(
                "failure_retention_per_task ({}) must be >= failure_window ({})",
                self.failure_retention_per_task,
                self.failure_window
            ));
        }
        if self.resume_failure_limit == 0 {
            return Err(anyhow!("resume_failure_limit must be > 0"));
        }
        if self.default_lineage.trim().is_empty() {
            return Err(anyhow!("default_lineage must not be empty"));
        }
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            identical_failure_threshold: self.identical_failure_threshold,
            failure_window: self.failure_window,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LedgerConfig::default()`.
pub fn load_config(path: &Path) -> Result<LedgerConfig> {
    if !path.exists() {
        let cfg = LedgerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LedgerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LedgerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LedgerConfig::default());
        assert_eq!(cfg.policy(), RetryPolicy::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".taskledger.toml");
        let cfg = LedgerConfig {
            max_retries: 5,
            default_lineage: "release".to_string(),
            ..LedgerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".taskledger.toml");
        fs::write(&path, "max_retries = 1\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.failure_window, 10);
    }

    #[test]
    fn window_smaller_than_threshold_is_rejected() {
        let cfg = LedgerConfig {
            identical_failure_threshold: 4,
            failure_window: 3,
            ..LedgerConfig::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("failure_window"));
    }

    #[test]
    fn retention_below_window_is_rejected() {
        let cfg = LedgerConfig {
            failure_retention_per_task: 5,
            ..LedgerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
