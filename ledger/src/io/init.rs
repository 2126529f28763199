//! Project layout: well-known file names and project root detection.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::debug;

use super::config::{LedgerConfig, write_config};
use super::store::LedgerStore;

pub const STORE_FILE: &str = ".taskledger.db";
pub const CONFIG_FILE: &str = ".taskledger.toml";

/// Markers that identify a project root when walking up from the working directory.
const ROOT_MARKERS: [&str; 3] = [".git", "Cargo.toml", "pyproject.toml"];

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct LedgerPaths {
    pub root: PathBuf,
    pub store_path: PathBuf,
    pub config_path: PathBuf,
}

impl LedgerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store_path: root.join(STORE_FILE),
            config_path: root.join(CONFIG_FILE),
            root,
        }
    }
}

/// Nearest ancestor of `start` (inclusive) holding an existing store or a
/// project marker; `start` itself when none does.
pub fn detect_project_root(start: &Path) -> PathBuf {
    for dir in start.ancestors() {
        if dir.join(STORE_FILE).is_file() {
            debug!(root = %dir.display(), "found existing store");
            return dir.to_path_buf();
        }
        if ROOT_MARKERS.iter().any(|marker| dir.join(marker).exists()) {
            debug!(root = %dir.display(), "found project marker");
            return dir.to_path_buf();
        }
    }
    start.to_path_buf()
}

/// Options for `init_ledger`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file. The store is never replaced.
    pub force: bool,
}

/// Create the config file (if missing or forced) and the store schema.
pub fn init_ledger(root: &Path, options: &InitOptions) -> Result<LedgerPaths> {
    let paths = LedgerPaths::new(root);
    if !root.is_dir() {
        return Err(anyhow!(
            "ledger init: {} is not a directory",
            root.display()
        ));
    }
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &LedgerConfig::default())?;
    }
    let cfg = super::config::load_config(&paths.config_path)?;
    LedgerStore::open(&paths.store_path, cfg.busy_timeout())?;
    Ok(paths)
}
