//! Workspace layout and `.autopilot/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::config::{AutopilotConfig, write_config};

/// All canonical paths within `.autopilot/` for a workspace root.
#[derive(Debug, Clone)]
pub struct AutopilotPaths {
    pub root: PathBuf,
    pub autopilot_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cycles_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub run_path: PathBuf,
    pub memory_path: PathBuf,
}

impl AutopilotPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let autopilot_dir = root.join(".autopilot");
        let state_dir = autopilot_dir.join("state");
        Self {
            root: root.clone(),
            autopilot_dir: autopilot_dir.clone(),
            state_dir: state_dir.clone(),
            cycles_dir: autopilot_dir.join("cycles"),
            gitignore_path: autopilot_dir.join(".gitignore"),
            config_path: autopilot_dir.join("config.toml"),
            plan_path: autopilot_dir.join("PLAN.md"),
            run_path: state_dir.join("run.json"),
            memory_path: autopilot_dir.join("memory.jsonl"),
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, rewrite config and `.gitignore` even if `.autopilot/` exists.
    pub force: bool,
}

/// Create `.autopilot/` scaffolding in `root`.
///
/// Fails if `.autopilot/` already exists unless `options.force` is set. An
/// existing plan document is never overwritten.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<AutopilotPaths> {
    let paths = AutopilotPaths::new(root);
    if paths.autopilot_dir.exists() && !options.force {
        return Err(anyhow!(
            "autopilot init: .autopilot already exists (use --force to overwrite)"
        ));
    }
    if paths.autopilot_dir.exists() && !paths.autopilot_dir.is_dir() {
        return Err(anyhow!(
            "autopilot init: .autopilot exists but is not a directory"
        ));
    }

    create_dir(&paths.autopilot_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.cycles_dir)?;

    write_file(&paths.gitignore_path, AUTOPILOT_GITIGNORE)?;
    write_config(&paths.config_path, &AutopilotConfig::default())?;
    if !paths.plan_path.exists() {
        write_file(&paths.plan_path, "")?;
    }

    info!(root = %root.display(), "initialized .autopilot workspace");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const AUTOPILOT_GITIGNORE: &str = "state/\ncycles/\n";
