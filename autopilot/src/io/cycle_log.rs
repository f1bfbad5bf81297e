//! Cycle records under `.autopilot/cycles/<run_id>/<n>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::trigger::Trigger;
use crate::core::types::{Mode, Timestamp};

/// What one cycle did, for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub run_id: String,
    pub cycle: u64,
    pub trigger: Trigger,
    pub mode_before: Mode,
    pub mode_after: Mode,
    /// One-line description of the mode action.
    pub action: String,
    pub task_id: Option<String>,
    pub decision_turns: u32,
    pub started_at: Timestamp,
    pub duration_ms: u64,
    pub error: Option<String>,
}

pub fn cycle_record_path(cycles_dir: &Path, run_id: &str, cycle: u64) -> PathBuf {
    cycles_dir.join(run_id).join(format!("{cycle}.json"))
}

pub fn write_cycle_record(cycles_dir: &Path, record: &CycleRecord) -> Result<PathBuf> {
    let path = cycle_record_path(cycles_dir, &record.run_id, record.cycle);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("create cycle dir {}", dir.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(record).context("serialize cycle record")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
