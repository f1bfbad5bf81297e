//! Autopilot configuration stored under `.autopilot/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{ExecutionPath, is_slug};
use crate::io::atomic::write_atomic;

/// Autopilot configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Seconds between interval-triggered cycles while the loop runs.
    pub interval_secs: u64,

    /// Number of events kept in the run's event log.
    pub event_log_cap: usize,

    /// Send a status notification every N cycles (0 disables).
    pub status_every_cycles: u64,

    /// Truncate decision and capability output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub decision: DecisionConfig,

    pub capabilities: BTreeMap<String, CapabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecisionConfig {
    /// Decision CLI; the prompt is written to its stdin.
    pub command: Vec<String>,

    pub timeout_secs: u64,

    /// Extra attempts after a failed or empty reply.
    pub retries: u32,

    pub max_turns: u32,

    /// Appended to `command` for lightweight requests (task choice).
    pub lightweight_args: Vec<String>,

    /// Flag carrying the turn limit; empty to omit.
    pub max_turns_flag: String,

    /// Flag carrying a session id to continue; empty to omit.
    pub resume_flag: String,

    /// Returned when every attempt failed.
    pub fallback_text: String,
}

/// How a command capability receives the task text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityInput {
    #[default]
    Stdin,
    /// Appended as the final argument.
    Arg,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CapabilityConfig {
    pub command: Vec<String>,
    pub input: CapabilityInput,
    /// Working directory, relative to the workspace root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Tasks on this path wait for operator approval before running.
    pub requires_approval: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input: CapabilityInput::Stdin,
            cwd: None,
            timeout_secs: 10 * 60,
            requires_approval: false,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--output-format", "json"]
                .map(String::from)
                .to_vec(),
            timeout_secs: 10 * 60,
            retries: 2,
            max_turns: 30,
            lightweight_args: ["--model", "haiku"].map(String::from).to_vec(),
            max_turns_flag: "--max-turns".to_string(),
            resume_flag: "--resume".to_string(),
            fallback_text: "No decision available; will retry next cycle.".to_string(),
        }
    }
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            "shell".to_string(),
            CapabilityConfig {
                command: vec!["sh".to_string(), "-c".to_string()],
                input: CapabilityInput::Arg,
                ..CapabilityConfig::default()
            },
        );
        Self {
            interval_secs: 5 * 60,
            event_log_cap: 200,
            status_every_cycles: 10,
            output_limit_bytes: 100_000,
            decision: DecisionConfig::default(),
            capabilities,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(anyhow!("interval_secs must be > 0"));
        }
        if self.event_log_cap == 0 {
            return Err(anyhow!("event_log_cap must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.decision.timeout_secs == 0 {
            return Err(anyhow!("decision.timeout_secs must be > 0"));
        }
        if !has_program(&self.decision.command) {
            return Err(anyhow!("decision.command must be a non-empty array"));
        }
        for (name, cap) in &self.capabilities {
            if !is_slug(name) || name == ExecutionPath::AGENT_TOKEN {
                return Err(anyhow!(
                    "capabilities.{name}: name must match [a-z0-9-]+ and not be \"agent\""
                ));
            }
            if !has_program(&cap.command) {
                return Err(anyhow!(
                    "capabilities.{name}.command must be a non-empty array"
                ));
            }
            if cap.timeout_secs == 0 {
                return Err(anyhow!("capabilities.{name}.timeout_secs must be > 0"));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Whether tasks routed to `path` wait for operator approval.
    pub fn requires_approval(&self, path: &ExecutionPath) -> bool {
        match path {
            ExecutionPath::Agent => false,
            ExecutionPath::Capability(name) => self
                .capabilities
                .get(name)
                .is_some_and(|cap| cap.requires_approval),
        }
    }
}

fn has_program(command: &[String]) -> bool {
    command.first().is_some_and(|c| !c.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
