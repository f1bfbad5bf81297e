//! Named capabilities: direct execution paths for plan tasks.
//!
//! A task whose path is not `agent` is routed to the capability of that name.
//! Capabilities never fail the cycle; every outcome (including "not
//! configured") comes back as a short result string that the router
//! classifies.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::io::config::{AutopilotConfig, CapabilityConfig, CapabilityInput};
use crate::io::process::run_command;

/// Longest result string kept from a capability.
const RESULT_LIMIT_CHARS: usize = 500;

pub const MEMORY_CAPABILITY: &str = "memory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Cannot run as configured (missing program, bad cwd, ...).
    Unavailable(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// The task handed to a capability.
#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub task_id: String,
    pub title: String,
    pub description: String,
}

impl CapabilityRequest {
    /// Text given to the capability: the description, or the title if empty.
    pub fn input_text(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.title
        } else {
            &self.description
        }
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    async fn readiness(&self) -> Readiness;
    async fn invoke(&self, request: &CapabilityRequest, cancel: &CancellationToken) -> String;
}

/// Result text for a path with no usable capability.
pub fn skipped_result(name: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("skipped: {name} capability unconfigured ({detail})"),
        None => format!("skipped: {name} capability not configured"),
    }
}

#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in `memory` plus one command capability per config entry.
    pub fn from_config(cfg: &AutopilotConfig, root: &Path, memory_path: &Path) -> Self {
        let mut registry =
            Self::new().with(Arc::new(MemoryCapability::new(memory_path.to_path_buf())));
        for (name, cap) in &cfg.capabilities {
            registry = registry.with(Arc::new(CommandCapability::new(
                name.clone(),
                cap.clone(),
                root.to_path_buf(),
                cfg.output_limit_bytes,
            )));
        }
        registry
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.entries
            .insert(capability.name().to_string(), capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Runs a configured program for each task.
pub struct CommandCapability {
    name: String,
    config: CapabilityConfig,
    root: PathBuf,
    output_limit_bytes: usize,
}

impl CommandCapability {
    pub fn new(
        name: String,
        config: CapabilityConfig,
        root: PathBuf,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            name,
            config,
            root,
            output_limit_bytes,
        }
    }

    fn workdir(&self) -> PathBuf {
        match &self.config.cwd {
            Some(cwd) => self.root.join(cwd),
            None => self.root.clone(),
        }
    }

    fn build(&self, request: &CapabilityRequest) -> Option<(Command, Option<Vec<u8>>)> {
        let (program, args) = self.config.command.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(self.workdir());
        let stdin = match self.config.input {
            CapabilityInput::Stdin => Some(request.input_text().as_bytes().to_vec()),
            CapabilityInput::Arg => {
                cmd.arg(request.input_text());
                None
            }
            CapabilityInput::None => None,
        };
        cmd.env("AUTOPILOT_TASK_ID", &request.task_id);
        Some((cmd, stdin))
    }
}

#[async_trait]
impl Capability for CommandCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn readiness(&self) -> Readiness {
        let Some(program) = self.config.command.first() else {
            return Readiness::Unavailable("empty command".to_string());
        };
        if !self.workdir().is_dir() {
            return Readiness::Unavailable(format!(
                "working directory {} missing",
                self.workdir().display()
            ));
        }
        if !program_exists(program, &self.root) {
            return Readiness::Unavailable(format!("program `{program}` not found"));
        }
        Readiness::Ready
    }

    #[instrument(skip_all, fields(capability = %self.name, task_id = %request.task_id))]
    async fn invoke(&self, request: &CapabilityRequest, cancel: &CancellationToken) -> String {
        let Some((cmd, stdin)) = self.build(request) else {
            return skipped_result(&self.name, Some("empty command"));
        };
        let output = match run_command(
            cmd,
            stdin.as_deref(),
            Duration::from_secs(self.config.timeout_secs),
            self.output_limit_bytes,
            cancel,
        )
        .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "capability command could not run");
                return format!("{} error: {err:#}", self.name);
            }
        };

        if !output.success() {
            return output.failure_summary(&self.name);
        }
        let stdout = output.stdout_text();
        let text = stdout.trim();
        debug!(bytes = text.len(), "capability finished");
        if text.is_empty() {
            format!("{} finished", self.name)
        } else {
            shorten(text, RESULT_LIMIT_CHARS)
        }
    }
}

fn program_exists(program: &str, root: &Path) -> bool {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };
        return resolved.is_file();
    }
    env::var_os("PATH")
        .is_some_and(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
}

#[derive(Serialize)]
struct MemoryRecord<'a> {
    at: String,
    tag: &'a str,
    text: &'a str,
}

/// Appends `memory(text, tag)` records as JSON lines.
pub struct MemoryCapability {
    path: PathBuf,
}

impl MemoryCapability {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn append(&self, tag: &str, text: &str) -> Result<()> {
        let record = MemoryRecord {
            at: Utc::now().to_rfc3339(),
            tag,
            text,
        };
        let mut line = serde_json::to_string(&record).context("serialize memory record")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Capability for MemoryCapability {
    fn name(&self) -> &str {
        MEMORY_CAPABILITY
    }

    async fn readiness(&self) -> Readiness {
        Readiness::Ready
    }

    async fn invoke(&self, request: &CapabilityRequest, _cancel: &CancellationToken) -> String {
        let text = request.input_text();
        match self.append(&request.task_id, text).await {
            Ok(()) => format!("stored memory: {}", shorten(text, 80)),
            Err(err) => {
                warn!(err = %err, "memory write failed");
                format!("memory write failed: {err:#}")
            }
        }
    }
}

fn shorten(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{ResultClass, classify_result};

    fn request(description: &str) -> CapabilityRequest {
        CapabilityRequest {
            task_id: "t-1".to_string(),
            title: "Title".to_string(),
            description: description.to_string(),
        }
    }

    #[tokio::test]
    async fn memory_appends_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("memory.jsonl");
        let memory = MemoryCapability::new(path.clone());
        let cancel = CancellationToken::new();

        let first = memory.invoke(&request("remember the launch date"), &cancel).await;
        memory.invoke(&request(""), &cancel).await;

        assert_eq!(first, "stored memory: remember the launch date");
        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tag"], "t-1");
        assert_eq!(lines[1]["text"], "Title");
    }

    #[test]
    fn skipped_result_classifies_as_failure() {
        assert_eq!(
            classify_result(&skipped_result("deploy", None)),
            ResultClass::Failure
        );
    }

    #[test]
    fn registry_includes_memory_and_configured_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = AutopilotConfig::default();
        let registry = CapabilityRegistry::from_config(&cfg, temp.path(), &temp.path().join("m"));
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["memory", "shell"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_capability_passes_description_as_arg() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cap = CommandCapability::new(
            "shell".to_string(),
            CapabilityConfig {
                command: vec!["sh".to_string(), "-c".to_string()],
                input: CapabilityInput::Arg,
                ..CapabilityConfig::default()
            },
            temp.path().to_path_buf(),
            1024,
        );
        assert_eq!(cap.readiness().await, Readiness::Ready);
        let out = cap
            .invoke(&request("echo published"), &CancellationToken::new())
            .await;
        assert_eq!(out, "published");

        let failed = cap
            .invoke(&request("echo nope >&2; exit 2"), &CancellationToken::new())
            .await;
        assert_eq!(failed, "shell failed (exit 2): nope");
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cap = CommandCapability::new(
            "deploy".to_string(),
            CapabilityConfig {
                command: vec!["definitely-not-a-real-program-xyz".to_string()],
                ..CapabilityConfig::default()
            },
            temp.path().to_path_buf(),
            1024,
        );
        assert!(!cap.readiness().await.is_ready());
    }
}
