//! Test-only fakes and fixtures.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::core::run::Run;
use crate::core::types::{ExecutionPath, Task, TaskStatus, Thesis, Timestamp};
use crate::io::capabilities::{Capability, CapabilityRegistry, CapabilityRequest, Readiness};
use crate::io::config::{AutopilotConfig, write_config};
use crate::io::decision::{DecisionEngine, DecisionReply, DecisionRequest};
use crate::io::init::{AutopilotPaths, InitOptions, init_workspace};
use crate::io::notifier::Notifier;
use crate::io::run_store::{FileRunStore, RunStore};
use crate::orchestrator::{Orchestrator, Services};

/// Fixed timestamp `secs` after a deterministic epoch.
pub fn at(secs: i64) -> Timestamp {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .unwrap_or_default()
}

pub fn thesis(objective: &str) -> Thesis {
    Thesis {
        objective: objective.to_string(),
        rationale: String::new(),
        success_signal: None,
        created_at: at(0),
    }
}

pub fn task(id: &str, path: ExecutionPath, priority: u32, status: TaskStatus) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: String::new(),
        path,
        priority,
        status,
        output: None,
        updated_at: at(0),
    }
}

/// One scripted answer from [`ScriptedDecisionEngine`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text { text: String, turns: u32 },
    /// Answer that reports a backend session id.
    InSession { text: String, session: String },
    Error(String),
    /// Never answers; waits until the call is cancelled.
    Hang,
}

impl ScriptedReply {
    pub fn text(text: &str) -> Self {
        ScriptedReply::Text {
            text: text.to_string(),
            turns: 1,
        }
    }

    pub fn in_session(text: &str, session: &str) -> Self {
        ScriptedReply::InSession {
            text: text.to_string(),
            session: session.to_string(),
        }
    }

    pub fn error(message: &str) -> Self {
        ScriptedReply::Error(message.to_string())
    }
}

/// A request as seen by a scripted engine.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub purpose: &'static str,
    pub prompt: String,
    pub lightweight: bool,
    pub continue_session: Option<String>,
}

/// Decision engine that replays a fixed script, then errors.
#[derive(Debug, Default)]
pub struct ScriptedDecisionEngine {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedDecisionEngine {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn purposes(&self) -> Vec<&'static str> {
        self.calls().iter().map(|c| c.purpose).collect()
    }
}

#[async_trait]
impl DecisionEngine for ScriptedDecisionEngine {
    async fn decide(
        &self,
        request: &DecisionRequest,
        cancel: &CancellationToken,
    ) -> Result<DecisionReply> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(ScriptedCall {
                purpose: request.purpose,
                prompt: request.prompt.clone(),
                lightweight: request.options.lightweight,
                continue_session: request.options.continue_session.clone(),
            });
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(ScriptedReply::Text { text, turns }) => Ok(DecisionReply {
                text,
                turns,
                session_id: None,
            }),
            Some(ScriptedReply::InSession { text, session }) => Ok(DecisionReply {
                text,
                turns: 1,
                session_id: Some(session),
            }),
            Some(ScriptedReply::Error(message)) => Err(anyhow!(message)),
            Some(ScriptedReply::Hang) => {
                cancel.cancelled().await;
                Err(anyhow!("cancelled"))
            }
            None => Err(anyhow!("decision script exhausted")),
        }
    }
}

/// Capability with a fixed readiness and scripted results.
pub struct ScriptedCapability {
    name: String,
    readiness: Readiness,
    results: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CapabilityRequest>>,
}

impl ScriptedCapability {
    pub fn new(name: &str, results: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            readiness: Readiness::Ready,
            results: Mutex::new(results.into_iter().map(str::to_string).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(name: &str, detail: &str) -> Self {
        Self {
            readiness: Readiness::Unavailable(detail.to_string()),
            ..Self::new(name, Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    async fn invoke(&self, request: &CapabilityRequest, _cancel: &CancellationToken) -> String {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        self.results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| format!("{} finished", self.name))
    }
}

/// In-memory [`RunStore`] that counts saves.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    run: Mutex<Option<Run>>,
    saves: Mutex<usize>,
}

impl MemoryRunStore {
    pub fn with_run(run: Run) -> Self {
        Self {
            run: Mutex::new(Some(run)),
            saves: Mutex::new(0),
        }
    }

    pub fn saved(&self) -> Option<Run> {
        self.run.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl RunStore for MemoryRunStore {
    fn load(&self) -> Result<Run> {
        Ok(self
            .saved()
            .unwrap_or_else(|| Run::new("run-test", Utc::now())))
    }

    fn save(&self, run: &Run) -> Result<()> {
        *self.run.lock().unwrap_or_else(|p| p.into_inner()) = Some(run.clone());
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}

/// Notifier that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(text.to_string());
    }
}

/// Temporary initialized workspace plus scripted collaborators.
pub struct TestWorkspace {
    temp: TempDir,
    pub paths: AutopilotPaths,
    pub config: AutopilotConfig,
    pub engine: Arc<ScriptedDecisionEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub capabilities: CapabilityRegistry,
}

impl TestWorkspace {
    /// Initialized workspace with no retries so fallbacks are immediate.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let paths = init_workspace(temp.path(), &InitOptions::default())?;
        let mut config = AutopilotConfig::default();
        config.decision.retries = 0;
        config.capabilities.clear();
        write_config(&paths.config_path, &config)?;
        Ok(Self {
            temp,
            paths,
            config,
            engine: Arc::new(ScriptedDecisionEngine::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            capabilities: CapabilityRegistry::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities = self.capabilities.with(capability);
        self
    }

    pub fn script(&self, replies: Vec<ScriptedReply>) {
        for reply in replies {
            self.engine.push(reply);
        }
    }

    pub fn write_plan(&self, contents: &str) -> Result<()> {
        fs::write(&self.paths.plan_path, contents)
            .with_context(|| format!("write {}", self.paths.plan_path.display()))
    }

    pub fn read_plan(&self) -> Result<String> {
        fs::read_to_string(&self.paths.plan_path)
            .with_context(|| format!("read {}", self.paths.plan_path.display()))
    }

    /// Persist `run` as the workspace's run record.
    pub fn seed_run(&self, run: &Run) -> Result<()> {
        FileRunStore::new(&self.paths.run_path).save(run)
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let services = Services {
            store: Arc::new(FileRunStore::new(&self.paths.run_path)),
            engine: self.engine.clone(),
            capabilities: self.capabilities.clone(),
            notifier: self.notifier.clone(),
        };
        Orchestrator::open(self.config.clone(), &self.paths, services)
    }
}
