//! The orchestrator: owner of the run aggregate and its collaborators.
//!
//! The run lives behind an async mutex that is only held for short critical
//! sections. Every mutation goes through [`Orchestrator::update`], which
//! applies a pure transition and persists the result before releasing the
//! lock. Decision and capability calls happen outside the lock, so operator
//! input is absorbed while a cycle is busy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::run::Run;
use crate::core::types::EventKind;
use crate::io::capabilities::CapabilityRegistry;
use crate::io::config::{AutopilotConfig, load_config};
use crate::io::decision::{
    CommandDecisionEngine, DecisionEngine, DecisionOptions, DecisionOutcome, DecisionRequest,
    decide_with_policy,
};
use crate::io::init::AutopilotPaths;
use crate::io::notifier::Notifier;
use crate::io::plan_doc::PlanDocument;
use crate::io::prompt::PromptBuilder;
use crate::io::run_store::{FileRunStore, RunStore};

/// External collaborators, injectable for tests.
pub struct Services {
    pub store: Arc<dyn RunStore>,
    pub engine: Arc<dyn DecisionEngine>,
    pub capabilities: CapabilityRegistry,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// Default adapters for a workspace: file store, CLI decision engine and
    /// configured capabilities.
    pub fn for_workspace(
        paths: &AutopilotPaths,
        config: &AutopilotConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store: Arc::new(FileRunStore::new(&paths.run_path)),
            engine: Arc::new(CommandDecisionEngine::new(
                config.decision.clone(),
                &paths.root,
                config.output_limit_bytes,
            )),
            capabilities: CapabilityRegistry::from_config(config, &paths.root, &paths.memory_path),
            notifier,
        }
    }
}

pub struct Orchestrator {
    pub(crate) config: AutopilotConfig,
    pub(crate) plan: PlanDocument,
    pub(crate) engine: Arc<dyn DecisionEngine>,
    pub(crate) capabilities: CapabilityRegistry,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) prompts: PromptBuilder,
    cycles_dir: PathBuf,
    store: Arc<dyn RunStore>,
    run: Mutex<Run>,
}

impl Orchestrator {
    /// Load the persisted run (or start a fresh one) and wire collaborators.
    pub fn open(config: AutopilotConfig, paths: &AutopilotPaths, services: Services) -> Result<Self> {
        config.validate()?;
        let run = services
            .store
            .load()
            .context("load run")?
            .with_event_log_cap(config.event_log_cap);
        services.store.save(&run).context("persist run")?;
        debug!(run_id = %run.run_id, mode = %run.mode, "orchestrator opened");
        Ok(Self {
            plan: PlanDocument::new(&paths.plan_path),
            cycles_dir: paths.cycles_dir.clone(),
            engine: services.engine,
            capabilities: services.capabilities,
            notifier: services.notifier,
            prompts: PromptBuilder::default(),
            store: services.store,
            run: Mutex::new(run),
            config,
        })
    }

    /// Open the workspace at `root` with its config and default adapters.
    pub fn open_workspace(root: &Path, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let paths = AutopilotPaths::new(root);
        let config = load_config(&paths.config_path)?;
        let services = Services::for_workspace(&paths, &config, notifier);
        Self::open(config, &paths, services)
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.config
    }

    pub(crate) fn cycles_dir(&self) -> &Path {
        &self.cycles_dir
    }

    /// A copy of the current run.
    pub async fn snapshot(&self) -> Run {
        self.run.lock().await.clone()
    }

    /// Apply `transition` to the run and persist the result.
    ///
    /// The in-memory run always advances; a failed save is returned as an
    /// error for the caller to record.
    pub(crate) async fn update<F>(&self, transition: F) -> Result<Run>
    where
        F: FnOnce(Run) -> Run,
    {
        let (snapshot, saved) = self.apply(transition).await;
        saved?;
        Ok(snapshot)
    }

    /// [`update`](Self::update) that records persistence failures in `errors`
    /// instead of returning them; used where the cycle must keep going.
    pub(crate) async fn update_logged<F>(&self, transition: F, errors: &mut Vec<String>) -> Run
    where
        F: FnOnce(Run) -> Run,
    {
        let (snapshot, saved) = self.apply(transition).await;
        if let Err(err) = saved {
            let err = format!("{err:#}");
            error!(err = %err, "failed to persist run");
            errors.push(err);
        }
        snapshot
    }

    /// Saves while holding the lock so writes land in mutation order.
    async fn apply<F>(&self, transition: F) -> (Run, Result<()>)
    where
        F: FnOnce(Run) -> Run,
    {
        let mut guard = self.run.lock().await;
        let next = transition(guard.clone());
        let saved = self.store.save(&next).context("persist run");
        *guard = next.clone();
        (next, saved)
    }

    /// Default options for full decision requests.
    pub(crate) fn decision_options(&self) -> DecisionOptions {
        DecisionOptions::from_config(&self.config.decision)
    }

    /// Ask the decision engine, recording turns and a decision event.
    pub(crate) async fn decide(
        &self,
        purpose: &'static str,
        prompt: String,
        options: DecisionOptions,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> DecisionOutcome {
        let request = DecisionRequest {
            purpose,
            prompt,
            options,
        };
        let outcome = decide_with_policy(
            self.engine.as_ref(),
            &request,
            &self.config.decision.fallback_text,
            cancel,
        )
        .await;

        let message = if outcome.aborted {
            format!("{purpose}: aborted by operator")
        } else if outcome.fallback {
            format!("{purpose}: no usable reply; fell back")
        } else {
            format!("{purpose}: answered in {} turn(s)", outcome.turns)
        };
        let turns = outcome.turns;
        self.update_logged(
            |run| {
                run.with_decision_turns(turns)
                    .with_event(Utc::now(), EventKind::Decision, message)
            },
            errors,
        )
        .await;
        outcome
    }

    pub(crate) async fn notify(&self, text: &str) {
        self.notifier.notify(text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Mode, Thesis};
    use crate::test_support::{
        MemoryRunStore, RecordingNotifier, ScriptedDecisionEngine, ScriptedReply, at,
    };

    fn open_with(store: Arc<MemoryRunStore>, engine: Arc<ScriptedDecisionEngine>) -> Orchestrator {
        let mut config = AutopilotConfig::default();
        config.event_log_cap = 3;
        config.decision.retries = 0;
        let services = Services {
            store,
            engine,
            capabilities: CapabilityRegistry::new(),
            notifier: Arc::new(RecordingNotifier::default()),
        };
        Orchestrator::open(config, &AutopilotPaths::new("/nonexistent"), services).expect("open")
    }

    #[tokio::test]
    async fn open_applies_event_cap_and_persists() {
        let mut run = Run::new("run-1", at(0));
        for n in 0..5 {
            run = run.with_event(at(n), EventKind::Status, format!("event {n}"));
        }
        let store = Arc::new(MemoryRunStore::with_run(run));
        let orchestrator = open_with(store.clone(), Arc::new(ScriptedDecisionEngine::default()));

        let snapshot = orchestrator.snapshot().await;
        let messages: Vec<&str> = snapshot.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.saved(), Some(snapshot));
    }

    #[tokio::test]
    async fn update_persists_every_mutation() {
        let store = Arc::new(MemoryRunStore::default());
        let orchestrator = open_with(store.clone(), Arc::new(ScriptedDecisionEngine::default()));

        let run = orchestrator
            .update(|run| {
                run.with_thesis(Thesis {
                    objective: "ship".to_string(),
                    rationale: String::new(),
                    success_signal: None,
                    created_at: at(1),
                })
            })
            .await
            .expect("update");

        assert_eq!(store.save_count(), 2);
        assert_eq!(store.saved().and_then(|r| r.thesis), run.thesis);
        assert_eq!(run.mode, Mode::Discovery);
    }

    #[tokio::test]
    async fn decide_records_turns_and_event() {
        let store = Arc::new(MemoryRunStore::default());
        let engine = Arc::new(ScriptedDecisionEngine::new(vec![ScriptedReply::Text {
            text: "OBJECTIVE: ship".to_string(),
            turns: 3,
        }]));
        let orchestrator = open_with(store, engine);
        let mut errors = Vec::new();

        let outcome = orchestrator
            .decide(
                "discovery",
                "prompt".to_string(),
                orchestrator.decision_options(),
                &CancellationToken::new(),
                &mut errors,
            )
            .await;

        assert!(outcome.is_answer());
        assert!(errors.is_empty());
        let run = orchestrator.snapshot().await;
        assert_eq!(run.total_decision_turns, 3);
        assert_eq!(
            run.events.back().map(|e| e.message.as_str()),
            Some("discovery: answered in 3 turn(s)")
        );
    }

    #[tokio::test]
    async fn decide_fallback_is_recorded() {
        let orchestrator = open_with(
            Arc::new(MemoryRunStore::default()),
            Arc::new(ScriptedDecisionEngine::default()),
        );
        let mut errors = Vec::new();

        let outcome = orchestrator
            .decide(
                "planning",
                "prompt".to_string(),
                orchestrator.decision_options(),
                &CancellationToken::new(),
                &mut errors,
            )
            .await;

        assert!(outcome.fallback);
        assert_eq!(outcome.text, orchestrator.config().decision.fallback_text);
        let run = orchestrator.snapshot().await;
        assert_eq!(
            run.events.back().map(|e| e.message.as_str()),
            Some("planning: no usable reply; fell back")
        );
    }
}
