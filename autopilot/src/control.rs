//! Operator control surface: loop start/stop, manual cycles, inbound
//! messages and approval resolution.
//!
//! Every call here is thin. Run mutations go through the orchestrator and
//! cycle execution goes through the scheduler, so calls are safe to make
//! while a cycle is in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::core::intent::{Intent, classify_message};
use crate::core::mode::transition;
use crate::core::status::describe;
use crate::core::trigger::Trigger;
use crate::core::types::{ApprovalStatus, EventKind, Mode, OperatorCommand, TaskStatus};
use crate::looping::Ticker;
use crate::orchestrator::Orchestrator;
use crate::scheduler::{CycleRunner, ScheduleOutcome, Scheduler};

/// Output recorded on a task whose approval was rejected.
pub const REJECTED_OUTPUT: &str = "rejected by operator";

/// Result of ingesting one operator message.
#[derive(Debug)]
pub struct Ingested {
    pub intent: Intent,
    /// Immediate reply for the operator.
    pub reply: String,
    /// The cycle this message requested, if any.
    pub cycle: Option<JoinHandle<ScheduleOutcome>>,
}

pub struct Controller {
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    ticker: Mutex<Option<Ticker>>,
}

impl Controller {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let runner: Arc<dyn CycleRunner> = orchestrator.clone();
        Self {
            scheduler: Arc::new(Scheduler::new(runner)),
            orchestrator,
            ticker: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn ticker(&self) -> MutexGuard<'_, Option<Ticker>> {
        self.ticker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_ticker(&self) {
        let mut ticker = self.ticker();
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let period = self.orchestrator.config().interval();
        *ticker = Some(Ticker::spawn(Arc::clone(&self.scheduler), period));
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker().take() {
            ticker.stop();
        }
    }

    fn spawn_cycle(&self, trigger: Trigger) -> JoinHandle<ScheduleOutcome> {
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(async move { scheduler.request(trigger).await })
    }

    async fn set_running(&self, running: bool) -> Result<()> {
        self.orchestrator
            .update(|run| run.with_running(running))
            .await?;
        Ok(())
    }

    /// Mark the run as running, start the ticker and request a startup cycle.
    #[instrument(skip_all)]
    pub async fn start_loop(&self) -> Result<JoinHandle<ScheduleOutcome>> {
        self.set_running(true).await?;
        self.start_ticker();
        info!("loop started");
        Ok(self.spawn_cycle(Trigger::Startup))
    }

    /// Stop the ticker and clear the running flag. An in-flight cycle finishes.
    #[instrument(skip_all)]
    pub async fn stop_loop(&self) -> Result<()> {
        self.stop_ticker();
        self.set_running(false).await?;
        info!("loop stopped");
        Ok(())
    }

    /// Run one cycle now (or fold into the active one) and wait for it.
    pub async fn run_cycle_now(&self) -> ScheduleOutcome {
        self.scheduler.request(Trigger::Manual).await
    }

    /// Queue a directive for the next cycle without classifying it.
    pub async fn enqueue_command(
        &self,
        text: &str,
        attachments: Vec<String>,
    ) -> Result<OperatorCommand> {
        let command = OperatorCommand {
            id: format!("cmd-{}", &Uuid::new_v4().simple().to_string()[..8]),
            text: text.trim().to_string(),
            attachments,
            received_at: Utc::now(),
        };
        let queued = command.clone();
        self.orchestrator
            .update(|run| run.with_command(queued))
            .await?;
        debug!(command_id = %command.id, "operator command queued");
        Ok(command)
    }

    /// Classify and act on a free-text operator message.
    #[instrument(skip_all)]
    pub async fn ingest_message(&self, text: &str, attachments: Vec<String>) -> Result<Ingested> {
        let intent = classify_message(text);
        info!(?intent, "operator message");
        let (reply, cycle) = match &intent {
            Intent::Pause => {
                self.stop_loop().await?;
                ("Paused. Send \"resume\" to continue.".to_string(), None)
            }
            Intent::Resume { remainder } => {
                self.set_running(true).await?;
                self.start_ticker();
                let reply = match remainder {
                    Some(remainder) => {
                        self.enqueue_command(remainder, attachments).await?;
                        format!("Resumed. Follow-up noted: {remainder}")
                    }
                    None => "Resumed.".to_string(),
                };
                (reply, Some(self.spawn_cycle(Trigger::Manual)))
            }
            Intent::Empty => ("Empty message ignored.".to_string(), None),
            Intent::Question => (describe(&self.orchestrator.snapshot().await), None),
            Intent::Directive => {
                self.enqueue_command(text, attachments).await?;
                if self.orchestrator.snapshot().await.is_running {
                    self.scheduler.cancel_inflight();
                    (
                        "Got it. Interrupting the current step to take this into account."
                            .to_string(),
                        Some(self.spawn_cycle(Trigger::Interrupt)),
                    )
                } else {
                    ("Got it. This will shape the next cycle.".to_string(), None)
                }
            }
        };
        Ok(Ingested {
            intent,
            reply,
            cycle,
        })
    }

    /// Approve or reject the pending approval.
    #[instrument(skip(self))]
    pub async fn resolve_approval(&self, approved: bool) -> Result<String> {
        let run = self.orchestrator.snapshot().await;
        let Some(approval) = run.pending_approval().cloned() else {
            bail!("no approval is pending");
        };

        let reply = if approved {
            self.orchestrator
                .update(|run| {
                    let now = Utc::now();
                    let mut resolved = approval.clone();
                    resolved.status = ApprovalStatus::Approved;
                    resolved.resolved_at = Some(now);
                    let kind = EventKind::Approval {
                        task_id: approval.task_id.clone(),
                        status: ApprovalStatus::Approved,
                    };
                    let run = run.with_approval(Some(resolved)).with_event(
                        now,
                        kind,
                        format!("approved: {}", approval.action),
                    );
                    transition(run, Mode::Building, now, "approved by operator")
                })
                .await?;
            format!("Approved: {}", approval.action)
        } else {
            self.orchestrator
                .update(|run| {
                    let now = Utc::now();
                    let kind = EventKind::Approval {
                        task_id: approval.task_id.clone(),
                        status: ApprovalStatus::Rejected,
                    };
                    let run = run
                        .with_approval(None)
                        .with_task_status(
                            &approval.task_id,
                            TaskStatus::Failed,
                            Some(REJECTED_OUTPUT.to_string()),
                            now,
                        )
                        .with_event(now, kind, format!("rejected: {}", approval.action));
                    transition(run, Mode::Planning, now, "rejected by operator")
                })
                .await?;
            format!("Rejected: {}", approval.action)
        };
        info!(task_id = %approval.task_id, approved, "approval resolved");
        Ok(reply)
    }

    pub async fn status(&self) -> String {
        describe(&self.orchestrator.snapshot().await)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
