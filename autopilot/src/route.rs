//! The building action: select one task, gate it on approval if required,
//! route it to its execution path and settle the result.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::classifier::{ResultClass, classify_result};
use crate::core::mode::{mode_after_build, transition};
use crate::core::run::Run;
use crate::core::selector::{
    Selection, SelectionSource, candidates, resolve_choice, resume_in_progress,
};
use crate::core::types::{
    Approval, ApprovalStatus, CapabilityHealth, EventKind, ExecutionPath, Mode, Task, TaskStatus,
    Timestamp,
};
use crate::cycle::ActionOutcome;
use crate::io::capabilities::{CapabilityRequest, Readiness, skipped_result};
use crate::io::prompt::{PromptContext, PromptKind};
use crate::orchestrator::Orchestrator;

/// How a routed task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Execution {
    Finished(String),
    /// The operator interrupted the in-flight call.
    Aborted,
}

impl Orchestrator {
    #[instrument(skip_all)]
    pub(crate) async fn build(
        &self,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> ActionOutcome {
        let run = self.snapshot().await;
        let Some(selection) = self.select(&run, cancel, errors).await else {
            self.update_logged(
                |run| transition(run, Mode::Operating, Utc::now(), "no open tasks"),
                errors,
            )
            .await;
            return ActionOutcome::new("no open tasks");
        };

        let run = self
            .update_logged(
                |run| {
                    let message = format!("selected {}: {}", selection.task_id, selection.reason);
                    let status = run
                        .task(&selection.task_id)
                        .map_or(TaskStatus::Pending, |t| t.status);
                    run.with_event(
                        Utc::now(),
                        EventKind::Task {
                            task_id: selection.task_id.clone(),
                            status,
                        },
                        message,
                    )
                },
                errors,
            )
            .await;
        let Some(task) = run.task(&selection.task_id).cloned() else {
            errors.push(format!("selected task {} vanished", selection.task_id));
            return ActionOutcome::new("selected task missing");
        };

        let gated = !matches!(
            selection.source,
            SelectionSource::Approved | SelectionSource::Resumed
        );
        if gated && self.config.requires_approval(&task.path) {
            return self.request_approval(&task, errors).await;
        }

        self.update_logged(
            |run| {
                let run = if selection.source == SelectionSource::Approved {
                    run.with_approval(None)
                } else {
                    run
                };
                run.with_task_status(&task.id, TaskStatus::InProgress, None, Utc::now())
            },
            errors,
        )
        .await;

        let execution = self.execute(&task, cancel, errors).await;
        self.settle(&task, execution, errors).await
    }

    /// Pick the task for this cycle. Never fails while candidates exist.
    async fn select(
        &self,
        run: &Run,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> Option<Selection> {
        if let Some(resumed) = resume_in_progress(run) {
            return Some(resumed);
        }
        if let Some(approved) = run
            .approval
            .as_ref()
            .filter(|a| a.status == ApprovalStatus::Approved)
            && run
                .task(&approved.task_id)
                .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed))
        {
            return Some(Selection {
                task_id: approved.task_id.clone(),
                reason: "approved by operator".to_string(),
                source: SelectionSource::Approved,
            });
        }

        let eligible = candidates(run);
        if eligible.is_empty() {
            return None;
        }
        let ctx = PromptContext::from_run(run).with_candidates(&eligible);
        let (reply, aborted) = match self.prompts.build(PromptKind::Choose, &ctx) {
            Ok(prompt) => {
                let outcome = self
                    .decide(
                        "choose",
                        prompt,
                        self.decision_options().lightweight(),
                        cancel,
                        errors,
                    )
                    .await;
                (outcome.text, outcome.aborted)
            }
            Err(err) => {
                errors.push(format!("render choose prompt: {err:#}"));
                (String::new(), false)
            }
        };
        resolve_choice(run, &reply, aborted)
    }

    async fn request_approval(&self, task: &Task, errors: &mut Vec<String>) -> ActionOutcome {
        let action = format!("run {} for task {}", task.path, task.id);
        let approval = Approval {
            id: format!("appr-{}", &Uuid::new_v4().simple().to_string()[..8]),
            task_id: task.id.clone(),
            action: action.clone(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
        };
        self.update_logged(
            |run| {
                let now = approval.requested_at;
                let message = format!("approval requested: {action}");
                let kind = EventKind::Approval {
                    task_id: task.id.clone(),
                    status: ApprovalStatus::Pending,
                };
                let run = run
                    .with_approval(Some(approval))
                    .with_event(now, kind, message);
                transition(run, Mode::Blocked, now, "approval required")
            },
            errors,
        )
        .await;
        info!(task_id = %task.id, "approval requested");
        self.notify(&format!(
            "Approval needed: {action} ({}). Reply \"approve\" or \"reject\".",
            task.title
        ))
        .await;
        ActionOutcome::for_task("approval requested", &task.id)
    }

    /// Route `task` to its execution path.
    async fn execute(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> Execution {
        if cancel.is_cancelled() {
            return Execution::Aborted;
        }
        match &task.path {
            ExecutionPath::Agent => self.execute_agent(task, cancel, errors).await,
            ExecutionPath::Capability(name) => {
                self.execute_capability(name, task, cancel, errors).await
            }
        }
    }

    async fn execute_agent(
        &self,
        task: &Task,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> Execution {
        let run = self.snapshot().await;
        let ctx = PromptContext::from_run(&run).with_task(task);
        let prompt = match self.prompts.build(PromptKind::Task, &ctx) {
            Ok(prompt) => prompt,
            Err(err) => {
                errors.push(format!("render task prompt: {err:#}"));
                return Execution::Finished(format!("failed: task prompt error: {err:#}"));
            }
        };
        let mut options = self.decision_options();
        options.continue_session = run.agent_session(&task.id).map(str::to_string);
        let outcome = self.decide("task", prompt, options, cancel, errors).await;
        if let Some(session) = outcome.session_id.clone() {
            self.update_logged(|run| run.with_agent_session(&task.id, session), errors)
                .await;
        }
        if outcome.aborted {
            Execution::Aborted
        } else if outcome.fallback {
            Execution::Finished(format!("failed: {}", outcome.text))
        } else {
            Execution::Finished(outcome.text.trim().to_string())
        }
    }

    async fn execute_capability(
        &self,
        name: &str,
        task: &Task,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> Execution {
        let Some(capability) = self.capabilities.get(name) else {
            return Execution::Finished(skipped_result(name, None));
        };
        if let Readiness::Unavailable(detail) = capability.readiness().await {
            warn!(capability = name, detail = %detail, "capability unavailable");
            self.record_health(name, Err(detail.clone()), errors).await;
            return Execution::Finished(skipped_result(name, Some(&detail)));
        }

        let request = CapabilityRequest {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
        };
        let result = capability.invoke(&request, cancel).await;
        if cancel.is_cancelled() {
            return Execution::Aborted;
        }
        let health = match classify_result(&result) {
            ResultClass::Success => Ok(()),
            ResultClass::Failure => Err(result.clone()),
        };
        self.record_health(name, health, errors).await;
        Execution::Finished(result)
    }

    async fn record_health(
        &self,
        name: &str,
        outcome: Result<(), String>,
        errors: &mut Vec<String>,
    ) {
        self.update_logged(
            |run| {
                let now = Utc::now();
                let previous = run.health.get(name).cloned();
                let health = next_health(previous, outcome, now);
                run.with_health(name, health)
            },
            errors,
        )
        .await;
    }

    /// Apply the classified result to the task, plan and mode.
    async fn settle(
        &self,
        task: &Task,
        execution: Execution,
        errors: &mut Vec<String>,
    ) -> ActionOutcome {
        let result = match execution {
            Execution::Aborted => {
                self.update_logged(
                    |run| {
                        let now = Utc::now();
                        let run = run
                            .with_task_status(&task.id, TaskStatus::Pending, None, now)
                            .with_event(
                                now,
                                EventKind::Task {
                                    task_id: task.id.clone(),
                                    status: TaskStatus::Pending,
                                },
                                format!("{} interrupted by operator", task.id),
                            );
                        transition(run, Mode::Planning, now, "operator interrupt")
                    },
                    errors,
                )
                .await;
                return ActionOutcome::for_task("task interrupted", &task.id);
            }
            Execution::Finished(result) => result,
        };

        let class = classify_result(&result);
        info!(task_id = %task.id, ?class, "task finished");
        let status = match class {
            ResultClass::Success => {
                match self.plan.mark_completed(&task.id) {
                    Ok(true) => {}
                    Ok(false) => warn!(task_id = %task.id, "task line missing from plan"),
                    Err(err) => errors.push(format!("{err:#}")),
                }
                TaskStatus::Completed
            }
            ResultClass::Failure => TaskStatus::Failed,
        };

        let message = format!("{} {status}: {result}", task.id);
        let output = result.clone();
        self.update_logged(
            |run| {
                let now = Utc::now();
                let run = run
                    .with_task_status(&task.id, status, Some(output), now)
                    .with_event(
                        now,
                        EventKind::Task {
                            task_id: task.id.clone(),
                            status,
                        },
                        message,
                    );
                let run = if status == TaskStatus::Completed {
                    run.with_summary(format!("{}: {result}", task.id), now)
                } else {
                    run
                };
                let next = mode_after_build(&run);
                transition(run, next, now, "task settled")
            },
            errors,
        )
        .await;

        if status == TaskStatus::Failed {
            self.notify(&format!("Task {} failed: {result}", task.id)).await;
            ActionOutcome::for_task(format!("task {} failed", task.id), &task.id)
        } else {
            ActionOutcome::for_task(format!("task {} completed", task.id), &task.id)
        }
    }
}

fn next_health(
    previous: Option<CapabilityHealth>,
    outcome: Result<(), String>,
    now: Timestamp,
) -> CapabilityHealth {
    let last_ok_at = previous.as_ref().and_then(|h| h.last_ok_at);
    match outcome {
        Ok(()) => CapabilityHealth {
            ready: true,
            detail: None,
            last_ok_at: Some(now),
            last_error: previous.and_then(|h| h.last_error),
            checked_at: now,
        },
        Err(detail) => CapabilityHealth {
            ready: false,
            detail: Some(detail.clone()),
            last_ok_at,
            last_error: Some(detail),
            checked_at: now,
        },
    }
}
