//! The cycle body and the non-building mode actions.
//!
//! A cycle is strictly sequential: reconcile the plan, drain operator
//! commands, commit the next mode, run exactly one mode action, then record
//! the outcome. Failures are recorded and reported, never raised.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::fields::Fields;
use crate::core::mode::{next_mode, redirect_for_directives, transition};
use crate::core::plan::reconcile;
use crate::core::run::Run;
use crate::core::status::describe;
use crate::core::trigger::Trigger;
use crate::core::types::{EventKind, Mode, OperatorCommand, Thesis};
use crate::io::cycle_log::{CycleRecord, write_cycle_record};
use crate::io::plan_doc::PlanRejected;
use crate::io::prompt::{PromptContext, PromptKind};
use crate::orchestrator::Orchestrator;
use crate::scheduler::CycleRunner;

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// 1-indexed cycle number within the run.
    pub cycle: u64,
    pub trigger: Trigger,
    pub mode_before: Mode,
    pub mode_after: Mode,
    pub action: String,
    pub task_id: Option<String>,
    pub decision_turns: u32,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn new(trigger: Trigger, mode: Mode) -> Self {
        Self {
            cycle: 0,
            trigger,
            mode_before: mode,
            mode_after: mode,
            action: String::new(),
            task_id: None,
            decision_turns: 0,
            errors: Vec::new(),
        }
    }

    /// All errors joined, if any occurred.
    pub fn error(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("; "))
    }
}

/// Result of one mode action.
#[derive(Debug, Clone)]
pub(crate) struct ActionOutcome {
    pub action: String,
    pub task_id: Option<String>,
}

impl ActionOutcome {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            task_id: None,
        }
    }

    pub fn for_task(action: impl Into<String>, task_id: &str) -> Self {
        Self {
            action: action.into(),
            task_id: Some(task_id.to_string()),
        }
    }
}

#[async_trait]
impl CycleRunner for Orchestrator {
    #[instrument(skip_all, fields(%trigger))]
    async fn run_cycle(&self, trigger: Trigger, cancel: CancellationToken) -> CycleReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut errors = Vec::new();
        let before = self.snapshot().await;

        self.sync_plan(&mut errors).await;

        let (run, directives) = self.enter(&mut errors).await;
        let mode = run.mode;
        info!(cycle = run.cycle_count, %mode, directives = directives.len(), "cycle entered");

        let outcome = match mode {
            Mode::Discovery => self.discover(&run, directives, &cancel, &mut errors).await,
            Mode::Planning => self.replan(&run, directives, &cancel, &mut errors).await,
            Mode::Building => self.build(&cancel, &mut errors).await,
            Mode::Operating => self.review(&run, &cancel, &mut errors).await,
            Mode::Blocked => waiting_for_approval(&run),
        };

        let finished = format!(
            "cycle {} ({trigger}) finished: {}",
            run.cycle_count, outcome.action
        );
        let run = self
            .update_logged(
                |run| run.with_event(Utc::now(), EventKind::Cycle, finished),
                &mut errors,
            )
            .await;

        let decision_turns = run
            .total_decision_turns
            .saturating_sub(before.total_decision_turns);
        let report = CycleReport {
            cycle: run.cycle_count,
            trigger,
            mode_before: before.mode,
            mode_after: run.mode,
            action: outcome.action,
            task_id: outcome.task_id,
            decision_turns: u32::try_from(decision_turns).unwrap_or(u32::MAX),
            errors,
        };
        self.record_cycle(&run, &report, started_at, clock);
        self.maybe_send_status(&run).await;
        report
    }
}

impl Orchestrator {
    /// Re-read the plan document and reconcile the task list against it.
    async fn sync_plan(&self, errors: &mut Vec<String>) {
        match self.plan.parse() {
            Ok(lines) => {
                self.update_logged(|run| reconcile(run, &lines, Utc::now()), errors)
                    .await;
            }
            Err(err) => {
                let message = format!("plan unreadable: {err:#}");
                warn!(err = %message, "plan sync failed");
                errors.push(message.clone());
                self.update_logged(
                    |run| run.with_event(Utc::now(), EventKind::Status, message),
                    errors,
                )
                .await;
            }
        }
    }

    /// Drain operator commands and commit this cycle's mode.
    ///
    /// Directives are only consumed by discovery and planning; any other mode
    /// puts them back for a later cycle.
    async fn enter(&self, errors: &mut Vec<String>) -> (Run, Vec<OperatorCommand>) {
        let mut consumed = Vec::new();
        let run = self
            .update_logged(
                |run| {
                    let now = Utc::now();
                    let (mut run, drained) = run.drain_commands();
                    run.cycle_count += 1;
                    let resolved = next_mode(&run);
                    let mode = redirect_for_directives(resolved, &run, drained.len());
                    let reason = entry_reason(&run, mode, resolved != mode);
                    let run = if matches!(mode, Mode::Discovery | Mode::Planning) {
                        consumed = drained;
                        run
                    } else {
                        run.requeue_commands(drained)
                    };
                    transition(run, mode, now, reason)
                },
                errors,
            )
            .await;
        (run, consumed)
    }

    /// Put directives back when the action that should absorb them did not.
    async fn requeue(&self, directives: Vec<OperatorCommand>, errors: &mut Vec<String>) {
        if directives.is_empty() {
            return;
        }
        self.update_logged(|run| run.requeue_commands(directives), errors)
            .await;
    }

    async fn record_status(&self, message: String, errors: &mut Vec<String>) {
        self.update_logged(
            |run| run.with_event(Utc::now(), EventKind::Status, message),
            errors,
        )
        .await;
    }

    /// Ask for an objective and commit it as the run's thesis.
    async fn discover(
        &self,
        run: &Run,
        directives: Vec<OperatorCommand>,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> ActionOutcome {
        let ctx = PromptContext::from_run(run).with_directives(&directives);
        let prompt = match self.prompts.build(PromptKind::Discovery, &ctx) {
            Ok(prompt) => prompt,
            Err(err) => {
                errors.push(format!("render discovery prompt: {err:#}"));
                self.requeue(directives, errors).await;
                return ActionOutcome::new("discovery prompt failed");
            }
        };
        let outcome = self
            .decide("discovery", prompt, self.decision_options(), cancel, errors)
            .await;

        if !outcome.is_answer() {
            let message = if outcome.aborted {
                "discovery interrupted; objective still unset"
            } else {
                "discovery got no usable reply; retrying next cycle"
            };
            self.requeue(directives, errors).await;
            self.record_status(message.to_string(), errors).await;
            return ActionOutcome::new(message);
        }

        let fields = Fields::parse(&outcome.text);
        let Some(objective) = fields.get("OBJECTIVE") else {
            let message = "discovery reply missing OBJECTIVE; retrying next cycle";
            self.requeue(directives, errors).await;
            self.record_status(message.to_string(), errors).await;
            return ActionOutcome::new(message);
        };

        let now = Utc::now();
        let thesis = Thesis {
            objective: objective.to_string(),
            rationale: fields.get("RATIONALE").unwrap_or_default().to_string(),
            success_signal: fields.get("SUCCESS_SIGNAL").map(str::to_string),
            created_at: now,
        };
        self.update_logged(
            |run| transition(run.with_thesis(thesis), Mode::Planning, now, "objective set"),
            errors,
        )
        .await;
        self.notify(&format!("New objective: {objective}")).await;
        ActionOutcome::new(format!("objective set: {objective}"))
    }

    /// Keep a plan with open work, or write a fresh one.
    async fn replan(
        &self,
        run: &Run,
        directives: Vec<OperatorCommand>,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> ActionOutcome {
        if directives.is_empty() && run.has_remaining_work() {
            self.update_logged(
                |run| transition(run, Mode::Building, Utc::now(), "plan has open tasks"),
                errors,
            )
            .await;
            return ActionOutcome::new("plan still valid");
        }

        let current_plan = match self.plan.read() {
            Ok(text) => text,
            Err(err) => {
                errors.push(format!("{err:#}"));
                String::new()
            }
        };
        let ctx = PromptContext::from_run(run)
            .with_directives(&directives)
            .with_plan(&current_plan)
            .with_capabilities(self.capabilities.names());
        let prompt = match self.prompts.build(PromptKind::Planning, &ctx) {
            Ok(prompt) => prompt,
            Err(err) => {
                errors.push(format!("render planning prompt: {err:#}"));
                self.requeue(directives, errors).await;
                return ActionOutcome::new("planning prompt failed");
            }
        };
        let outcome = self
            .decide("planning", prompt, self.decision_options(), cancel, errors)
            .await;

        if !outcome.is_answer() {
            let message = if outcome.aborted {
                "planning interrupted; keeping previous plan"
            } else {
                "planning got no usable reply; keeping previous plan"
            };
            self.requeue(directives, errors).await;
            self.record_status(message.to_string(), errors).await;
            return ActionOutcome::new(message);
        }

        match self.plan.replace(&outcome.text) {
            Ok(lines) => {
                let count = lines.len();
                self.update_logged(
                    |run| {
                        let now = Utc::now();
                        transition(reconcile(run, &lines, now), Mode::Building, now, "plan written")
                    },
                    errors,
                )
                .await;
                ActionOutcome::new(format!("plan written: {count} tasks"))
            }
            Err(err) => {
                self.requeue(directives, errors).await;
                let message = match err.downcast_ref::<PlanRejected>() {
                    Some(rejected) => format!("{rejected}; keeping previous plan"),
                    None => {
                        errors.push(format!("{err:#}"));
                        format!("plan write failed: {err:#}")
                    }
                };
                self.record_status(message.clone(), errors).await;
                ActionOutcome::new(message)
            }
        }
    }

    /// Summarize progress for the operator, then return to planning.
    async fn review(
        &self,
        run: &Run,
        cancel: &CancellationToken,
        errors: &mut Vec<String>,
    ) -> ActionOutcome {
        let ctx = PromptContext::from_run(run);
        let summary = match self.prompts.build(PromptKind::Operating, &ctx) {
            Ok(prompt) => {
                let outcome = self
                    .decide("operating", prompt, self.decision_options(), cancel, errors)
                    .await;
                if outcome.is_answer() {
                    Fields::parse(&outcome.text)
                        .get("SUMMARY")
                        .map_or_else(|| outcome.text.trim().to_string(), str::to_string)
                } else {
                    "review deferred: no usable reply".to_string()
                }
            }
            Err(err) => {
                errors.push(format!("render operating prompt: {err:#}"));
                "review deferred: prompt failed".to_string()
            }
        };

        let event = format!("review: {summary}");
        let stored = summary.clone();
        self.update_logged(
            |run| {
                let now = Utc::now();
                let run = run
                    .with_summary(stored, now)
                    .with_event(now, EventKind::Status, event);
                transition(run, Mode::Planning, now, "review complete")
            },
            errors,
        )
        .await;
        self.notify(&format!("Review: {summary}")).await;
        ActionOutcome::new("review sent")
    }

    fn record_cycle(
        &self,
        run: &Run,
        report: &CycleReport,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) {
        let record = CycleRecord {
            run_id: run.run_id.clone(),
            cycle: report.cycle,
            trigger: report.trigger,
            mode_before: report.mode_before,
            mode_after: report.mode_after,
            action: report.action.clone(),
            task_id: report.task_id.clone(),
            decision_turns: report.decision_turns,
            started_at,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            error: report.error(),
        };
        if let Err(err) = write_cycle_record(self.cycles_dir(), &record) {
            warn!(err = %format!("{err:#}"), "failed to write cycle record");
        }
    }

    async fn maybe_send_status(&self, run: &Run) {
        let every = self.config.status_every_cycles;
        if every > 0 && run.cycle_count > 0 && run.cycle_count % every == 0 {
            self.notify(&describe(run)).await;
        }
    }
}

fn waiting_for_approval(run: &Run) -> ActionOutcome {
    match run.pending_approval() {
        Some(approval) => {
            ActionOutcome::for_task("waiting for operator approval", &approval.task_id)
        }
        None => ActionOutcome::new("waiting for operator approval"),
    }
}

fn entry_reason(run: &Run, mode: Mode, redirected: bool) -> &'static str {
    if redirected {
        return "operator directives";
    }
    match mode {
        Mode::Discovery => "no objective",
        Mode::Blocked => "awaiting approval",
        Mode::Building if run.current_task().is_some() => "resuming in-progress task",
        _ if run.approval.is_some() => "approval resolved",
        _ => "resuming",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionPath, TaskStatus};
    use crate::test_support::{at, task, thesis};

    #[test]
    fn report_joins_errors() {
        let mut report = CycleReport::new(Trigger::Manual, Mode::Planning);
        assert_eq!(report.error(), None);
        report.errors.push("persist run: disk full".to_string());
        report.errors.push("plan unreadable".to_string());
        assert_eq!(
            report.error().as_deref(),
            Some("persist run: disk full; plan unreadable")
        );
    }

    #[test]
    fn entry_reason_names_what_drove_the_mode() {
        let mut run = Run::new("run-1", at(0));
        assert_eq!(entry_reason(&run, Mode::Discovery, false), "no objective");

        run = run.with_thesis(thesis("ship"));
        assert_eq!(entry_reason(&run, Mode::Planning, true), "operator directives");

        run.tasks = vec![task("a", ExecutionPath::Agent, 100, TaskStatus::Pending)];
        run = run.with_task_status("a", TaskStatus::InProgress, None, at(1));
        assert_eq!(
            entry_reason(&run, Mode::Building, false),
            "resuming in-progress task"
        );
    }

    #[test]
    fn blocked_action_names_the_gated_task() {
        let run = Run::new("run-1", at(0));
        let outcome = waiting_for_approval(&run);
        assert_eq!(outcome.action, "waiting for operator approval");
        assert_eq!(outcome.task_id, None);
    }
}
