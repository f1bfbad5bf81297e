//! Deterministic task selection for building cycles.

use crate::core::fields::Fields;
use crate::core::run::Run;
use crate::core::types::{Task, TaskStatus};

pub const ABORTED_REASON: &str = "selection aborted; defaulting to highest-priority pending task";
pub const UNMATCHED_REASON: &str =
    "selection reply named no candidate; defaulting to highest-priority pending task";

/// Where a selection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    Decision,
    Fallback,
    /// An operator-approved task resumes without asking again.
    Approved,
    /// A task left `in_progress` by an interrupted cycle.
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub task_id: String,
    pub reason: String,
    pub source: SelectionSource,
}

/// Tasks eligible for selection, most urgent first.
///
/// Pending and failed tasks are eligible. Ties keep document order.
pub fn candidates(run: &Run) -> Vec<&Task> {
    let mut eligible: Vec<&Task> = run
        .tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed))
        .collect();
    eligible.sort_by(|a, b| b.priority.cmp(&a.priority));
    eligible
}

/// Highest-priority eligible task with a fixed reason.
pub fn fallback(run: &Run, reason: &str) -> Option<Selection> {
    candidates(run).first().map(|task| Selection {
        task_id: task.id.clone(),
        reason: reason.to_string(),
        source: SelectionSource::Fallback,
    })
}

/// The run's in-flight task, if one was left `in_progress`.
pub fn resume_in_progress(run: &Run) -> Option<Selection> {
    run.current_task()
        .filter(|t| t.status == TaskStatus::InProgress)
        .map(|task| Selection {
            task_id: task.id.clone(),
            reason: "resuming in-progress task".to_string(),
            source: SelectionSource::Resumed,
        })
}

/// Interpret a choice reply (`TASK: <id>`, `REASON: <text>`).
///
/// An aborted request or a reply that names no eligible task falls back to
/// the highest-priority candidate.
pub fn resolve_choice(run: &Run, reply: &str, aborted: bool) -> Option<Selection> {
    if aborted {
        return fallback(run, ABORTED_REASON);
    }
    let fields = Fields::parse(reply);
    let chosen = fields
        .first_of(&["TASK", "TASK_ID", "ID"])
        .map(|value| {
            value
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        })
        .and_then(|id| candidates(run).into_iter().find(|t| t.id == id));
    match chosen {
        Some(task) => Some(Selection {
            task_id: task.id.clone(),
            reason: fields
                .get("REASON")
                .unwrap_or("chosen by decision engine")
                .to_string(),
            source: SelectionSource::Decision,
        }),
        None => fallback(run, UNMATCHED_REASON),
    }
}
