//! Human-readable run status, used for operator questions and periodic
//! status notifications.

use crate::core::run::Run;
use crate::core::types::TaskStatus;

pub fn describe(run: &Run) -> String {
    let mut lines = Vec::new();
    let running = if run.is_running { "running" } else { "paused" };
    lines.push(format!(
        "Run {} is {running} in {} mode (cycle {}).",
        run.run_id, run.mode, run.cycle_count
    ));

    match &run.thesis {
        Some(thesis) => lines.push(format!("Objective: {}", thesis.objective)),
        None => lines.push("Objective: not set yet.".to_string()),
    }

    if let Some(task) = run.current_task() {
        lines.push(format!("Working on: {} ({})", task.id, task.title));
    }

    if !run.tasks.is_empty() {
        lines.push(format!(
            "Tasks: {} pending, {} in progress, {} completed, {} failed.",
            run.count_status(TaskStatus::Pending),
            run.count_status(TaskStatus::InProgress),
            run.count_status(TaskStatus::Completed),
            run.count_status(TaskStatus::Failed),
        ));
    }

    if let Some(approval) = run.pending_approval() {
        lines.push(format!(
            "Waiting for approval: {} (reply approve or reject).",
            approval.action
        ));
    }

    if let Some(summary) = &run.last_summary {
        lines.push(format!("Last result: {summary}"));
    }

    lines.join("\n")
}
