//! Mode state machine.
//!
//! `transition` is the only function that changes `Run::mode`, and it always
//! records the change in the event log.

use crate::core::run::Run;
use crate::core::types::{ApprovalStatus, EventKind, Mode, TaskStatus, Timestamp};

/// Resolve the mode a cycle should run in, given the persisted run.
///
/// - no objective yet: `discovery`
/// - an approval is still pending: `blocked`
/// - the current task is in flight: `building`
/// - a resolved approval: `building` when approved, `planning` when rejected
/// - otherwise resume the mode committed by the previous cycle, falling back
///   to `planning` when that mode is not resumable
pub fn next_mode(run: &Run) -> Mode {
    if run.thesis.is_none() {
        return Mode::Discovery;
    }
    if run.pending_approval().is_some() {
        return Mode::Blocked;
    }
    if run
        .current_task()
        .is_some_and(|task| task.status == TaskStatus::InProgress)
    {
        return Mode::Building;
    }
    match run.approval.as_ref().map(|a| a.status) {
        Some(ApprovalStatus::Approved) => return Mode::Building,
        Some(ApprovalStatus::Rejected) => return Mode::Planning,
        Some(ApprovalStatus::Pending) | None => {}
    }
    match run.mode {
        Mode::Planning | Mode::Building | Mode::Operating => run.mode,
        Mode::Discovery | Mode::Blocked => Mode::Planning,
    }
}

/// Newly drained operator directives send idle build/operate cycles back to
/// planning so the plan can absorb them.
pub fn redirect_for_directives(mode: Mode, run: &Run, drained: usize) -> Mode {
    if drained == 0 {
        return mode;
    }
    let task_in_flight = run
        .current_task()
        .is_some_and(|task| task.status == TaskStatus::InProgress);
    match mode {
        Mode::Building | Mode::Operating if !task_in_flight => Mode::Planning,
        other => other,
    }
}

/// Mode to commit after a building action finished.
pub fn mode_after_build(run: &Run) -> Mode {
    if run.has_remaining_work() {
        Mode::Planning
    } else {
        Mode::Operating
    }
}

/// Move the run to `to`, appending a `mode_changed` event.
///
/// Transitioning to the current mode is a no-op.
pub fn transition(run: Run, to: Mode, at: Timestamp, reason: &str) -> Run {
    let from = run.mode;
    if from == to {
        return run;
    }
    let message = if reason.is_empty() {
        format!("{from} -> {to}")
    } else {
        format!("{from} -> {to}: {reason}")
    };
    let mut run = run.with_event(at, EventKind::ModeChanged { from, to }, message);
    run.mode = to;
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Approval, ExecutionPath, Task, Thesis};
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("ts")
    }

    fn thesis() -> Thesis {
        Thesis {
            objective: "ship it".to_string(),
            rationale: "because".to_string(),
            success_signal: None,
            created_at: at(0),
        }
    }

    fn approval(status: ApprovalStatus) -> Approval {
        Approval {
            id: "approval-1".to_string(),
            task_id: "deploy-site".to_string(),
            action: "deploy".to_string(),
            status,
            requested_at: at(0),
            resolved_at: None,
        }
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            path: ExecutionPath::Agent,
            priority: 100,
            status,
            output: None,
            updated_at: at(0),
        }
    }

    #[test]
    fn no_objective_resolves_to_discovery() {
        for mode in [Mode::Planning, Mode::Building, Mode::Operating, Mode::Blocked] {
            let mut run = Run::new("run-1", at(0));
            run.mode = mode;
            run.approval = Some(approval(ApprovalStatus::Pending));
            assert_eq!(next_mode(&run), Mode::Discovery);
        }
    }

    #[test]
    fn blocked_requires_pending_approval() {
        let mut run = Run::new("run-1", at(0)).with_thesis(thesis());
        for status in [ApprovalStatus::Approved, ApprovalStatus::Rejected] {
            run.approval = Some(approval(status));
            assert_ne!(next_mode(&run), Mode::Blocked);
        }
        run.approval = None;
        run.mode = Mode::Blocked;
        assert_eq!(next_mode(&run), Mode::Planning);

        run.approval = Some(approval(ApprovalStatus::Pending));
        assert_eq!(next_mode(&run), Mode::Blocked);
    }

    #[test]
    fn in_progress_task_stays_building() {
        let mut run = Run::new("run-1", at(0)).with_thesis(thesis());
        run.mode = Mode::Operating;
        run.tasks = vec![task("a", TaskStatus::InProgress)];
        run.current_task_id = Some("a".to_string());
        assert_eq!(next_mode(&run), Mode::Building);
    }

    #[test]
    fn committed_mode_is_resumed() {
        let mut run = Run::new("run-1", at(0)).with_thesis(thesis());
        run.mode = Mode::Building;
        assert_eq!(next_mode(&run), Mode::Building);
        run.mode = Mode::Discovery;
        assert_eq!(next_mode(&run), Mode::Planning);
    }

    #[test]
    fn transition_logs_prior_and_new_mode() {
        let run = Run::new("run-1", at(0));
        let run = transition(run, Mode::Planning, at(1), "objective chosen");
        assert_eq!(run.mode, Mode::Planning);
        let event = run.events.back().expect("event");
        assert_eq!(
            event.kind,
            EventKind::ModeChanged {
                from: Mode::Discovery,
                to: Mode::Planning
            }
        );
        assert!(event.message.contains("objective chosen"));

        let before = run.events.len();
        let run = transition(run, Mode::Planning, at(2), "again");
        assert_eq!(run.events.len(), before);
    }

    #[test]
    fn build_moves_to_operating_only_when_work_is_done() {
        let mut run = Run::new("run-1", at(0));
        run.tasks = vec![
            task("a", TaskStatus::Completed),
            task("b", TaskStatus::Failed),
        ];
        assert_eq!(mode_after_build(&run), Mode::Planning);
        run.tasks[1].status = TaskStatus::Completed;
        assert_eq!(mode_after_build(&run), Mode::Operating);
    }

    #[test]
    fn directives_redirect_idle_building_to_planning() {
        let run = Run::new("run-1", at(0));
        assert_eq!(
            redirect_for_directives(Mode::Building, &run, 1),
            Mode::Planning
        );
        assert_eq!(
            redirect_for_directives(Mode::Building, &run, 0),
            Mode::Building
        );
        assert_eq!(
            redirect_for_directives(Mode::Discovery, &run, 2),
            Mode::Discovery
        );
    }
}
