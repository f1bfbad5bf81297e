//! Plan document grammar and task synchronization.
//!
//! The plan document is a line-oriented checklist shared with humans:
//!
//! ```text
//! - [ ] <id> | <path> | <title> | <description>
//! - [x] <id> | <path> | <title> | <description>
//! ```
//!
//! Lines that do not match the grammar are tolerated on read and never
//! produced on write. All functions here are pure string/`Run` transforms; the
//! file itself is handled by `io::plan_doc`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::run::Run;
use crate::core::types::{EventKind, ExecutionPath, Task, TaskStatus, Timestamp};

static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[([ xX])\] ([a-z0-9-]+) \| ([a-z0-9-]+) \| ([^|]+?) \|(?: (.*?))?\s*$")
        .unwrap()
});

/// Byte offset of the checkbox marker within a task line (`- [?]`).
const MARKER_OFFSET: usize = 3;

/// One valid task line from the plan document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLine {
    /// 0-indexed physical line number within the document.
    pub line_index: usize,
    pub checked: bool,
    pub id: String,
    pub path: ExecutionPath,
    pub title: String,
    pub description: String,
}

impl PlanLine {
    /// Earlier lines are more urgent: `max(1, 100 - line_index)`.
    pub fn priority(&self) -> u32 {
        let priority = 100usize.saturating_sub(self.line_index).max(1);
        u32::try_from(priority).unwrap_or(1)
    }

    pub fn status(&self) -> TaskStatus {
        if self.checked {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        }
    }

    pub fn render(&self) -> String {
        render_task_line(
            self.checked,
            &self.id,
            &self.path,
            &self.title,
            &self.description,
        )
    }
}

/// Parse one line (without its line ending) against the task grammar.
pub fn parse_line(line: &str, line_index: usize) -> Option<PlanLine> {
    let caps = TASK_LINE.captures(line)?;
    let title = caps.get(4)?.as_str().trim();
    if title.is_empty() {
        return None;
    }
    let path = ExecutionPath::parse(caps.get(3)?.as_str())?;
    Some(PlanLine {
        line_index,
        checked: caps.get(1)?.as_str() != " ",
        id: caps.get(2)?.as_str().to_string(),
        path,
        title: title.to_string(),
        description: caps
            .get(5)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
    })
}

/// Parse every valid task line in document order.
///
/// Duplicate ids keep their first occurrence.
pub fn parse_document(doc: &str) -> Vec<PlanLine> {
    let mut seen = HashSet::new();
    doc.lines()
        .enumerate()
        .filter_map(|(idx, line)| parse_line(line, idx))
        .filter(|line| seen.insert(line.id.clone()))
        .collect()
}

/// Render a task line in canonical form.
pub fn render_task_line(
    checked: bool,
    id: &str,
    path: &ExecutionPath,
    title: &str,
    description: &str,
) -> String {
    let mark = if checked { 'x' } else { ' ' };
    let title = title.replace('|', "/");
    let description = description.trim();
    if description.is_empty() {
        format!("- [{mark}] {id} | {path} | {} |", title.trim())
    } else {
        format!("- [{mark}] {id} | {path} | {} | {description}", title.trim())
    }
}

/// Rebuild the run's task list from a fresh parse.
///
/// - ids, titles, paths and priorities come from the document
/// - `output` is preserved for ids already known to the run
/// - the run's current task stays `in_progress` while its line is unchecked
/// - a previously failed task stays `failed` while its line is unchecked
/// - tasks missing from the document are dropped
pub fn reconcile(run: Run, lines: &[PlanLine], now: Timestamp) -> Run {
    let tasks: Vec<Task> = lines
        .iter()
        .map(|line| {
            let existing = run.task(&line.id);
            let mut status = line.status();
            if status == TaskStatus::Pending {
                if run.current_task_id.as_deref() == Some(line.id.as_str()) {
                    status = TaskStatus::InProgress;
                } else if existing.is_some_and(|t| t.status == TaskStatus::Failed) {
                    status = TaskStatus::Failed;
                }
            }
            let updated_at = match existing {
                Some(task) if task.status == status => task.updated_at,
                _ => now,
            };
            Task {
                id: line.id.clone(),
                title: line.title.clone(),
                description: line.description.clone(),
                path: line.path.clone(),
                priority: line.priority(),
                status,
                output: existing.and_then(|t| t.output.clone()),
                updated_at,
            }
        })
        .collect();

    let dropped = run
        .tasks
        .iter()
        .filter(|t| !tasks.iter().any(|n| n.id == t.id))
        .count();
    let changed = tasks != run.tasks;

    let mut run = run;
    run.tasks = tasks;
    if run
        .current_task_id
        .as_deref()
        .is_some_and(|id| run.task(id).is_none_or(|t| t.status != TaskStatus::InProgress))
    {
        run.current_task_id = None;
    }
    let known = &run.tasks;
    run.agent_sessions
        .retain(|id, _| known.iter().any(|t| &t.id == id && t.status != TaskStatus::Completed));
    let run = if changed {
        let message = format!(
            "plan synced: {} tasks ({} pending, {} completed, {} dropped)",
            run.tasks.len(),
            run.count_status(TaskStatus::Pending),
            run.count_status(TaskStatus::Completed),
            dropped
        );
        run.with_event(now, EventKind::PlanSync, message)
    } else {
        run
    };
    drop_stale_approval(run, now)
}

/// Clear an approval whose task was removed or checked off in the document.
fn drop_stale_approval(run: Run, now: Timestamp) -> Run {
    let Some(approval) = run.approval.as_ref() else {
        return run;
    };
    let open = run
        .task(&approval.task_id)
        .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed));
    if open {
        return run;
    }
    let kind = EventKind::Approval {
        task_id: approval.task_id.clone(),
        status: approval.status,
    };
    let message = format!(
        "approval {} dropped: task {} is no longer open",
        approval.id, approval.task_id
    );
    run.with_approval(None).with_event(now, kind, message)
}

/// Result of flipping a task's checkbox in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The document with exactly one marker changed.
    Marked(String),
    AlreadyChecked,
    Missing,
}

/// Flip the checkbox of task `id` to checked, leaving every other byte intact.
pub fn mark_completed(doc: &str, id: &str) -> MarkOutcome {
    let mut offset = 0;
    for segment in doc.split_inclusive('\n') {
        let line = segment.trim_end_matches(['\n', '\r']);
        if let Some(parsed) = parse_line(line, 0)
            && parsed.id == id
        {
            if parsed.checked {
                return MarkOutcome::AlreadyChecked;
            }
            let marker = offset + MARKER_OFFSET;
            let mut updated = String::with_capacity(doc.len());
            updated.push_str(&doc[..marker]);
            updated.push('x');
            updated.push_str(&doc[marker + 1..]);
            return MarkOutcome::Marked(updated);
        }
        offset += segment.len();
    }
    MarkOutcome::Missing
}

/// Reduce a proposed replacement document to task lines and blank separators.
///
/// Headings, prose and code fences are dropped, duplicate ids keep their first
/// occurrence, and runs of blank lines collapse to one. Returns `None` when no
/// task line survives.
pub fn sanitize_plan(text: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let mut kept: Vec<&str> = Vec::new();
    let mut task_lines = 0usize;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            if kept.last().is_some_and(|prev| !prev.is_empty()) {
                kept.push("");
            }
            continue;
        }
        let Some(parsed) = parse_line(line, 0) else {
            continue;
        };
        if !seen.insert(parsed.id) {
            continue;
        }
        kept.push(line);
        task_lines += 1;
    }

    while kept.last().is_some_and(|line| line.is_empty()) {
        kept.pop();
    }
    if task_lines == 0 {
        return None;
    }
    let mut doc = kept.join("\n");
    doc.push('\n');
    Some(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Approval, ApprovalStatus};
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("ts")
    }

    const DOC: &str = "# Plan\n\
        - [ ] draft-outline | agent | Draft outline | Write the outline\n\
        Some prose the agent left behind.\n\
        - [x] setup-repo | shell | Set up repo | git init\n\
        - [ ] deploy-site | deploy | Deploy |\n";

    #[test]
    fn parses_valid_lines_and_ignores_prose() {
        let lines = parse_document(DOC);
        let ids: Vec<&str> = lines.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["draft-outline", "setup-repo", "deploy-site"]);

        assert!(!lines[0].checked);
        assert_eq!(lines[0].path, ExecutionPath::Agent);
        assert_eq!(lines[0].description, "Write the outline");
        assert!(lines[1].checked);
        assert_eq!(lines[1].path, ExecutionPath::Capability("shell".into()));
        assert_eq!(lines[2].description, "");
    }

    #[test]
    fn priority_follows_line_index() {
        let lines = parse_document(DOC);
        let priorities: Vec<u32> = lines.iter().map(PlanLine::priority).collect();
        assert_eq!(priorities, vec![99, 97, 96]);

        let far = PlanLine {
            line_index: 250,
            ..lines[0].clone()
        };
        assert_eq!(far.priority(), 1);
    }

    #[test]
    fn rejects_near_miss_lines() {
        for line in [
            "- [ ] Upper-Case | agent | Title | desc",
            "- [ ] id | agent |  | desc",
            "* [ ] id | agent | Title | desc",
            "  - [ ] id | agent | Title | desc",
            "- [-] id | agent | Title | desc",
            "- [ ] id | Agent | Title | desc",
            "- [ ] id agent Title desc",
        ] {
            assert!(parse_line(line, 0).is_none(), "should reject: {line}");
        }
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let doc = "- [ ] a | agent | First |\n- [x] a | agent | Second |\n";
        let lines = parse_document(doc);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].title, "First");
    }

    #[test]
    fn reparse_is_idempotent() {
        let run = Run::new("run-1", at(0));
        let once = reconcile(run, &parse_document(DOC), at(1));
        let twice = reconcile(once.clone(), &parse_document(DOC), at(2));

        let snapshot = |run: &Run| {
            run.tasks
                .iter()
                .map(|t| (t.id.clone(), t.priority, t.status, t.updated_at))
                .collect::<Vec<_>>()
        };
        assert_eq!(snapshot(&once), snapshot(&twice));
        assert_eq!(once.events.len(), twice.events.len());
    }

    #[test]
    fn reconcile_preserves_output_and_in_flight_status() {
        let run = reconcile(Run::new("run-1", at(0)), &parse_document(DOC), at(1));
        let run = run
            .with_task_status("draft-outline", TaskStatus::InProgress, None, at(2))
            .with_task_status("deploy-site", TaskStatus::Failed, Some("deploy failed".into()), at(2));

        let run = reconcile(run, &parse_document(DOC), at(3));
        let draft = run.task("draft-outline").expect("draft");
        assert_eq!(draft.status, TaskStatus::InProgress);
        assert_eq!(run.current_task_id.as_deref(), Some("draft-outline"));

        let deploy = run.task("deploy-site").expect("deploy");
        assert_eq!(deploy.status, TaskStatus::Failed);
        assert_eq!(deploy.output.as_deref(), Some("deploy failed"));
    }

    #[test]
    fn reconcile_drops_tasks_missing_from_document() {
        let run = reconcile(Run::new("run-1", at(0)), &parse_document(DOC), at(1));
        let run = run.with_task_status("deploy-site", TaskStatus::InProgress, None, at(2));
        let trimmed = "- [ ] draft-outline | agent | Draft outline | Write the outline\n";

        let run = reconcile(run, &parse_document(trimmed), at(3));
        assert_eq!(run.tasks.len(), 1);
        assert_eq!(run.current_task_id, None);
        let event = run.events.back().expect("event");
        assert!(event.message.contains("2 dropped"));
    }

    fn approval(task_id: &str, status: ApprovalStatus) -> Approval {
        Approval {
            id: "appr-1".to_string(),
            task_id: task_id.to_string(),
            action: format!("run deploy for task {task_id}"),
            status,
            requested_at: at(1),
            resolved_at: None,
        }
    }

    #[test]
    fn reconcile_clears_approval_for_removed_task() {
        let run = reconcile(Run::new("run-1", at(0)), &parse_document(DOC), at(1))
            .with_approval(Some(approval("deploy-site", ApprovalStatus::Approved)));

        let run = reconcile(run, &parse_document("# nothing left\n"), at(2));
        assert!(run.approval.is_none());
        let event = run.events.back().expect("event");
        assert_eq!(
            event.message,
            "approval appr-1 dropped: task deploy-site is no longer open"
        );
    }

    #[test]
    fn reconcile_clears_approval_for_checked_off_task() {
        let run = reconcile(Run::new("run-1", at(0)), &parse_document(DOC), at(1))
            .with_approval(Some(approval("deploy-site", ApprovalStatus::Pending)));
        let checked = DOC.replace("- [ ] deploy-site", "- [x] deploy-site");

        let run = reconcile(run, &parse_document(&checked), at(2));
        assert!(run.approval.is_none());
        assert_eq!(
            run.task("deploy-site").map(|t| t.status),
            Some(TaskStatus::Completed)
        );
    }

    #[test]
    fn reconcile_keeps_approval_for_open_task() {
        let run = reconcile(Run::new("run-1", at(0)), &parse_document(DOC), at(1))
            .with_approval(Some(approval("deploy-site", ApprovalStatus::Approved)));

        let run = reconcile(run, &parse_document(DOC), at(2));
        assert_eq!(
            run.approval.as_ref().map(|a| a.status),
            Some(ApprovalStatus::Approved)
        );
    }

    #[test]
    fn mark_completed_flips_only_target_marker() {
        let doc = "# Plan\r\n- [ ] a | agent | A | first\r\n\r\n- [ ] b | shell | B | second\r\nfooter";
        let MarkOutcome::Marked(updated) = mark_completed(doc, "b") else {
            panic!("expected marked");
        };
        let before: Vec<&str> = doc.split_inclusive('\n').collect();
        let after: Vec<&str> = updated.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        for (idx, (b, a)) in before.iter().zip(&after).enumerate() {
            if idx == 3 {
                assert_eq!(*a, "- [x] b | shell | B | second\r\n");
            } else {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn mark_completed_reports_missing_and_already_checked() {
        assert_eq!(mark_completed(DOC, "setup-repo"), MarkOutcome::AlreadyChecked);
        assert_eq!(mark_completed(DOC, "nope"), MarkOutcome::Missing);
    }

    #[test]
    fn sanitize_strips_everything_but_task_lines() {
        let reply = "Here is the plan:\n\n```markdown\n# Plan\n\n- [ ] a | agent | A | first\n\n\n- [ ] b | shell | B |\n- [ ] a | agent | Dup |\n```\nLet me know!\n";
        let doc = sanitize_plan(reply).expect("plan");
        assert_eq!(doc, "- [ ] a | agent | A | first\n\n- [ ] b | shell | B |\n");
    }

    #[test]
    fn sanitize_rejects_prose_only_reply() {
        assert_eq!(sanitize_plan("# Plan\n\nI could not think of anything.\n"), None);
        assert_eq!(sanitize_plan(""), None);
    }

    #[test]
    fn render_round_trips_through_parser() {
        let line = render_task_line(
            false,
            "write-docs",
            &ExecutionPath::Agent,
            "Write | docs",
            "",
        );
        assert_eq!(line, "- [ ] write-docs | agent | Write / docs |");
        let parsed = parse_line(&line, 0).expect("parse");
        assert_eq!(parsed.render(), line);
    }
}
