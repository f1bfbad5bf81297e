//! The `Run` aggregate and its pure transitions.
//!
//! A run is owned by exactly one orchestrator. Every transition here takes the
//! run by value and returns the next value; callers persist the result.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::types::{
    Approval, CapabilityHealth, Event, EventKind, Mode, OperatorCommand, Task, TaskStatus, Thesis,
    Timestamp,
};

pub const DEFAULT_EVENT_LOG_CAP: usize = 200;

/// One long-lived execution identity and everything it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub mode: Mode,
    pub started_at: Timestamp,
    /// Monotonic count of decision-engine turns consumed by this run.
    pub total_decision_turns: u64,
    pub is_running: bool,
    pub last_summary: Option<String>,
    pub last_iteration_at: Option<Timestamp>,
    #[serde(default)]
    pub cycle_count: u64,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub thesis: Option<Thesis>,
    #[serde(default)]
    pub approval: Option<Approval>,
    /// Tasks in plan-document order.
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub commands: VecDeque<OperatorCommand>,
    #[serde(default)]
    pub events: VecDeque<Event>,
    #[serde(default)]
    pub health: BTreeMap<String, CapabilityHealth>,
    /// Decision-engine session per agent task, continued on the next attempt.
    #[serde(default)]
    pub agent_sessions: BTreeMap<String, String>,
    #[serde(default = "default_event_log_cap")]
    pub event_log_cap: usize,
}

fn default_event_log_cap() -> usize {
    DEFAULT_EVENT_LOG_CAP
}

impl Run {
    pub fn new(run_id: impl Into<String>, now: Timestamp) -> Self {
        Self {
            run_id: run_id.into(),
            mode: Mode::Discovery,
            started_at: now,
            total_decision_turns: 0,
            is_running: false,
            last_summary: None,
            last_iteration_at: None,
            cycle_count: 0,
            current_task_id: None,
            thesis: None,
            approval: None,
            tasks: Vec::new(),
            commands: VecDeque::new(),
            events: VecDeque::new(),
            health: BTreeMap::new(),
            agent_sessions: BTreeMap::new(),
            event_log_cap: DEFAULT_EVENT_LOG_CAP,
        }
    }

    /// Append an event, keeping only the most recent `event_log_cap` entries.
    pub fn with_event(mut self, at: Timestamp, kind: EventKind, message: impl Into<String>) -> Self {
        self.events.push_back(Event {
            at,
            kind,
            message: message.into(),
        });
        let cap = self.event_log_cap.max(1);
        while self.events.len() > cap {
            self.events.pop_front();
        }
        self
    }

    pub fn with_event_log_cap(mut self, cap: usize) -> Self {
        self.event_log_cap = cap.max(1);
        while self.events.len() > self.event_log_cap {
            self.events.pop_front();
        }
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.is_running = running;
        self
    }

    pub fn with_thesis(self, thesis: Thesis) -> Self {
        let message = format!("objective set: {}", thesis.objective);
        let at = thesis.created_at;
        let mut run = self.with_event(at, EventKind::Status, message);
        run.thesis = Some(thesis);
        run
    }

    pub fn with_summary(mut self, summary: impl Into<String>, at: Timestamp) -> Self {
        self.last_summary = Some(summary.into());
        self.last_iteration_at = Some(at);
        self
    }

    pub fn with_decision_turns(mut self, turns: u32) -> Self {
        self.total_decision_turns = self.total_decision_turns.saturating_add(u64::from(turns));
        self
    }

    pub fn with_command(self, command: OperatorCommand) -> Self {
        let message = format!("queued operator command: {}", command.text);
        let at = command.received_at;
        let mut run = self.with_event(at, EventKind::Operator, message);
        run.commands.push_back(command);
        run
    }

    /// Remove and return every queued command in FIFO order.
    pub fn drain_commands(mut self) -> (Self, Vec<OperatorCommand>) {
        let drained = self.commands.drain(..).collect();
        (self, drained)
    }

    /// Put unconsumed commands back at the head of the queue, order intact.
    pub fn requeue_commands(mut self, commands: Vec<OperatorCommand>) -> Self {
        for command in commands.into_iter().rev() {
            self.commands.push_front(command);
        }
        self
    }

    pub fn with_approval(mut self, approval: Option<Approval>) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_health(mut self, name: &str, health: CapabilityHealth) -> Self {
        self.health.insert(name.to_string(), health);
        self
    }

    /// Set a task's status (and optionally its output), stamping `updated_at`.
    ///
    /// Unknown ids leave the run unchanged. Clearing `in_progress` on the
    /// current task also clears `current_task_id`.
    pub fn with_task_status(
        mut self,
        task_id: &str,
        status: TaskStatus,
        output: Option<String>,
        at: Timestamp,
    ) -> Self {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) else {
            return self;
        };
        task.status = status;
        if output.is_some() {
            task.output = output;
        }
        task.updated_at = at;

        if status == TaskStatus::Completed {
            self.agent_sessions.remove(task_id);
        }
        match status {
            TaskStatus::InProgress => self.current_task_id = Some(task_id.to_string()),
            _ if self.current_task_id.as_deref() == Some(task_id) => self.current_task_id = None,
            _ => {}
        }
        self
    }

    pub fn with_agent_session(mut self, task_id: &str, session: impl Into<String>) -> Self {
        self.agent_sessions.insert(task_id.to_string(), session.into());
        self
    }

    pub fn agent_session(&self, task_id: &str) -> Option<&str> {
        self.agent_sessions.get(task_id).map(String::as_str)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// The task currently marked as the run's in-flight work, if any.
    pub fn current_task(&self) -> Option<&Task> {
        self.current_task_id.as_deref().and_then(|id| self.task(id))
    }

    pub fn pending_approval(&self) -> Option<&Approval> {
        self.approval.as_ref().filter(|a| a.is_pending())
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Tasks still eligible for selection (pending or previously failed).
    pub fn has_remaining_work(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionPath;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("ts")
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: format!("{id} title"),
            description: String::new(),
            path: ExecutionPath::Agent,
            priority: 100,
            status,
            output: None,
            updated_at: at(0),
        }
    }

    #[test]
    fn event_log_keeps_most_recent_entries() {
        let mut run = Run::new("run-1", at(0)).with_event_log_cap(3);
        for i in 0..5 {
            run = run.with_event(at(i), EventKind::Status, format!("e{i}"));
        }
        let messages: Vec<&str> = run.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn drain_commands_is_fifo_and_empties_queue() {
        let run = Run::new("run-1", at(0));
        let run = ["first", "second"].iter().fold(run, |run, text| {
            run.with_command(OperatorCommand {
                id: format!("cmd-{text}"),
                text: text.to_string(),
                attachments: Vec::new(),
                received_at: at(1),
            })
        });

        let (run, drained) = run.drain_commands();
        let texts: Vec<&str> = drained.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(run.commands.is_empty());
    }

    #[test]
    fn requeued_commands_precede_new_ones() {
        let command = |text: &str| OperatorCommand {
            id: format!("cmd-{text}"),
            text: text.to_string(),
            attachments: Vec::new(),
            received_at: at(1),
        };
        let run = Run::new("run-1", at(0))
            .with_command(command("a"))
            .with_command(command("b"));
        let (run, drained) = run.drain_commands();
        let run = run
            .with_command(command("c"))
            .requeue_commands(drained);

        let texts: Vec<&str> = run.commands.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn finishing_current_task_clears_pointer() {
        let mut run = Run::new("run-1", at(0));
        run.tasks = vec![task("a", TaskStatus::Pending)];

        let run = run.with_task_status("a", TaskStatus::InProgress, None, at(1));
        assert_eq!(run.current_task_id.as_deref(), Some("a"));

        let run = run.with_task_status("a", TaskStatus::Completed, Some("ok".into()), at(2));
        assert_eq!(run.current_task_id, None);
        let a = run.task("a").expect("task");
        assert_eq!(a.output.as_deref(), Some("ok"));
        assert_eq!(a.updated_at, at(2));
    }

    #[test]
    fn missing_collections_deserialize_as_empty() {
        let json = r#"{
            "run_id": "run-1",
            "mode": "planning",
            "started_at": "2024-01-01T00:00:00Z",
            "total_decision_turns": 4,
            "is_running": false,
            "last_summary": null,
            "last_iteration_at": null
        }"#;
        let run: Run = serde_json::from_str(json).expect("parse");
        assert_eq!(run.mode, Mode::Planning);
        assert!(run.tasks.is_empty());
        assert_eq!(run.event_log_cap, DEFAULT_EVENT_LOG_CAP);
    }
}
