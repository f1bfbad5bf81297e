//! Shared deterministic types for the orchestrator core.
//!
//! These types define the persisted shape of a run. They must not depend on
//! external state or I/O; timestamps are always passed in by the caller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock timestamp used throughout the run record.
pub type Timestamp = DateTime<Utc>;

/// Phase of work the run is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Discovery,
    Planning,
    Building,
    Operating,
    /// Waiting on the operator to resolve a pending approval.
    Blocked,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Discovery => "discovery",
            Mode::Planning => "planning",
            Mode::Building => "building",
            Mode::Operating => "operating",
            Mode::Blocked => "blocked",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which execution path should perform a task.
///
/// `agent` re-delegates the work to the decision engine; every other token
/// names a capability in the registry. Serialized as the bare token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ExecutionPath {
    Agent,
    Capability(String),
}

impl ExecutionPath {
    pub const AGENT_TOKEN: &'static str = "agent";

    /// Parse a path token. Tokens must match `[a-z0-9-]+`.
    pub fn parse(token: &str) -> Option<Self> {
        if !is_slug(token) {
            return None;
        }
        if token == Self::AGENT_TOKEN {
            return Some(ExecutionPath::Agent);
        }
        Some(ExecutionPath::Capability(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ExecutionPath::Agent => Self::AGENT_TOKEN,
            ExecutionPath::Capability(name) => name,
        }
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExecutionPath> for String {
    fn from(path: ExecutionPath) -> Self {
        path.as_str().to_string()
    }
}

impl TryFrom<String> for ExecutionPath {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ExecutionPath::parse(&value).ok_or_else(|| format!("invalid execution path '{value}'"))
    }
}

/// Returns true for non-empty `[a-z0-9-]+` tokens (task ids and path tokens).
pub fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// One unit of plan work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable lowercase-hyphenated id, unique within a run.
    pub id: String,
    pub title: String,
    pub description: String,
    pub path: ExecutionPath,
    /// Higher is more urgent.
    pub priority: u32,
    pub status: TaskStatus,
    /// Last result text, if the task has been executed.
    pub output: Option<String>,
    pub updated_at: Timestamp,
}

/// The single current objective of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thesis {
    pub objective: String,
    pub rationale: String,
    pub success_signal: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Gate on exactly one risky task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    /// Human-readable description of what will run once approved.
    pub action: String,
    pub status: ApprovalStatus,
    pub requested_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl Approval {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// Free-text operator command waiting for the next cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub id: String,
    pub text: String,
    /// File paths or URLs the operator referenced alongside the text.
    #[serde(default)]
    pub attachments: Vec<String>,
    pub received_at: Timestamp,
}

/// Audit log entry kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ModeChanged { from: Mode, to: Mode },
    Status,
    PlanSync,
    Task { task_id: String, status: TaskStatus },
    Operator,
    Approval { task_id: String, status: ApprovalStatus },
    Decision,
    Cycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub at: Timestamp,
    pub kind: EventKind,
    pub message: String,
}

/// Last known health of a named capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityHealth {
    pub ready: bool,
    pub detail: Option<String>,
    pub last_ok_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub checked_at: Timestamp,
}
