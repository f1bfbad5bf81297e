//! Prompt builder for decision requests.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::run::Run;
use crate::core::types::{OperatorCommand, Task, Thesis};

const DISCOVERY_TEMPLATE: &str = include_str!("prompts/discovery.md");
const PLANNING_TEMPLATE: &str = include_str!("prompts/planning.md");
const CHOOSE_TEMPLATE: &str = include_str!("prompts/choose.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const OPERATING_TEMPLATE: &str = include_str!("prompts/operating.md");

/// Default prompt budget in bytes.
pub const DEFAULT_PROMPT_BUDGET: usize = 48_000;

/// Events included in prompts (most recent last).
const PROMPT_EVENT_COUNT: usize = 15;

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 5] = ["events", "summary", "plan", "tasks", "objective"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Discovery,
    Planning,
    Choose,
    Task,
    Operating,
}

impl PromptKind {
    fn template_name(self) -> &'static str {
        match self {
            PromptKind::Discovery => "discovery",
            PromptKind::Planning => "planning",
            PromptKind::Choose => "choose",
            PromptKind::Task => "task",
            PromptKind::Operating => "operating",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ObjectiveContext {
    objective: String,
    rationale: String,
    success_signal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    title: String,
    description: String,
    path: String,
    status: String,
    priority: u32,
    output: Option<String>,
}

impl From<&Task> for TaskContext {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            path: task.path.to_string(),
            status: task.status.to_string(),
            priority: task.priority,
            output: task.output.clone(),
        }
    }
}

impl From<&Thesis> for ObjectiveContext {
    fn from(thesis: &Thesis) -> Self {
        Self {
            objective: thesis.objective.clone(),
            rationale: thesis.rationale.clone(),
            success_signal: thesis.success_signal.clone(),
        }
    }
}

/// Everything a template may reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    objective: Option<ObjectiveContext>,
    directives: Vec<String>,
    plan: String,
    tasks: Vec<TaskContext>,
    candidates: Vec<TaskContext>,
    task: Option<TaskContext>,
    capabilities: Vec<String>,
    last_summary: Option<String>,
    events: Vec<String>,
}

impl PromptContext {
    pub fn from_run(run: &Run) -> Self {
        let skip = run.events.len().saturating_sub(PROMPT_EVENT_COUNT);
        Self {
            objective: run.thesis.as_ref().map(ObjectiveContext::from),
            tasks: run.tasks.iter().map(TaskContext::from).collect(),
            last_summary: run.last_summary.clone(),
            events: run
                .events
                .iter()
                .skip(skip)
                .map(|e| format!("{} {}", e.at.format("%Y-%m-%d %H:%M"), e.message))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_directives(mut self, commands: &[OperatorCommand]) -> Self {
        self.directives = commands
            .iter()
            .map(|c| {
                if c.attachments.is_empty() {
                    c.text.clone()
                } else {
                    format!("{} (attachments: {})", c.text, c.attachments.join(", "))
                }
            })
            .collect();
        self
    }

    pub fn with_plan(mut self, plan: &str) -> Self {
        self.plan = plan.trim().to_string();
        self
    }

    pub fn with_candidates(mut self, candidates: &[&Task]) -> Self {
        self.candidates = candidates.iter().map(|t| TaskContext::from(*t)).collect();
        self
    }

    /// Focus on `task`; the remaining tasks stay as background.
    pub fn with_task(mut self, task: &Task) -> Self {
        self.tasks.retain(|t| t.id != task.id);
        self.task = Some(TaskContext::from(task));
        self
    }

    pub fn with_capabilities<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.capabilities = names.into_iter().map(str::to_string).collect();
        self
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("discovery", DISCOVERY_TEMPLATE)
            .expect("discovery template should be valid");
        env.add_template("planning", PLANNING_TEMPLATE)
            .expect("planning template should be valid");
        env.add_template("choose", CHOOSE_TEMPLATE)
            .expect("choose template should be valid");
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("operating", OPERATING_TEMPLATE)
            .expect("operating template should be valid");
        Self { env }
    }

    fn render(&self, kind: PromptKind, ctx: &PromptContext) -> Result<String> {
        let template = self.env.get_template(kind.template_name())?;
        Ok(template.render(ctx)?)
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
///
/// Empty sections are omitted.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in matches.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = matches
            .get(i + 1)
            .and_then(|m| m.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if content.is_empty() {
            continue;
        }
        sections.push(ParsedSection {
            key: key.as_str().to_string(),
            required: kind.as_str() == "required",
            content,
        });
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in `DROP_ORDER`, then truncate the last section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len = total_len(&sections[..sections.len().saturating_sub(1)]);
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(12));
        last.content.truncate(keep);
        last.content.push_str("\n[truncated]");
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, kind: PromptKind, ctx: &PromptContext) -> Result<String> {
        let rendered = ENGINE.render(kind, ctx)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
