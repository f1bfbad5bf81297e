//! The plan document on disk (`.autopilot/PLAN.md`).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::plan::{MarkOutcome, PlanLine, mark_completed, parse_document, sanitize_plan};
use crate::io::atomic::write_atomic;

/// A proposed replacement plan contained no valid task lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRejected {
    pub reason: String,
}

impl fmt::Display for PlanRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan rejected: {}", self.reason)
    }
}

impl std::error::Error for PlanRejected {}

#[derive(Debug, Clone)]
pub struct PlanDocument {
    path: PathBuf,
}

impl PlanDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw document text. A missing file reads as empty.
    pub fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.path)
            .with_context(|| format!("read plan {}", self.path.display()))
    }

    pub fn parse(&self) -> Result<Vec<PlanLine>> {
        Ok(parse_document(&self.read()?))
    }

    /// Replace the whole document with the task lines found in `proposed`.
    ///
    /// Fails with [`PlanRejected`] (nothing written) when no task line survives.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn replace(&self, proposed: &str) -> Result<Vec<PlanLine>> {
        let Some(doc) = sanitize_plan(proposed) else {
            warn!("proposed plan has no valid task lines");
            return Err(PlanRejected {
                reason: "no valid task lines in planning response".to_string(),
            }
            .into());
        };
        write_atomic(&self.path, &doc)?;
        let lines = parse_document(&doc);
        info!(tasks = lines.len(), "plan replaced");
        Ok(lines)
    }

    /// Check task `id`'s box in place. Returns false if the line was missing.
    pub fn mark_completed(&self, id: &str) -> Result<bool> {
        let doc = self.read()?;
        match mark_completed(&doc, id) {
            MarkOutcome::Marked(updated) => {
                write_atomic(&self.path, &updated)?;
                debug!(task_id = id, "plan line checked");
                Ok(true)
            }
            MarkOutcome::AlreadyChecked => Ok(true),
            MarkOutcome::Missing => {
                warn!(task_id = id, "completed task has no plan line");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_document_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = PlanDocument::new(temp.path().join("PLAN.md"));
        assert_eq!(plan.read().expect("read"), "");
        assert!(plan.parse().expect("parse").is_empty());
    }

    #[test]
    fn replace_rejects_plans_without_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PLAN.md");
        fs::write(&path, "- [ ] keep | agent | Keep |\n").expect("write");
        let plan = PlanDocument::new(&path);

        let err = plan
            .replace("# Plan\n\nI could not come up with anything.\n")
            .unwrap_err();
        assert!(err.downcast_ref::<PlanRejected>().is_some());
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "- [ ] keep | agent | Keep |\n"
        );
    }

    #[test]
    fn replace_writes_sanitized_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = PlanDocument::new(temp.path().join("PLAN.md"));
        let lines = plan
            .replace("Here is the plan:\n```\n- [ ] one | agent | One | first\n\n\n- [ ] two | shell | Two |\n```\n")
            .expect("replace");

        assert_eq!(lines.len(), 2);
        assert_eq!(
            plan.read().expect("read"),
            "- [ ] one | agent | One | first\n\n- [ ] two | shell | Two |\n"
        );
    }

    #[test]
    fn mark_completed_preserves_other_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PLAN.md");
        let doc = "# notes\r\n- [ ] one | agent | One |\r\n- [ ] two | agent | Two |\r\n";
        fs::write(&path, doc).expect("write");
        let plan = PlanDocument::new(&path);

        assert!(plan.mark_completed("two").expect("mark"));
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "# notes\r\n- [ ] one | agent | One |\r\n- [x] two | agent | Two |\r\n"
        );
        assert!(!plan.mark_completed("ghost").expect("mark"));
    }
}
