//! Durable storage for the run aggregate.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::run::Run;
use crate::io::atomic::write_atomic;

/// Whole-record persistence for a [`Run`].
///
/// `load` never fails on missing or unreadable records: it returns a freshly
/// initialized run instead.
pub trait RunStore: Send + Sync {
    fn load(&self) -> Result<Run>;
    fn save(&self, run: &Run) -> Result<()>;
}

/// Stable run identifier of the form `run-<8 hex>`.
pub fn new_run_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("run-{}", &simple[..8])
}

/// JSON file store (`.autopilot/state/run.json`).
#[derive(Debug, Clone)]
pub struct FileRunStore {
    path: PathBuf,
}

impl FileRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }

    fn read(&self) -> Result<Run> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read run {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse run {}", self.path.display()))
    }
}

impl RunStore for FileRunStore {
    fn load(&self) -> Result<Run> {
        debug!(path = %self.path.display(), "loading run");
        if !self.path.exists() {
            let run = Run::new(new_run_id(), Utc::now());
            debug!(run_id = %run.run_id, "no run record; starting fresh");
            return Ok(run);
        }
        match self.read() {
            Ok(run) => {
                debug!(run_id = %run.run_id, mode = %run.mode, tasks = run.tasks.len(), "run loaded");
                Ok(run)
            }
            Err(err) => {
                let aside = self.corrupt_path();
                warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    err = %format!("{err:#}"),
                    "run record is unreadable; starting fresh"
                );
                if let Err(err) = fs::rename(&self.path, &aside) {
                    warn!(path = %self.path.display(), err = %err, "could not move run record aside");
                }
                Ok(Run::new(new_run_id(), Utc::now()))
            }
        }
    }

    fn save(&self, run: &Run) -> Result<()> {
        debug!(path = %self.path.display(), run_id = %run.run_id, mode = %run.mode, "writing run");
        let mut buf = serde_json::to_string_pretty(run).context("serialize run")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EventKind, Mode, Thesis};

    #[test]
    fn new_run_id_has_expected_shape() {
        let id = new_run_id();
        assert_eq!(id.len(), "run-".len() + 8);
        assert!(id.starts_with("run-"));
        assert!(id[4..].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn missing_record_yields_fresh_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRunStore::new(temp.path().join("state").join("run.json"));
        let run = store.load().expect("load");
        assert_eq!(run.mode, Mode::Discovery);
        assert!(run.thesis.is_none());
        assert!(!store.path().exists());
    }

    /// Saves a populated run and reads it back whole.
    #[test]
    fn run_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileRunStore::new(temp.path().join("run.json"));
        let now = Utc::now();
        let run = Run::new("run-abc12345", now)
            .with_thesis(Thesis {
                objective: "Ship the beta".to_string(),
                rationale: "users waiting".to_string(),
                success_signal: None,
                created_at: now,
            })
            .with_event(now, EventKind::Cycle, "cycle 1 finished");
        store.save(&run).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded, run);
    }

    #[test]
    fn corrupt_record_is_moved_aside() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        fs::write(&path, "{not json").expect("write");
        let store = FileRunStore::new(&path);

        let run = store.load().expect("load");
        assert_eq!(run.mode, Mode::Discovery);
        assert!(!path.exists());
        assert_eq!(
            fs::read_to_string(temp.path().join("run.json.corrupt")).expect("read"),
            "{not json"
        );
    }

    #[test]
    fn non_utf8_record_is_moved_aside() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        let bytes = [0xff, 0xfe, 0x00, b'{'];
        fs::write(&path, bytes).expect("write");
        let store = FileRunStore::new(&path);

        let run = store.load().expect("load");
        assert_eq!(run.mode, Mode::Discovery);
        assert!(run.thesis.is_none());
        assert!(!path.exists());
        assert_eq!(
            fs::read(temp.path().join("run.json.corrupt")).expect("read"),
            bytes.to_vec()
        );
    }

    #[test]
    fn unreadable_record_that_cannot_move_still_yields_fresh_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        // A directory cannot be read as a file nor renamed onto the
        // existing `run.json.corrupt` directory below.
        fs::create_dir(&path).expect("mkdir");
        fs::create_dir(temp.path().join("run.json.corrupt")).expect("mkdir aside");
        fs::write(temp.path().join("run.json.corrupt").join("keep"), "x").expect("write");
        let store = FileRunStore::new(&path);

        let run = store.load().expect("load");
        assert_eq!(run.mode, Mode::Discovery);
    }
}
