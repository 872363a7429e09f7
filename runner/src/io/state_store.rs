//! Durable cycle state (`.claude/sdlc-state.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::{CycleState, StatePatch};

/// Reads and writes [`CycleState`] for one project.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    pid: u32,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID of the runner process that owns this store.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Defaults for a fresh cycle owned by this process.
    pub fn default_state(&self) -> CycleState {
        CycleState::new(self.pid)
    }

    /// Load the state file. A missing, empty or corrupted file yields defaults.
    pub fn load(&self) -> CycleState {
        match self.try_load() {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(path = %self.path.display(), "no state file, using defaults");
                self.default_state()
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %format!("{err:#}"), "state file unreadable, using defaults");
                self.default_state()
            }
        }
    }

    fn try_load(&self) -> Result<Option<CycleState>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read state {}", self.path.display()));
            }
        };
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parse state {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Atomically write the state (temp file + rename).
    pub fn save(&self, state: &CycleState) -> Result<()> {
        debug!(
            path = %self.path.display(),
            step = state.current_step,
            last_completed = state.last_completed_step,
            issue = ?state.current_issue,
            "writing state"
        );
        let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// Merge `patch` into the stored state, stamp the transition time, persist.
    pub fn patch(&self, patch: StatePatch) -> Result<CycleState> {
        let mut state = self.load();
        patch.apply(&mut state);
        state.last_transition_at = Some(chrono::Utc::now().to_rfc3339());
        self.save(&state)?;
        Ok(state)
    }

    /// Overwrite the file with defaults.
    pub fn reset(&self) -> Result<CycleState> {
        let state = self.default_state();
        self.save(&state)?;
        Ok(state)
    }
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
