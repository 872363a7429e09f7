//! Per-step audit logs in the log directory.
//!
//! Every executed step leaves one `<key>-<session>-<timestamp>.log` file with
//! the raw agent output. Logs are pruned oldest-first to stay under the disk
//! budget; the orchestration log is never pruned.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::steps::StepKey;
use crate::core::types::StepResult;
use crate::logging::ORCHESTRATION_LOG_FILE;

const SESSION_ID_LEN: usize = 12;

/// Writes step logs into one directory under a disk budget.
#[derive(Debug, Clone)]
pub struct StepLogWriter {
    dir: PathBuf,
    max_bytes: u64,
}

impl StepLogWriter {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the log for one step. Failures are logged, never returned.
    pub fn record(&self, key: StepKey, result: &StepResult) -> Option<PathBuf> {
        match self.try_record(key, result) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(step = %key, err = %format!("{err:#}"), "failed to write step log");
                None
            }
        }
    }

    #[instrument(skip(self, result))]
    fn try_record(&self, key: StepKey, result: &StepResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create log dir {}", self.dir.display()))?;
        if let Err(err) = enforce_max_disk(&self.dir, self.max_bytes) {
            warn!(err = %format!("{err:#}"), "log disk cleanup failed");
        }

        let session = extract_session_id(&result.stdout);
        let now = Utc::now();
        let filename = format!("{key}-{session}-{}.log", now.format("%Y-%m-%dT%H-%M-%S"));
        let contents = format!(
            "Step: {key}\nSession: {session}\nExit code: {}\nDuration: {}s\nTimestamp: {}\n---\n\
             === STDOUT ===\n{}\n\n=== STDERR ===\n{}\n",
            result.exit_code,
            result.duration_secs,
            now.to_rfc3339_opts(SecondsFormat::Millis, true),
            result.stdout,
            result.stderr,
        );
        let path = self.dir.join(&filename);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        info!(file = %filename, "step log written");
        Ok(path)
    }
}

/// First 12 characters of the agent's JSON `session_id`, or a random id.
pub fn extract_session_id(stdout: &str) -> String {
    let from_json = serde_json::from_str::<Value>(stdout)
        .ok()
        .and_then(|value| match value.get("session_id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        });
    match from_json {
        Some(id) => id.chars().take(SESSION_ID_LEN).collect(),
        None => format!("{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff),
    }
}

/// Delete the oldest step logs until the total size is at most `max_bytes`.
/// Returns the number of files removed.
pub fn enforce_max_disk(dir: &Path, max_bytes: u64) -> Result<usize> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".log") || name == ORCHESTRATION_LOG_FILE {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, meta.len(), entry.path()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));

    let mut total: u64 = entries.iter().map(|(_, size, _)| size).sum();
    let mut removed = 0;
    for (_, size, path) in entries {
        if total <= max_bytes {
            break;
        }
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        total = total.saturating_sub(size);
        removed += 1;
        info!(file = %path.display(), "pruned old log");
    }
    Ok(removed)
}
