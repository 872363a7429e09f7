//! Git adapter for runner commands.
//!
//! The runner only needs a handful of git queries and mutations, so we keep a
//! small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::artifacts::meaningful_changes;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const GIT_OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `true` when the workdir is inside a git work tree.
    pub fn is_inside_work_tree(&self) -> bool {
        self.run_capture(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Changed paths that are not runner-owned artifacts.
    pub fn meaningful_changes(&self) -> Result<Vec<String>> {
        let paths: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        Ok(meaningful_changes(&paths)
            .into_iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect())
    }

    /// Number of commits on `HEAD` that are not on `base`.
    pub fn commits_ahead_of(&self, base: &str) -> Result<usize> {
        let range = format!("{base}..HEAD");
        let out = self.run_capture(&["log", &range, "--oneline"])?;
        Ok(count_lines(&out))
    }

    /// Commits on `HEAD` missing from `origin/<branch>`. Errors when the
    /// remote branch does not exist.
    pub fn unpushed_commits(&self, branch: &str) -> Result<usize> {
        let range = format!("origin/{branch}..HEAD");
        let out = self.run_capture(&["log", &range, "--oneline"])?;
        Ok(count_lines(&out))
    }

    /// Diff of `path` between `base` and the working tree.
    pub fn diff_against(&self, base: &str, path: &str) -> Result<String> {
        self.run_capture(&["diff", base, "--", path])
    }

    pub fn fetch(&self) -> Result<()> {
        self.run_checked(&["fetch"])?;
        Ok(())
    }

    pub fn pull(&self) -> Result<()> {
        self.run_checked(&["pull"])?;
        Ok(())
    }

    pub fn push(&self) -> Result<()> {
        self.run_checked(&["push"])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn add_paths(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!(message, "committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            let detail = if output.timed_out {
                "timed out".to_string()
            } else {
                output.stderr_lossy().trim().to_string()
            };
            return Err(anyhow!("git {} failed: {detail}", args.join(" ")));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, GIT_TIMEOUT, GIT_OUTPUT_LIMIT_BYTES)
    }
}

fn count_lines(out: &str) -> usize {
    out.lines().filter(|line| !line.trim().is_empty()).count()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
