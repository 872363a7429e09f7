//! Repository-introspection collaborator.
//!
//! The pipeline never shells out to `git` or `gh` directly; everything goes
//! through [`Repository`] so the policy can be exercised with a scripted fake.
//! Query failures are returned as errors and callers decide how conservative
//! to be.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::types::{CiStatus, TRUNK_BRANCH};
use crate::io::git::Git;
use crate::io::github::Gh;

pub trait Repository: Send + Sync {
    fn is_work_tree(&self) -> bool;
    fn current_branch(&self) -> Result<String>;
    /// Changed paths excluding runner-owned artifacts.
    fn dirty_paths(&self) -> Result<Vec<String>>;
    fn commits_ahead_of_trunk(&self) -> Result<usize>;
    /// Commits not on `origin/<branch>`; errors when the remote branch is missing.
    fn unpushed_commits(&self, branch: &str) -> Result<usize>;
    fn fetch(&self) -> Result<()>;
    fn pull(&self) -> Result<()>;
    fn checkout_trunk(&self) -> Result<()>;
    /// Stage everything, commit and push. Returns `false` when nothing was staged.
    fn commit_all_and_push(&self, message: &str) -> Result<bool>;
    /// Stage only `paths`, commit and push. Returns `false` when nothing was staged.
    fn commit_paths_and_push(&self, paths: &[&str], message: &str) -> Result<bool>;
    /// Diff of `path` against the trunk; empty when unchanged.
    fn diff_against_trunk(&self, path: &str) -> Result<String>;
    fn pr_exists(&self) -> bool;
    fn pr_state(&self) -> Result<String>;
    fn ci_status(&self) -> CiStatus;
    fn open_issues(&self) -> Result<Vec<u64>>;
    fn issue_labels(&self, issue: u64) -> Result<Vec<String>>;
    fn milestone_open_issues(&self, issue: u64) -> Result<Option<u64>>;
}

/// [`Repository`] backed by the `git` and `gh` command-line tools.
#[derive(Debug, Clone)]
pub struct CliRepository {
    git: Git,
    gh: Gh,
}

impl CliRepository {
    pub fn new(project: impl Into<PathBuf>) -> Self {
        let project = project.into();
        Self {
            git: Git::new(project.clone()),
            gh: Gh::new(project),
        }
    }
}

impl Repository for CliRepository {
    fn is_work_tree(&self) -> bool {
        self.git.is_inside_work_tree()
    }

    fn current_branch(&self) -> Result<String> {
        self.git.current_branch()
    }

    fn dirty_paths(&self) -> Result<Vec<String>> {
        self.git.meaningful_changes()
    }

    fn commits_ahead_of_trunk(&self) -> Result<usize> {
        self.git.commits_ahead_of(TRUNK_BRANCH)
    }

    fn unpushed_commits(&self, branch: &str) -> Result<usize> {
        self.git.unpushed_commits(branch)
    }

    fn fetch(&self) -> Result<()> {
        self.git.fetch()
    }

    fn pull(&self) -> Result<()> {
        self.git.pull()
    }

    fn checkout_trunk(&self) -> Result<()> {
        self.git.checkout_branch(TRUNK_BRANCH)
    }

    #[instrument(skip(self))]
    fn commit_all_and_push(&self, message: &str) -> Result<bool> {
        self.git.add_all()?;
        if !self.git.commit_staged(message)? {
            return Ok(false);
        }
        self.git.push()?;
        debug!("committed and pushed");
        Ok(true)
    }

    #[instrument(skip(self))]
    fn commit_paths_and_push(&self, paths: &[&str], message: &str) -> Result<bool> {
        self.git.add_paths(paths)?;
        if !self.git.commit_staged(message)? {
            return Ok(false);
        }
        self.git.push()?;
        debug!("committed and pushed");
        Ok(true)
    }

    fn diff_against_trunk(&self, path: &str) -> Result<String> {
        self.git.diff_against(TRUNK_BRANCH, path)
    }

    fn pr_exists(&self) -> bool {
        self.gh.pr_exists()
    }

    fn pr_state(&self) -> Result<String> {
        self.gh.pr_state()
    }

    fn ci_status(&self) -> CiStatus {
        self.gh.pr_checks()
    }

    fn open_issues(&self) -> Result<Vec<u64>> {
        self.gh.open_issue_numbers()
    }

    fn issue_labels(&self, issue: u64) -> Result<Vec<String>> {
        self.gh.issue_labels(issue)
    }

    fn milestone_open_issues(&self, issue: u64) -> Result<Option<u64>> {
        self.gh.milestone_open_issues(issue)
    }
}
