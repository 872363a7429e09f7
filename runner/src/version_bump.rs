//! Version-file postcondition of step 7 and its deterministic recovery.

use std::fs;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::CycleState;
use crate::core::version::{BumpTable, Version, compute_bump};
use crate::io::init::{VERSION_FILE, read_optional};
use crate::orchestrator::Orchestrator;

/// Outcome of comparing the version file against the trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// No version file, or it does not hold a `MAJOR.MINOR.PATCH` version.
    NothingToBump,
    Changed,
    Unchanged,
    /// The diff could not be computed; treated as passing.
    Unavailable(String),
}

impl VersionCheck {
    pub fn passes(&self) -> bool {
        !matches!(self, VersionCheck::Unchanged)
    }
}

impl Orchestrator {
    fn current_version(&self) -> Option<Version> {
        match read_optional(&self.paths.version_path) {
            Ok(Some(raw)) => Version::parse(&raw),
            Ok(None) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not read version file");
                None
            }
        }
    }

    #[instrument(skip(self))]
    pub fn validate_version_bump(&self) -> VersionCheck {
        if self.current_version().is_none() {
            return VersionCheck::NothingToBump;
        }
        match self.repo.diff_against_trunk(VERSION_FILE) {
            Ok(diff) if diff.trim().is_empty() => VersionCheck::Unchanged,
            Ok(_) => VersionCheck::Changed,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(err = %reason, "could not diff version file, assuming it was bumped");
                VersionCheck::Unavailable(reason)
            }
        }
    }

    /// Bump the version file from the issue's labels and milestone, then
    /// commit and push it.
    ///
    /// Returns `false` when nothing could be bumped or any step failed.
    #[instrument(skip(self, state), fields(issue = ?state.current_issue))]
    pub fn perform_deterministic_version_bump(&self, state: &CycleState) -> bool {
        match self.try_version_bump(state) {
            Ok(Some(version)) => {
                info!(%version, dry_run = self.dry_run, "deterministic version bump");
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "deterministic version bump failed");
                false
            }
        }
    }

    fn try_version_bump(&self, state: &CycleState) -> Result<Option<Version>> {
        let Some(current) = self.current_version() else {
            return Ok(None);
        };
        let Some(issue) = state.current_issue else {
            return Ok(None);
        };

        let labels = self.repo.issue_labels(issue)?;
        let milestone_open = self.repo.milestone_open_issues(issue)?;
        let table = read_optional(&self.paths.steering_tech_path)?
            .as_deref()
            .and_then(BumpTable::parse);
        let next = compute_bump(
            Some(&current.to_string()),
            &labels,
            milestone_open,
            table.as_ref(),
        )
        .ok_or_else(|| anyhow!("no bump computed for {current}"))?;

        if self.dry_run {
            return Ok(Some(next));
        }

        fs::write(&self.paths.version_path, format!("{next}\n"))
            .with_context(|| format!("write {}", self.paths.version_path.display()))?;
        self.repo
            .commit_paths_and_push(&[VERSION_FILE], &format!("chore: bump version to {next}"))?;
        Ok(Some(next))
    }
}
