//! Startup detection of work already in progress.
//!
//! Git and GitHub are the source of truth: the state file may be stale or
//! missing, but the branch, spec files, commits and pull request tell how far
//! the current issue got.

use tracing::{debug, info, instrument, warn};

use crate::core::branch::parse_feature_branch;
use crate::core::types::{CiStatus, TRUNK_BRANCH};
use crate::io::repo::Repository;
use crate::io::specs::{SpecsDir, missing_spec_files};

/// Progress reconstructed from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedWork {
    pub issue: u64,
    pub branch: String,
    pub feature_name: Option<String>,
    pub last_completed_step: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hydration {
    /// On the trunk, or on a branch that does not belong to an issue.
    Nothing,
    /// The branch's pull request was already merged; the trunk is checked out.
    Merged,
    InProgress(DetectedWork),
}

/// Probe artifacts from the lowest step upward and report the last step whose
/// output exists.
#[instrument(skip(repo, specs))]
pub fn detect_work(repo: &dyn Repository, specs: &SpecsDir, dry_run: bool) -> Hydration {
    let branch = match repo.current_branch() {
        Ok(branch) => branch,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "could not determine current branch");
            return Hydration::Nothing;
        }
    };
    if branch == TRUNK_BRANCH {
        debug!("on trunk, nothing to hydrate");
        return Hydration::Nothing;
    }
    let Some(feature) = parse_feature_branch(&branch) else {
        info!(branch = %branch, "branch is not <number>-<slug>, skipping detection");
        return Hydration::Nothing;
    };
    let issue = feature.issue;
    info!(branch = %branch, issue, "on feature branch");

    if repo.pr_state().is_ok_and(|state| state == "MERGED") {
        info!("pull request already merged, returning to trunk");
        if !dry_run
            && let Err(err) = repo.checkout_trunk().and_then(|()| repo.pull())
        {
            warn!(err = %format!("{err:#}"), "could not check out trunk after merged PR");
            return Hydration::Nothing;
        }
        return Hydration::Merged;
    }

    let mut last_completed_step = 2;
    let mut feature_name = None;

    match specs.match_slug(feature.slug) {
        Ok(Some(name)) if missing_spec_files(&specs.root().join(&name)).is_empty() => {
            last_completed_step = 3;
            feature_name = Some(name);
        }
        Ok(_) => {}
        Err(err) => debug!(err = %format!("{err:#}"), "could not list specs"),
    }

    // Steps 4 and 5 leave the same trace; assume only 4 ran.
    if last_completed_step >= 3 && repo.commits_ahead_of_trunk().is_ok_and(|ahead| ahead > 0) {
        last_completed_step = 4;
    }
    if last_completed_step >= 4 && repo.unpushed_commits(&branch).is_ok_and(|count| count == 0) {
        last_completed_step = 6;
    }
    if last_completed_step >= 6 && repo.pr_exists() {
        last_completed_step = 7;
    }
    if last_completed_step >= 7
        && matches!(repo.ci_status(), CiStatus::Passing | CiStatus::NoChecks)
    {
        last_completed_step = 8;
    }

    info!(
        last_completed_step,
        feature = feature_name.as_deref().unwrap_or("<unknown>"),
        "detected in-progress work"
    );
    Hydration::InProgress(DetectedWork {
        issue,
        branch,
        feature_name,
        last_completed_step,
    })
}
