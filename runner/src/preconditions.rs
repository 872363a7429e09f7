//! Structural preconditions: does the artifact a step consumes exist?
//!
//! Query failures are treated conservatively per step: when a failure would
//! only hide missing work the check fails, when it is just noise the check
//! passes.

use tracing::debug;

use crate::core::steps::{Step, StepKey};
use crate::core::types::{CiStatus, CycleState, PreconditionResult, TRUNK_BRANCH};
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    pub fn check_preconditions(&self, step: &Step, state: &CycleState) -> PreconditionResult {
        let result = match step.key {
            StepKey::StartCycle | StepKey::CommitPush => PreconditionResult::ok(),
            StepKey::StartIssue => self.clean_trunk(),
            StepKey::WriteSpecs => self.feature_branch_with_issue(state),
            StepKey::Implement => match self.specs.check(state.feature_name.as_deref()) {
                Ok(()) => PreconditionResult::ok(),
                Err(problem) => PreconditionResult::fail(problem.reason()),
            },
            StepKey::Verify => self.implementation_committed(),
            StepKey::CreatePr => self.branch_pushed(),
            StepKey::MonitorCi => {
                if self.repo.pr_exists() {
                    PreconditionResult::ok()
                } else {
                    PreconditionResult::fail("No PR found for current branch")
                }
            }
            StepKey::Merge => match self.repo.ci_status() {
                CiStatus::Failing => PreconditionResult::fail("CI checks failing"),
                CiStatus::Unknown(_) => PreconditionResult::fail("Could not check PR status"),
                CiStatus::Passing | CiStatus::Pending | CiStatus::NoChecks => {
                    PreconditionResult::ok()
                }
            },
        };
        debug!(step = step.number, ok = result.ok, reason = ?result.reason, "preconditions");
        result
    }

    fn clean_trunk(&self) -> PreconditionResult {
        let dirty = match self.repo.dirty_paths() {
            Ok(dirty) => dirty,
            Err(err) => return PreconditionResult::fail(format!("Git check failed: {err:#}")),
        };
        let branch = match self.repo.current_branch() {
            Ok(branch) => branch,
            Err(err) => return PreconditionResult::fail(format!("Git check failed: {err:#}")),
        };
        if !dirty.is_empty() {
            return PreconditionResult::fail("Working tree is dirty");
        }
        if branch != TRUNK_BRANCH {
            return PreconditionResult::fail(format!("Expected main branch, on {branch}"));
        }
        PreconditionResult::ok()
    }

    fn feature_branch_with_issue(&self, state: &CycleState) -> PreconditionResult {
        match self.repo.current_branch() {
            Ok(branch) if branch == TRUNK_BRANCH => {
                PreconditionResult::fail("Still on main, expected feature branch")
            }
            Ok(_) if state.current_issue.is_none() => {
                PreconditionResult::fail("No current issue set in state")
            }
            Ok(_) => PreconditionResult::ok(),
            Err(err) => PreconditionResult::fail(format!("Git check failed: {err:#}")),
        }
    }

    fn implementation_committed(&self) -> PreconditionResult {
        match self.repo.current_branch() {
            Ok(branch) if branch == TRUNK_BRANCH => {
                return PreconditionResult::fail("On main, expected feature branch");
            }
            Ok(_) => {}
            Err(err) => return PreconditionResult::fail(format!("Git check failed: {err:#}")),
        }
        match self.repo.commits_ahead_of_trunk() {
            Ok(0) => PreconditionResult::fail("No commits ahead of main"),
            Ok(_) => PreconditionResult::ok(),
            // Without a local trunk ref there is nothing to compare against.
            Err(err) => {
                debug!(err = %format!("{err:#}"), "commits-ahead check unavailable");
                PreconditionResult::ok()
            }
        }
    }

    fn branch_pushed(&self) -> PreconditionResult {
        let branch = match self.repo.current_branch() {
            Ok(branch) => branch,
            Err(err) => return PreconditionResult::fail(format!("Git check failed: {err:#}")),
        };
        match self.repo.unpushed_commits(&branch) {
            Ok(0) => PreconditionResult::ok(),
            Ok(_) => PreconditionResult::fail("Unpushed commits exist"),
            Err(_) => PreconditionResult::fail("Remote branch not found, push first"),
        }
    }
}
