//! Gates run after a step reported success.

use anyhow::Result;
use tracing::{info, warn};

use crate::core::steps::{Step, StepKey};
use crate::core::types::{CiStatus, CycleState, StatePatch};
use crate::orchestrator::Orchestrator;

/// Verdict of a postcondition gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Pass,
    Fail {
        /// Gate name used in notifications (`Spec`, `Push`, ...).
        label: &'static str,
        reason: String,
    },
}

impl Gate {
    fn fail(label: &'static str, reason: impl Into<String>) -> Self {
        Gate::Fail {
            label,
            reason: reason.into(),
        }
    }
}

impl Orchestrator {
    /// Verify the artifacts `step` was supposed to produce.
    pub(crate) fn check_postconditions(&self, step: &Step, state: &CycleState) -> Result<Gate> {
        let gate = match step.key {
            StepKey::WriteSpecs => self.spec_gate(state)?,
            StepKey::Implement => {
                let issue = state
                    .current_issue
                    .map_or_else(|| "unknown".to_string(), |issue| issue.to_string());
                if self.auto_commit_if_dirty(&format!("feat: implement issue #{issue}")) {
                    self.notify("Auto-committed implementation changes after Step 4.");
                }
                Gate::Pass
            }
            StepKey::CommitPush => self.push_gate(),
            StepKey::CreatePr => self.version_gate(state),
            StepKey::MonitorCi => match self.repo.ci_status() {
                CiStatus::Failing => Gate::fail("CI", "CI checks still failing after Step 8"),
                CiStatus::Unknown(err) => Gate::fail("CI", format!("Could not check CI status: {err}")),
                CiStatus::Passing | CiStatus::Pending | CiStatus::NoChecks => Gate::Pass,
            },
            StepKey::StartCycle
            | StepKey::StartIssue
            | StepKey::Verify
            | StepKey::Merge => Gate::Pass,
        };
        Ok(gate)
    }

    fn spec_gate(&self, state: &CycleState) -> Result<Gate> {
        let feature = match &state.feature_name {
            Some(name) => Some(name.clone()),
            None => self.specs.latest_feature()?,
        };
        if let Err(problem) = self.specs.check(feature.as_deref()) {
            return Ok(Gate::fail("Spec", problem.reason()));
        }
        if feature != state.feature_name {
            self.patch_state(StatePatch {
                feature_name: Some(feature),
                ..StatePatch::default()
            })?;
        }
        Ok(Gate::Pass)
    }

    fn push_gate(&self) -> Gate {
        let branch = match self.repo.current_branch() {
            Ok(branch) => branch,
            Err(err) => return Gate::fail("Push", format!("Push validation check failed: {err:#}")),
        };
        if let Err(err) = self.repo.fetch() {
            return Gate::fail("Push", format!("Push validation check failed: {err:#}"));
        }
        match self.repo.unpushed_commits(&branch) {
            Ok(0) => Gate::Pass,
            Ok(_) => Gate::fail("Push", "Unpushed commits remain after push"),
            Err(err) => Gate::fail("Push", format!("Push validation check failed: {err:#}")),
        }
    }

    fn version_gate(&self, state: &CycleState) -> Gate {
        if self.validate_version_bump().passes() {
            return Gate::Pass;
        }
        warn!("version file unchanged after Step 7, bumping deterministically");
        if self.perform_deterministic_version_bump(state) {
            info!("deterministic version bump recovered Step 7");
            self.notify("VERSION was not bumped by Step 7. Applied deterministic version bump.");
            return Gate::Pass;
        }
        Gate::fail("Version", "VERSION unchanged")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::{FakeRepository, Harness};

    fn feature_state(issue: u64) -> CycleState {
        let mut state = CycleState::new(1);
        state.current_issue = Some(issue);
        state.current_branch = format!("{issue}-feature");
        state
    }

    #[test]
    fn spec_gate_records_latest_feature() {
        let repo = FakeRepository::on_branch("3-feature");
        let harness = Harness::new(repo);
        harness.write_specs(
            "3-feature",
            &["requirements.md", "design.md", "tasks.md", "feature.gherkin"],
        );
        let step = harness.step(3);

        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(3))
            .expect("gate");

        assert_eq!(gate, Gate::Pass);
        assert_eq!(
            harness.orchestrator().load_state().feature_name.as_deref(),
            Some("3-feature")
        );
    }

    #[test]
    fn spec_gate_fails_on_missing_files() {
        let repo = FakeRepository::on_branch("3-feature");
        let harness = Harness::new(repo);
        harness.write_specs("3-feature", &["requirements.md"]);
        let step = harness.step(3);

        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(3))
            .expect("gate");

        assert_eq!(
            gate,
            Gate::Fail {
                label: "Spec",
                reason: "Missing spec files: design.md, tasks.md, feature.gherkin".to_string()
            }
        );
    }

    #[test]
    fn implement_gate_commits_dirty_work() {
        let repo = FakeRepository::on_branch("5-feature");
        repo.set_dirty(&["src/lib.rs"]);
        let harness = Harness::new(repo.clone());
        let step = harness.step(4);

        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(5))
            .expect("gate");

        assert_eq!(gate, Gate::Pass);
        assert_eq!(repo.commits(), vec!["feat: implement issue #5".to_string()]);
        assert!(
            harness
                .notifier()
                .contains("Auto-committed implementation changes after Step 4.")
        );
    }

    #[test]
    fn push_gate_fetches_then_requires_nothing_unpushed() {
        let repo = FakeRepository::on_branch("5-feature");
        repo.set_unpushed(Some(2));
        let harness = Harness::new(repo.clone());
        let step = harness.step(6);

        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(5))
            .expect("gate");
        assert_eq!(gate, Gate::fail("Push", "Unpushed commits remain after push"));
        assert_eq!(repo.fetches(), 1);

        repo.set_unpushed(None);
        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(5))
            .expect("gate");
        assert!(
            matches!(gate, Gate::Fail { reason, .. } if reason.starts_with("Push validation check failed"))
        );

        repo.set_unpushed(Some(0));
        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(5))
            .expect("gate");
        assert_eq!(gate, Gate::Pass);
    }

    #[test]
    fn version_gate_recovers_with_deterministic_bump() {
        let repo = FakeRepository::on_branch("42-feature");
        repo.set_labels(42, &["bug"]);
        let harness = Harness::new(repo.clone());
        fs::write(&harness.orchestrator().paths().version_path, "0.1.0\n").expect("VERSION");
        let step = harness.step(7);

        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(42))
            .expect("gate");

        assert_eq!(gate, Gate::Pass);
        assert_eq!(repo.commits(), vec!["chore: bump version to 0.1.1".to_string()]);
    }

    #[test]
    fn version_gate_fails_when_recovery_fails() {
        let repo = FakeRepository::on_branch("42-feature");
        repo.fail_issue_queries();
        let harness = Harness::new(repo);
        fs::write(&harness.orchestrator().paths().version_path, "0.1.0\n").expect("VERSION");
        let step = harness.step(7);

        let gate = harness
            .orchestrator()
            .check_postconditions(&step, &feature_state(42))
            .expect("gate");

        assert_eq!(gate, Gate::fail("Version", "VERSION unchanged"));
    }

    #[test]
    fn ci_gate_rejects_failing_and_unknown_status() {
        let repo = FakeRepository::on_branch("42-feature");
        let harness = Harness::new(repo.clone());
        let step = harness.step(8);

        repo.set_ci(CiStatus::Failing);
        assert_eq!(
            harness
                .orchestrator()
                .check_postconditions(&step, &feature_state(42))
                .expect("gate"),
            Gate::fail("CI", "CI checks still failing after Step 8")
        );

        repo.set_ci(CiStatus::Unknown("no pull requests found".to_string()));
        assert_eq!(
            harness
                .orchestrator()
                .check_postconditions(&step, &feature_state(42))
                .expect("gate"),
            Gate::fail("CI", "Could not check CI status: no pull requests found")
        );

        repo.set_ci(CiStatus::NoChecks);
        assert_eq!(
            harness
                .orchestrator()
                .check_postconditions(&step, &feature_state(42))
                .expect("gate"),
            Gate::Pass
        );
    }
}
