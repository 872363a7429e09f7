//! Multi-cycle loop orchestration.
//!
//! One cycle walks the step cursor from the step after the last completed one
//! through the merge. Verbs returned by [`Orchestrator::run_step`] decide how
//! the cursor moves; failure loops stop the process through
//! [`crate::policy::FailureLoopHalt`].

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::cursor::StepCursor;
use crate::core::steps::{LAST_STEP, StepKey};
use crate::core::types::{StatePatch, Verb};
use crate::io::init::remove_auto_mode;
use crate::orchestrator::Orchestrator;
use crate::policy::ALL_ISSUES_ESCALATED;

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Every open issue is done.
    NoOpenIssues,
    /// A shutdown signal arrived.
    ShutDown,
    /// Dry runs stop after one cycle.
    DryRunComplete,
}

impl Orchestrator {
    /// Run cycles until no open issue remains, a shutdown is requested or a
    /// failure loop halts the runner.
    #[instrument(skip(self))]
    pub fn run_loop(&mut self) -> Result<LoopStop> {
        loop {
            if self.shutdown.is_requested() {
                return Ok(LoopStop::ShutDown);
            }
            if !self.dry_run
                && let Some(stop) = self.check_remaining_work()?
            {
                return Ok(stop);
            }

            self.run_cycle()?;
            if self.shutdown.is_requested() {
                return Ok(LoopStop::ShutDown);
            }

            let state = self.load_state();
            if state.current_step != 0 {
                self.patch_state(StatePatch {
                    current_step: Some(0),
                    last_completed_step: Some(0),
                    ..StatePatch::default()
                })?;
            }
            if self.dry_run {
                info!("dry run cycle complete");
                return Ok(LoopStop::DryRunComplete);
            }
        }
    }

    /// Stop when there is nothing left to work on; halt when everything left
    /// was escalated this session.
    fn check_remaining_work(&mut self) -> Result<Option<LoopStop>> {
        let open = match self.repo.open_issues() {
            Ok(open) => open,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not list open issues, assuming some remain");
                return Ok(None);
            }
        };
        if open.is_empty() {
            info!("no more open issues");
            self.notify("No more open issues in the project. SDLC runner complete.");
            self.patch_state(StatePatch {
                current_step: Some(0),
                ..StatePatch::default()
            })?;
            remove_auto_mode(&self.paths);
            return Ok(Some(LoopStop::NoOpenIssues));
        }
        let escalated = self.counters.escalated_issues();
        if !escalated.is_empty() && open.iter().all(|issue| escalated.contains(issue)) {
            let details = vec![
                format!(
                    "All open issues have been escalated: {}",
                    self.counters.escalated_list()
                ),
                "No non-escalated issues remain.".to_string(),
            ];
            return Err(self.halt_failure_loop(ALL_ISSUES_ESCALATED, &details));
        }
        Ok(None)
    }

    fn run_cycle(&mut self) -> Result<()> {
        self.counters.start_cycle();
        let state = self.load_state();
        let mut cursor = StepCursor::starting_after(state.last_completed_step);
        if state.last_completed_step > 0 && state.last_completed_step < LAST_STEP {
            info!(
                last_completed = state.last_completed_step,
                "continuing from step {}",
                state.last_completed_step + 1
            );
        }

        while let Some(number) = cursor.current() {
            if self.shutdown.is_requested() {
                return Ok(());
            }
            let mut verb = self.run_step(number)?;
            while verb == Verb::Retry && !self.shutdown.is_requested() {
                verb = self.run_step(number)?;
            }

            match verb {
                Verb::Retry => return Ok(()),
                Verb::RetryPrevious => cursor.step_back(),
                Verb::Escalated => {
                    info!("escalation triggered, stopping cycle");
                    return Ok(());
                }
                Verb::Skip => {
                    info!(step = number, "skipping step");
                    cursor.advance();
                }
                Verb::Ok => {
                    self.after_success(number)?;
                    cursor.advance();
                }
            }
        }
        Ok(())
    }

    fn after_success(&mut self, number: u8) -> Result<()> {
        if number == StepKey::StartIssue.number() {
            let state = self.load_state();
            if let Some(issue) = state.current_issue
                && self.counters.is_escalated(issue)
            {
                let details = vec![
                    format!("Step 2 selected issue #{issue} which was previously escalated."),
                    format!("Escalated issues: {}", self.counters.escalated_list()),
                ];
                return Err(self.halt_failure_loop(ALL_ISSUES_ESCALATED, &details));
            }
        }
        if number == StepKey::Merge.number() {
            self.counters.record_merge();
        }
        Ok(())
    }

    /// Run exactly one step (`--step N`).
    pub fn run_single(&mut self, number: u8) -> Result<Verb> {
        let verb = self.run_step(number)?;
        info!(step = number, %verb, "single step result");
        remove_auto_mode(&self.paths);
        Ok(verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CiStatus, StepResult};
    use crate::policy::FailureLoopHalt;
    use crate::test_support::{FakeRepository, Harness};

    fn ok() -> StepResult {
        StepResult {
            exit_code: 0,
            stdout: "{}".to_string(),
            stderr: String::new(),
            duration_secs: 1,
        }
    }

    fn failed() -> StepResult {
        StepResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
            duration_secs: 1,
        }
    }

    #[test]
    fn stops_when_no_issues_are_open() {
        let repo = FakeRepository::on_branch("main");
        let mut harness = Harness::new(repo);

        let stop = harness.orchestrator_mut().run_loop().expect("loop");

        assert_eq!(stop, LoopStop::NoOpenIssues);
        assert!(harness.executor().calls().is_empty());
        assert!(
            harness
                .notifier()
                .contains("No more open issues in the project. SDLC runner complete.")
        );
    }

    #[test]
    fn full_cycle_runs_every_step_in_order() {
        let repo = FakeRepository::on_branch("main");
        repo.set_open_issues_sequence(vec![vec![42], vec![]]);
        let mut harness = Harness::new(repo.clone());
        harness.executor().push(ok());
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_branch("42-add-login")
        });
        harness.executor().push_with(ok(), {
            let specs = harness.orchestrator().paths().specs_dir.clone();
            move || Harness::write_spec_files(&specs, "42-add-login")
        });
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_commits_ahead(1)
        });
        harness.executor().push(ok());
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_unpushed(Some(0))
        });
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_pr_exists(true)
        });
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_ci(CiStatus::Passing)
        });
        harness.executor().push(ok());

        let stop = harness.orchestrator_mut().run_loop().expect("loop");

        assert_eq!(stop, LoopStop::NoOpenIssues);
        assert_eq!(harness.executor().calls(), (1..=9).collect::<Vec<u8>>());
        let state = harness.orchestrator().load_state();
        assert_eq!(state.current_step, 0);
        assert_eq!(state.last_completed_step, 0);
        assert_eq!(state.current_issue, None);
        assert_eq!(harness.orchestrator().counters().consecutive_escalations(), 0);
    }

    #[test]
    fn resumes_after_last_completed_step() {
        let repo = FakeRepository::on_branch("42-add-login");
        repo.set_open_issues_sequence(vec![vec![42], vec![]]);
        repo.set_pr_exists(true);
        repo.set_ci(CiStatus::Passing);
        let mut harness = Harness::new(repo);
        harness.seed_issue(42, 7);
        harness.executor().push(ok());
        harness.executor().push(ok());

        harness.orchestrator_mut().run_loop().expect("loop");

        assert_eq!(harness.executor().calls(), vec![8, 9]);
    }

    #[test]
    fn escalated_issues_halt_the_loop() {
        let repo = FakeRepository::on_branch("main");
        repo.set_open_issues_sequence(vec![vec![7], vec![7]]);
        let mut harness = Harness::new(repo.clone());
        harness.executor().push(ok());
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_branch("7-flaky")
        });
        for _ in 0..3 {
            harness.executor().push(failed());
        }

        let err = harness.orchestrator_mut().run_loop().expect_err("halt");

        let halt = err.downcast_ref::<FailureLoopHalt>().expect("failure loop");
        assert_eq!(halt.kind, ALL_ISSUES_ESCALATED);
        assert!(halt.diagnostic.contains("All open issues have been escalated: #7"));
        assert_eq!(harness.executor().calls(), vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn retry_previous_moves_cursor_back() {
        let repo = FakeRepository::on_branch("42-x");
        repo.set_open_issues_sequence(vec![vec![42], vec![]]);
        let mut harness = Harness::new(repo.clone());
        harness.seed_issue(42, 3);
        // Step 4 has no specs, so the loop bounces to step 3 which writes them.
        harness.executor().push_with(ok(), {
            let specs = harness.orchestrator().paths().specs_dir.clone();
            move || Harness::write_spec_files(&specs, "42-x")
        });
        harness.executor().push(failed());
        harness.executor().push(failed());
        harness.executor().push(failed());

        harness.orchestrator_mut().run_loop().expect("loop");

        assert_eq!(&harness.executor().calls()[..2], &[3, 4]);
        assert_eq!(harness.orchestrator().counters().bounce_count(), 1);
    }

    #[test]
    fn dry_run_stops_after_one_cycle() {
        let repo = FakeRepository::on_branch("main");
        let mut harness = Harness::new(repo).dry_run();

        let stop = harness.orchestrator_mut().run_loop().expect("loop");

        assert_eq!(stop, LoopStop::DryRunComplete);
        assert_eq!(harness.orchestrator().load_state().current_step, 0);
    }

    #[test]
    fn shutdown_request_stops_before_next_cycle() {
        let repo = FakeRepository::on_branch("main");
        repo.set_open_issues_sequence(vec![vec![1]]);
        let mut harness = Harness::new(repo);
        harness.orchestrator().shutdown_flag().request();

        assert_eq!(
            harness.orchestrator_mut().run_loop().expect("loop"),
            LoopStop::ShutDown
        );
        assert!(harness.executor().calls().is_empty());
    }

    #[test]
    fn single_step_removes_auto_mode() {
        let repo = FakeRepository::on_branch("main");
        let mut harness = Harness::new(repo);
        harness.create_auto_mode();
        harness.executor().push(ok());

        assert_eq!(harness.orchestrator_mut().run_single(1).expect("verb"), Verb::Ok);
        assert!(!harness.orchestrator().paths().auto_mode_path.exists());
    }
}
