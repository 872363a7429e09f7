//! Loop-level tests for whole runner sessions.
//!
//! These tests go through `prepare_run` and `run_loop` with scripted
//! collaborators to verify startup hydration, cycle completion and the
//! failure-loop circuit breaker end to end.

use sdlc_runner::core::types::{CiStatus, StepResult};
use sdlc_runner::looping::LoopStop;
use sdlc_runner::policy::{CONSECUTIVE_ESCALATIONS, FailureLoopHalt};
use sdlc_runner::start::StartMode;
use sdlc_runner::test_support::{FakeRepository, Harness};

fn ok() -> StepResult {
    StepResult {
        exit_code: 0,
        stdout: r#"{"result":"done"}"#.to_string(),
        stderr: String::new(),
        duration_secs: 5,
    }
}

fn failed() -> StepResult {
    StepResult {
        exit_code: 1,
        stdout: String::new(),
        stderr: "tests failed".to_string(),
        duration_secs: 5,
    }
}

/// A session started on a branch whose PR is green resumes at the merge
/// and then stops because no issue is left.
#[test]
fn hydrated_session_merges_and_finishes() {
    let repo = FakeRepository::on_branch("5-add-search");
    repo.set_commits_ahead(1);
    repo.set_unpushed(Some(0));
    repo.set_pr_exists(true);
    repo.set_ci(CiStatus::Passing);
    repo.set_open_issues_sequence(vec![vec![5], vec![]]);
    let mut harness = Harness::new(repo.clone());
    harness.write_specs(
        "feature-add-search",
        &["requirements.md", "design.md", "tasks.md", "feature.gherkin"],
    );
    harness.executor().push_with(ok(), {
        let repo = repo.clone();
        move || repo.set_branch("main")
    });

    let mode = harness.orchestrator().prepare_run(false).expect("start");
    assert_eq!(
        mode,
        StartMode::Hydrated {
            issue: 5,
            last_completed_step: 8
        }
    );

    let stop = harness.orchestrator_mut().run_loop().expect("loop");

    assert_eq!(stop, LoopStop::NoOpenIssues);
    assert_eq!(harness.executor().calls(), vec![9]);
    let state = harness.orchestrator().load_state();
    assert_eq!(state.current_issue, None);
    assert_eq!(state.feature_name, None);
    assert_eq!(state.last_completed_step, 0);
    assert!(harness.notifier().contains("Step 9 (merge) complete."));
    assert!(!harness.orchestrator().paths().auto_mode_path.exists());
}

/// Two issues escalating back to back trip the breaker and leave the second
/// issue's state in place for inspection.
#[test]
fn consecutive_escalations_halt_the_session() {
    let repo = FakeRepository::on_branch("main");
    repo.set_open_issues_sequence(vec![vec![1, 2], vec![2]]);
    let mut harness = Harness::new(repo.clone());
    for branch in ["1-flaky-login", "2-flaky-search"] {
        harness.executor().push(ok());
        harness.executor().push_with(ok(), {
            let repo = repo.clone();
            move || repo.set_branch(branch)
        });
        for _ in 0..3 {
            harness.executor().push(failed());
        }
    }

    assert_eq!(
        harness.orchestrator().prepare_run(false).expect("start"),
        StartMode::Fresh
    );
    let err = harness.orchestrator_mut().run_loop().expect_err("halt");

    let halt = err.downcast_ref::<FailureLoopHalt>().expect("failure loop");
    assert_eq!(halt.kind, CONSECUTIVE_ESCALATIONS);
    assert!(halt.diagnostic.contains("Issues: #1, #2"));
    assert!(halt.diagnostic.contains("Last step: 3 (writeSpecs)"));
    assert_eq!(
        harness.executor().calls(),
        vec![1, 2, 3, 3, 3, 1, 2, 3, 3, 3]
    );

    let state = harness.orchestrator().load_state();
    assert_eq!(state.current_issue, Some(2));
    assert_eq!(state.current_branch, "2-flaky-search");
    assert!(harness.orchestrator().paths().auto_mode_path.exists());
    assert!(harness.notifier().contains("ESCALATION: Step 3 (writeSpecs) failed."));
}
