//! Orchestration for a single pipeline step.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::branch::issue_from_branch;
use crate::core::steps::{Step, StepKey};
use crate::core::types::{StatePatch, StepResult, TRUNK_BRANCH, Verb};
use crate::io::executor::ExecRequest;
use crate::orchestrator::Orchestrator;
use crate::postconditions::Gate;

static PR_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pull/(\d+)").expect("pull request pattern should be valid"));

/// `" (3min)"` for steps that ran longer than a minute.
fn duration_suffix(secs: u64) -> String {
    if secs > 60 {
        format!(" ({}min)", (secs + 30) / 60)
    } else {
        String::new()
    }
}

impl Orchestrator {
    /// Run step `number` once and report how the loop should move on.
    ///
    /// Preconditions are checked first; when they fail the agent is never
    /// launched. A successful run extracts the step's state patch, persists
    /// it and then runs the step's postcondition gate.
    #[instrument(skip(self))]
    pub fn run_step(&mut self, number: u8) -> Result<Verb> {
        let step = self
            .steps
            .get(number)
            .cloned()
            .ok_or_else(|| anyhow!("unknown step {number}"))?;
        info!("=== Step {}: {} ===", step.number, step.key);

        let state = self.load_state();
        let precondition = self.check_preconditions(&step, &state);
        if !precondition.ok {
            let reason = precondition.reason_or_unknown();
            warn!(reason, "preconditions failed");
            self.notify(&format!(
                "Step {} ({}) preconditions failed: {reason}",
                step.number, step.key
            ));
            if step.number > 1 {
                return self.bounce_to_previous(&step, reason, &state);
            }
            return Ok(Verb::Skip);
        }

        let state = self.patch_state(StatePatch {
            current_step: Some(step.number),
            ..StatePatch::default()
        })?;
        let issue = state
            .current_issue
            .map(|issue| format!(" (issue #{issue})"))
            .unwrap_or_default();
        self.notify(&format!(
            "Starting Step {}: {}{issue}...",
            step.number, step.key
        ));

        let result = self.executor.execute(&ExecRequest {
            step: &step,
            state: &state,
            escalated_issues: self.counters.escalated_issues(),
        })?;
        info!(
            exit_code = result.exit_code,
            duration_secs = result.duration_secs,
            "step exited"
        );
        if let Some(logs) = &self.step_logs {
            logs.record(step.key, &result);
        }
        if self.shutdown.is_requested() {
            info!("shutdown in progress, leaving the step unclassified");
            return Ok(Verb::Retry);
        }
        self.cleanup_processes()?;

        if result.exit_code != 0 {
            return self.handle_failure(&step, &result);
        }

        if let Some(soft) = self.rules.detect_soft_failure(&result.stdout) {
            warn!(reason = %soft.reason, "soft failure");
            self.notify(&format!(
                "Step {} ({}) soft failure: {}",
                step.number, step.key, soft.reason
            ));
            return self.handle_failure(&step, &result);
        }

        let mut patch = self.extract_state_patch(&step, &result);
        if patch.last_completed_step.is_none() {
            patch.last_completed_step = Some(step.number);
        }
        let state = self.patch_state(patch)?;

        if let Gate::Fail { label, reason } = self.check_postconditions(&step, &state)? {
            warn!(gate = label, reason = %reason, "postcondition failed");
            self.notify(&format!(
                "{label} validation failed after Step {}: {reason}. Retrying...",
                step.number
            ));
            let state = self.load_state();
            let count = state.retry_count(step.number) + 1;
            if count >= self.max_retries {
                let reason = format!("{label} validation failed after {} attempts", self.max_retries);
                return self.escalate(&step, &reason, &result.combined_output());
            }
            self.record_retry(&state, step.number, count)?;
            return Ok(Verb::Retry);
        }

        self.notify(&format!(
            "Step {} ({}) complete.{}",
            step.number,
            step.key,
            duration_suffix(result.duration_secs)
        ));
        Ok(Verb::Ok)
    }

    /// State changes implied by a successful run of `step`.
    ///
    /// The issue is derived from the branch the repository reports, never
    /// from the agent's free-text output.
    fn extract_state_patch(&self, step: &Step, result: &StepResult) -> StatePatch {
        match step.key {
            StepKey::StartCycle => StatePatch::issue_cleared(),
            StepKey::StartIssue => match self.repo.current_branch() {
                Ok(branch) if branch != TRUNK_BRANCH => match issue_from_branch(&branch) {
                    Some(issue) => StatePatch {
                        current_issue: Some(Some(issue)),
                        current_branch: Some(branch),
                        ..StatePatch::default()
                    },
                    None => {
                        warn!(branch = %branch, "branch does not name an issue");
                        StatePatch::default()
                    }
                },
                Ok(_) => StatePatch::default(),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "could not read branch after Step 2");
                    StatePatch::default()
                }
            },
            StepKey::WriteSpecs => match self.specs.latest_feature() {
                Ok(Some(feature)) => StatePatch {
                    feature_name: Some(Some(feature)),
                    ..StatePatch::default()
                },
                Ok(None) => StatePatch::default(),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "could not list feature specs");
                    StatePatch::default()
                }
            },
            StepKey::CreatePr => PR_URL
                .captures(&result.stdout)
                .and_then(|caps| caps.get(1))
                .and_then(|number| number.as_str().parse().ok())
                .map(|pr| StatePatch {
                    pr_number: Some(Some(pr)),
                    ..StatePatch::default()
                })
                .unwrap_or_default(),
            StepKey::Merge => StatePatch::cycle_reset(),
            StepKey::Implement | StepKey::Verify | StepKey::CommitPush | StepKey::MonitorCi => {
                StatePatch::default()
            }
        }
    }
}
