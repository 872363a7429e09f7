//! Retry, bounce and escalation policy.
//!
//! Everything resolves into a [`Verb`] except the circuit breaker, which
//! surfaces as a [`FailureLoopHalt`] error so the binary can stop the process
//! without touching the persisted cycle.

use std::error::Error;
use std::fmt;

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::core::counters::format_issue_list;
use crate::core::failure::RuleAction;
use crate::core::steps::Step;
use crate::core::types::{CycleState, StatePatch, StepResult, Verb};
use crate::io::init::remove_auto_mode;
use crate::orchestrator::Orchestrator;

/// Trailing output included in escalation diagnostics.
const ESCALATION_OUTPUT_CHARS: usize = 500;

/// Kind reported when two escalations happen back to back.
pub const CONSECUTIVE_ESCALATIONS: &str = "consecutive escalations";
/// Kind reported when no open issue is left that has not been escalated.
pub const ALL_ISSUES_ESCALATED: &str = "all issues escalated";

/// The runner detected it is failing in a loop and must stop.
///
/// Cycle state and the auto-mode flag are left as they were so the failure
/// can be inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureLoopHalt {
    pub kind: String,
    pub diagnostic: String,
}

impl fmt::Display for FailureLoopHalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failure loop detected ({})", self.kind)
    }
}

impl Error for FailureLoopHalt {}

/// Last `limit` characters of `output`.
fn output_tail(output: &str, limit: usize) -> &str {
    let count = output.chars().count();
    if count <= limit {
        return output;
    }
    match output.char_indices().nth(count - limit) {
        Some((index, _)) => &output[index..],
        None => output,
    }
}

impl Orchestrator {
    /// Log, clean up and notify a failure loop, returning the halt error.
    pub(crate) fn halt_failure_loop(&self, kind: &str, details: &[String]) -> anyhow::Error {
        let mut lines = vec![format!("FAILURE LOOP DETECTED: {kind}")];
        lines.extend(details.iter().cloned());
        lines.push(format!(
            "Consecutive escalations: {}",
            self.counters.consecutive_escalations()
        ));
        lines.push(format!("Escalated issues: {}", self.counters.escalated_list()));
        lines.push("State preserved for manual inspection.".to_string());
        let diagnostic = lines.join("\n");

        error!(kind, "{diagnostic}");
        if let Err(err) = self.cleanup_processes() {
            error!(err = %format!("{err:#}"), "process cleanup failed during halt");
        }
        self.notify(&diagnostic);
        FailureLoopHalt {
            kind: kind.to_string(),
            diagnostic,
        }
        .into()
    }

    /// Abandon the current cycle.
    ///
    /// Returns `Ok(Verb::Escalated)` after resetting state, or the
    /// [`FailureLoopHalt`] error when the circuit breaker trips.
    #[instrument(skip(self, step, output), fields(step = step.number))]
    pub(crate) fn escalate(&mut self, step: &Step, reason: &str, output: &str) -> Result<Verb> {
        if self.shutdown.is_requested() {
            info!(reason, "shutdown in progress, not escalating");
            return Ok(Verb::Retry);
        }
        let state = self.load_state();
        let tail = output_tail(output, ESCALATION_OUTPUT_CHARS);
        let tripped = self.counters.record_escalation(state.current_issue);

        if tripped {
            let mut details = vec![
                format!(
                    "Issues: {}",
                    format_issue_list(self.counters.escalated_issues())
                ),
                format!("Last step: {} ({})", step.number, step.key),
                format!("Reason: {reason}"),
            ];
            if !tail.is_empty() {
                details.push(format!("Last output: {tail}"));
            }
            return Err(self.halt_failure_loop(CONSECUTIVE_ESCALATIONS, &details));
        }

        warn!(reason, issue = ?state.current_issue, "escalating");
        self.cleanup_processes()?;
        self.auto_commit_if_dirty("chore: save partial work before escalation");
        if !self.dry_run
            && let Err(err) = self.repo.checkout_trunk()
        {
            warn!(err = %format!("{err:#}"), "failed to return to trunk after escalation");
        }

        let retries = serde_json::to_string(&state.retries).unwrap_or_else(|_| "{}".to_string());
        let mut lines = vec![
            format!("ESCALATION: Step {} ({}) failed.", step.number, step.key),
            format!("Reason: {reason}"),
            format!("Retries: {retries}"),
            format!("Branch: {}", state.current_branch),
            format!("Issue: {}", state.issue_label()),
        ];
        if !tail.is_empty() {
            lines.push(format!("Last output: ...{tail}"));
        }
        lines.push("Manual intervention required.".to_string());
        self.notify(&lines.join("\n"));

        remove_auto_mode(&self.paths);
        self.patch_state(StatePatch::cycle_reset())?;
        Ok(Verb::Escalated)
    }

    /// Classify a failed (or soft-failed) step and pick the next verb.
    #[instrument(skip(self, step, result), fields(step = step.number, exit_code = result.exit_code))]
    pub(crate) fn handle_failure(&mut self, step: &Step, result: &StepResult) -> Result<Verb> {
        // The signal thread owns the working tree and the state file now.
        if self.shutdown.is_requested() {
            info!("shutdown in progress, not classifying the failure");
            return Ok(Verb::Retry);
        }
        let output = result.combined_output();

        if let Some(matched) = self.rules.match_output(&output) {
            match matched.action {
                RuleAction::Escalate => {
                    let reason = format!("Matched unrecoverable pattern: {}", matched.label);
                    return self.escalate(step, &reason, &output);
                }
                RuleAction::Wait => {
                    self.notify(&format!(
                        "Rate limited on Step {}. Waiting {}s...",
                        step.number,
                        self.rate_limit_backoff.as_secs()
                    ));
                    self.sleep(self.rate_limit_backoff);
                }
            }
        }

        let state = self.load_state();
        if step.number > 1 {
            let precondition = self.check_preconditions(step, &state);
            if !precondition.ok {
                if self.counters.record_bounce() {
                    let reason = format!(
                        "Bounce loop: {} step-back transitions exceed threshold {}",
                        self.counters.bounce_count(),
                        self.counters.max_bounces()
                    );
                    return self.escalate(step, &reason, &output);
                }
                self.notify(&format!(
                    "Step {} preconditions failed: {}. Retrying Step {}. (bounce {}/{})",
                    step.number,
                    precondition.reason_or_unknown(),
                    step.number - 1,
                    self.counters.bounce_count(),
                    self.counters.max_bounces()
                ));
                return Ok(Verb::RetryPrevious);
            }
        }

        self.auto_commit_if_dirty(&format!("chore: save work before retry (step {})", step.number));

        let count = state.retry_count(step.number) + 1;
        if count >= self.max_retries {
            let reason = format!("Exhausted {} retries", self.max_retries);
            return self.escalate(step, &reason, &output);
        }
        self.record_retry(&state, step.number, count)?;
        self.notify(&format!(
            "Step {} failed (attempt {count}/{}). Retrying...",
            step.number, self.max_retries
        ));
        Ok(Verb::Retry)
    }

    /// Move back to the step whose artifacts `step` is missing.
    #[instrument(skip(self, step, state), fields(step = step.number))]
    pub(crate) fn bounce_to_previous(
        &mut self,
        step: &Step,
        reason: &str,
        state: &CycleState,
    ) -> Result<Verb> {
        let previous = match self.steps.get(step.number.saturating_sub(1)) {
            Some(previous) => previous.clone(),
            None => return Ok(Verb::Skip),
        };

        if self.counters.record_bounce() {
            let reason = format!(
                "Bounce loop: {} step-back transitions exceed threshold {} (precondition: {reason})",
                self.counters.bounce_count(),
                self.counters.max_bounces()
            );
            return self.escalate(&previous, &reason, "");
        }
        self.notify(&format!(
            "Retrying Step {} ({}) to produce required artifacts. (bounce {}/{})",
            previous.number,
            previous.key,
            self.counters.bounce_count(),
            self.counters.max_bounces()
        ));

        let count = state.retry_count(previous.number) + 1;
        if count >= self.max_retries {
            let reason = format!(
                "Precondition check for step {} failed {} times: {reason}",
                step.number, self.max_retries
            );
            return self.escalate(&previous, &reason, "");
        }

        let mut retries = state.retries.clone();
        retries.insert(previous.number, count);
        self.patch_state(StatePatch {
            current_step: Some(previous.number),
            retries: Some(retries),
            ..StatePatch::default()
        })?;
        Ok(Verb::RetryPrevious)
    }

    pub(crate) fn record_retry(&self, state: &CycleState, step: u8, count: u32) -> Result<()> {
        let mut retries = state.retries.clone();
        retries.insert(step, count);
        self.patch_state(StatePatch {
            retries: Some(retries),
            ..StatePatch::default()
        })?;
        Ok(())
    }

    /// Commit and push uncommitted work, ignoring runner-owned files.
    ///
    /// Best effort: returns whether a commit was made (or would have been in
    /// dry-run) and only logs failures.
    pub(crate) fn auto_commit_if_dirty(&self, message: &str) -> bool {
        let dirty = match self.repo.dirty_paths() {
            Ok(dirty) => dirty,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not inspect working tree for auto-commit");
                return false;
            }
        };
        if dirty.is_empty() {
            return false;
        }
        if self.dry_run {
            info!(message, "dry run, would auto-commit");
            return true;
        }
        match self.repo.commit_all_and_push(message) {
            Ok(committed) => {
                if committed {
                    info!(message, "auto-committed work");
                }
                committed
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), message, "auto-commit failed");
                false
            }
        }
    }
}
