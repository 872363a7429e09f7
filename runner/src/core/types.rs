//! Shared deterministic types for runner core logic.
//!
//! These types define stable contracts between core components and the I/O
//! adapters. They do not depend on external state and must remain stable
//! across runs, since [`CycleState`] is the on-disk resume format.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Branch every cycle starts from and returns to.
pub const TRUNK_BRANCH: &str = "main";

/// Outcome of running one step, interpreted by the loop to move its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    /// The step ran and every postcondition held.
    Ok,
    /// Run the same step again.
    Retry,
    /// The previous step's output is missing; move back one step.
    RetryPrevious,
    /// The cycle was abandoned and state was reset.
    Escalated,
    /// Nothing to do for this step.
    Skip,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Ok => "ok",
            Verb::Retry => "retry",
            Verb::RetryPrevious => "retry-previous",
            Verb::Escalated => "escalated",
            Verb::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Raw result of one external agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_secs: u64,
}

impl StepResult {
    /// Result reported for a step that was not actually launched.
    pub fn dry_run() -> Self {
        Self {
            exit_code: 0,
            stdout: r#"{"result":"dry-run"}"#.to_string(),
            stderr: String::new(),
            duration_secs: 0,
        }
    }

    /// `stdout` and `stderr` joined the way the failure classifier scans them.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Structural judgment of whether the artifacts a step needs actually exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionResult {
    pub ok: bool,
    pub reason: Option<String>,
}

impl PreconditionResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }

    pub fn reason_or_unknown(&self) -> &str {
        self.reason.as_deref().unwrap_or("unknown reason")
    }
}

/// CI check status of the pull request for the current branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiStatus {
    Passing,
    Pending,
    Failing,
    /// The repository has no CI configured.
    NoChecks,
    /// The status query itself failed.
    Unknown(String),
}

/// Per-step retry counters, keyed by step number.
pub type Retries = BTreeMap<u8, u32>;

/// Persisted cycle progress (`.claude/sdlc-state.json`).
///
/// `retries` only holds entries for steps attempted in the current cycle, and
/// `current_branch` is the trunk exactly when `current_issue` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleState {
    pub current_step: u8,
    pub last_completed_step: u8,
    pub current_issue: Option<u64>,
    pub current_branch: String,
    pub feature_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub retries: Retries,
    pub last_transition_at: Option<String>,
    pub runner_pid: Option<u32>,
}

impl CycleState {
    pub fn new(runner_pid: u32) -> Self {
        Self {
            current_step: 0,
            last_completed_step: 0,
            current_issue: None,
            current_branch: TRUNK_BRANCH.to_string(),
            feature_name: None,
            pr_number: None,
            retries: Retries::new(),
            last_transition_at: None,
            runner_pid: Some(runner_pid),
        }
    }

    pub fn retry_count(&self, step: u8) -> u32 {
        self.retries.get(&step).copied().unwrap_or(0)
    }

    /// Human-readable issue reference for logs and notifications.
    pub fn issue_label(&self) -> String {
        match self.current_issue {
            Some(issue) => format!("#{issue}"),
            None => "none".to_string(),
        }
    }
}

/// Partial update merged into [`CycleState`] (`{...old, ...patch}`).
///
/// Nullable fields use `Option<Option<_>>`: the outer `None` leaves the field
/// untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePatch {
    pub current_step: Option<u8>,
    pub last_completed_step: Option<u8>,
    pub current_issue: Option<Option<u64>>,
    pub current_branch: Option<String>,
    pub feature_name: Option<Option<String>>,
    pub pr_number: Option<Option<u64>>,
    pub retries: Option<Retries>,
    pub runner_pid: Option<Option<u32>>,
}

impl StatePatch {
    /// Patch that returns the cycle to idle on the trunk with no issue.
    pub fn cycle_reset() -> Self {
        Self {
            current_step: Some(0),
            last_completed_step: Some(0),
            ..Self::issue_cleared()
        }
    }

    /// Patch that forgets the current issue without touching step tracking.
    pub fn issue_cleared() -> Self {
        Self {
            current_issue: Some(None),
            current_branch: Some(TRUNK_BRANCH.to_string()),
            feature_name: Some(None),
            pr_number: Some(None),
            retries: Some(Retries::new()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(self, state: &mut CycleState) {
        if let Some(step) = self.current_step {
            state.current_step = step;
        }
        if let Some(step) = self.last_completed_step {
            state.last_completed_step = step;
        }
        if let Some(issue) = self.current_issue {
            state.current_issue = issue;
        }
        if let Some(branch) = self.current_branch {
            state.current_branch = branch;
        }
        if let Some(feature) = self.feature_name {
            state.feature_name = feature;
        }
        if let Some(pr) = self.pr_number {
            state.pr_number = pr;
        }
        if let Some(retries) = self.retries {
            state.retries = retries;
        }
        if let Some(pid) = self.runner_pid {
            state.runner_pid = pid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_reset_restores_trunk_invariant() {
        let mut state = CycleState::new(7);
        state.current_step = 5;
        state.last_completed_step = 4;
        state.current_issue = Some(42);
        state.current_branch = "42-feature".to_string();
        state.retries.insert(4, 2);

        StatePatch::cycle_reset().apply(&mut state);

        assert_eq!(state.current_step, 0);
        assert_eq!(state.last_completed_step, 0);
        assert_eq!(state.current_issue, None);
        assert_eq!(state.current_branch, TRUNK_BRANCH);
        assert!(state.retries.is_empty());
        assert_eq!(state.runner_pid, Some(7));
    }

    #[test]
    fn empty_patch_leaves_state_untouched() {
        let mut state = CycleState::new(1);
        state.current_issue = Some(3);
        let before = state.clone();
        let patch = StatePatch::default();
        assert!(patch.is_empty());
        patch.apply(&mut state);
        assert_eq!(state, before);
    }

    #[test]
    fn state_serializes_with_camel_case_keys() {
        let mut state = CycleState::new(99);
        state.retries.insert(4, 1);
        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(json["currentStep"], 0);
        assert_eq!(json["currentBranch"], "main");
        assert_eq!(json["retries"]["4"], 1);
        assert_eq!(json["runnerPid"], 99);
        assert!(json.get("prNumber").is_none());
    }

    #[test]
    fn verb_display_matches_wire_names() {
        assert_eq!(Verb::RetryPrevious.to_string(), "retry-previous");
        assert_eq!(
            serde_json::to_string(&Verb::RetryPrevious).expect("json"),
            "\"retry-previous\""
        );
    }
}
