//! Failure classification rules.
//!
//! Two independent checks live here:
//!
//! - [`FailureRules::match_output`] scans combined step output against an
//!   ordered rule table; the first matching rule decides the action.
//! - [`FailureRules::detect_soft_failure`] inspects the stdout of a step that
//!   exited 0 for signs that it did not actually succeed.
//!
//! Both are pure: the policy layer turns their verdicts into side effects.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Tools whose denial is expected in headless runs and does not fail a step.
pub const DEFAULT_BENIGN_DENIALS: &[&str] = &["AskUserQuestion", "EnterPlanMode"];

/// Patterns that make a failure unrecoverable, in match order.
pub const DEFAULT_ESCALATION_PATTERNS: &[&str] = &[
    "context_window_exceeded",
    r"signal:\s*9",
    r"signal:\s*SIGKILL",
    "permission denied",
    r"(awaiting|requires?|requested) (interactive |user )?approval",
];

const RATE_LIMIT_PATTERN: &str = "rate_limit";

/// Backoff applied after a rate-limited step before it is retried.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Plain-text phrases that mark a step as failed despite exit code 0.
const TEXT_FAILURE_PATTERNS: &[(&str, &str)] = &[
    ("EnterPlanMode", r"EnterPlanMode called in headless session"),
    ("AskUserQuestion", r"AskUserQuestion called in auto-mode"),
];

/// What to do when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Abandon the cycle immediately.
    Escalate,
    /// Back off, then continue with the ordinary failure path.
    Wait,
}

/// One `(predicate, action)` entry of the rule table.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub label: String,
    pattern: Regex,
    pub action: RuleAction,
}

impl PatternRule {
    pub fn new(pattern: &str, action: RuleAction) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("compile failure pattern {pattern:?}"))?;
        Ok(Self {
            label: pattern.to_string(),
            pattern: regex,
            action,
        })
    }

    pub fn is_match(&self, output: &str) -> bool {
        self.pattern.is_match(output)
    }
}

/// Verdict of [`FailureRules::match_output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub label: String,
    pub action: RuleAction,
}

/// A step that exited 0 but did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFailure {
    pub reason: String,
}

/// Ordered rule table plus the benign-denial allowlist.
#[derive(Debug, Clone)]
pub struct FailureRules {
    rules: Vec<PatternRule>,
    benign_denials: Vec<String>,
    text_patterns: Vec<(String, Regex)>,
}

impl FailureRules {
    /// Build the table from configured data. Escalation rules keep their
    /// configured order and are always checked before the rate-limit rule.
    pub fn from_config<S: AsRef<str>>(escalation_patterns: &[S], benign_denials: &[S]) -> Result<Self> {
        let mut rules = escalation_patterns
            .iter()
            .map(|pattern| PatternRule::new(pattern.as_ref(), RuleAction::Escalate))
            .collect::<Result<Vec<_>>>()?;
        rules.push(PatternRule::new(RATE_LIMIT_PATTERN, RuleAction::Wait)?);

        let text_patterns = TEXT_FAILURE_PATTERNS
            .iter()
            .map(|(label, pattern)| {
                Regex::new(pattern)
                    .map(|regex| ((*label).to_string(), regex))
                    .with_context(|| format!("compile text failure pattern {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            benign_denials: benign_denials
                .iter()
                .map(|tool| tool.as_ref().to_string())
                .collect(),
            text_patterns,
        })
    }

    pub fn defaults() -> Result<Self> {
        Self::from_config(DEFAULT_ESCALATION_PATTERNS, DEFAULT_BENIGN_DENIALS)
    }

    /// First rule matching the combined output, if any.
    pub fn match_output(&self, output: &str) -> Option<RuleMatch> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(output))
            .map(|rule| RuleMatch {
                label: rule.label.clone(),
                action: rule.action,
            })
    }

    fn is_benign(&self, tool: &str) -> bool {
        self.benign_denials.iter().any(|benign| benign == tool)
    }

    /// Inspect the stdout of a step that exited 0.
    ///
    /// JSON output is judged only by its fields; anything else (including
    /// truncated JSON) falls back to the plain-text phrase table.
    pub fn detect_soft_failure(&self, stdout: &str) -> Option<SoftFailure> {
        match serde_json::from_str::<Value>(stdout) {
            Ok(Value::Object(object)) => self.detect_json_failure(&object),
            _ => self.detect_text_failure(stdout),
        }
    }

    fn detect_json_failure(&self, object: &serde_json::Map<String, Value>) -> Option<SoftFailure> {
        if object.get("subtype").and_then(Value::as_str) == Some("error_max_turns") {
            return Some(SoftFailure {
                reason: "error_max_turns".to_string(),
            });
        }

        let denied: Vec<&str> = object
            .get("permission_denials")
            .and_then(Value::as_array)
            .map(|denials| denials.iter().filter_map(denied_tool_name).collect())
            .unwrap_or_default();
        let serious: Vec<&str> = denied
            .into_iter()
            .filter(|tool| !self.is_benign(tool))
            .collect();
        if serious.is_empty() {
            return None;
        }
        Some(SoftFailure {
            reason: format!("permission_denials: {}", serious.join(", ")),
        })
    }

    fn detect_text_failure(&self, stdout: &str) -> Option<SoftFailure> {
        self.text_patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(stdout))
            .map(|(label, _)| SoftFailure {
                reason: format!("text_pattern: {label}"),
            })
    }
}

/// Denials are reported either as bare tool names or as `{"tool_name": ..}`.
fn denied_tool_name(denial: &Value) -> Option<&str> {
    match denial {
        Value::String(name) => Some(name.as_str()),
        Value::Object(object) => object.get("tool_name").and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rules() -> FailureRules {
        FailureRules::defaults().expect("default rules compile")
    }

    #[test]
    fn escalation_patterns_match_case_insensitively() {
        let rules = rules();
        for output in [
            "error: Context_Window_Exceeded",
            "process exited with signal: 9",
            "killed (signal:SIGKILL)",
            "bash: ./deploy.sh: Permission denied",
            "tool call is awaiting user approval",
        ] {
            let verdict = rules.match_output(output).expect(output);
            assert_eq!(verdict.action, RuleAction::Escalate, "{output}");
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let verdict = rules()
            .match_output("rate_limit hit, then context_window_exceeded")
            .expect("match");
        assert_eq!(verdict.label, "context_window_exceeded");
        assert_eq!(verdict.action, RuleAction::Escalate);
    }

    #[test]
    fn rate_limit_waits() {
        let verdict = rules()
            .match_output("API error: RATE_LIMIT exceeded")
            .expect("match");
        assert_eq!(verdict.action, RuleAction::Wait);
    }

    #[test]
    fn plan_mode_is_not_unrecoverable() {
        assert_eq!(
            rules().match_output("Attempted to call EnterPlanMode in headless mode"),
            None
        );
    }

    #[test]
    fn configured_patterns_replace_defaults() {
        let rules = FailureRules::from_config(&["out of credits"], &[]).expect("compile");
        assert!(rules.match_output("permission denied").is_none());
        assert_eq!(
            rules.match_output("Out Of Credits").map(|m| m.action),
            Some(RuleAction::Escalate)
        );
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = FailureRules::from_config(&["(unclosed"], &[]).expect_err("invalid");
        assert!(err.to_string().contains("(unclosed"));
    }

    #[test]
    fn max_turns_is_soft_failure() {
        let stdout = json!({"subtype": "error_max_turns", "session_id": "abc"}).to_string();
        let failure = rules().detect_soft_failure(&stdout).expect("soft failure");
        assert_eq!(failure.reason, "error_max_turns");
    }

    #[test]
    fn serious_denials_are_named_and_benign_ones_filtered() {
        let stdout = json!({
            "subtype": "success",
            "permission_denials": ["AskUserQuestion", "ToolA", "EnterPlanMode", "ToolB"],
        })
        .to_string();
        let failure = rules().detect_soft_failure(&stdout).expect("soft failure");
        assert_eq!(failure.reason, "permission_denials: ToolA, ToolB");
    }

    #[test]
    fn object_shaped_denials_use_tool_name() {
        let stdout = json!({
            "subtype": "success",
            "permission_denials": [
                {"tool_name": "EnterPlanMode", "tool_use_id": "x"},
                {"tool_name": "SeriousTool", "tool_use_id": "y"},
            ],
        })
        .to_string();
        let failure = rules().detect_soft_failure(&stdout).expect("soft failure");
        assert_eq!(failure.reason, "permission_denials: SeriousTool");
    }

    #[test]
    fn success_with_only_benign_or_no_denials_is_not_soft_failure() {
        let rules = rules();
        for stdout in [
            json!({"subtype": "success", "permission_denials": ["AskUserQuestion", "EnterPlanMode"]}),
            json!({"subtype": "success", "permission_denials": []}),
            json!({"subtype": "success", "result": "Everything worked"}),
        ] {
            assert_eq!(rules.detect_soft_failure(&stdout.to_string()), None);
        }
    }

    #[test]
    fn non_json_empty_and_truncated_output_are_not_soft_failures() {
        let rules = rules();
        assert_eq!(rules.detect_soft_failure("This is plain text output"), None);
        assert_eq!(rules.detect_soft_failure(""), None);
        assert_eq!(rules.detect_soft_failure(r#"{"subtype": "error_max_turns""#), None);
    }

    #[test]
    fn text_phrases_are_soft_failures() {
        let rules = rules();
        let failure = rules
            .detect_soft_failure("Some output\nEnterPlanMode called in headless session\nMore")
            .expect("soft failure");
        assert_eq!(failure.reason, "text_pattern: EnterPlanMode");

        let failure = rules
            .detect_soft_failure("AskUserQuestion called in auto-mode; skill needs a user")
            .expect("soft failure");
        assert_eq!(failure.reason, "text_pattern: AskUserQuestion");
    }

    #[test]
    fn json_verdict_takes_precedence_over_text_scan() {
        let stdout = json!({
            "subtype": "error_max_turns",
            "result": "EnterPlanMode called in headless session",
        })
        .to_string();
        let failure = rules().detect_soft_failure(&stdout).expect("soft failure");
        assert_eq!(failure.reason, "error_max_turns");
    }
}
