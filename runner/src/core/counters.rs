//! Process-lifetime counters that detect failure loops.

use std::collections::BTreeSet;

/// Consecutive escalations that trip the circuit breaker.
pub const MAX_CONSECUTIVE_ESCALATIONS: u32 = 2;

/// Runtime failure-loop counters. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureCounters {
    max_bounces: u32,
    bounce_count: u32,
    consecutive_escalations: u32,
    escalated_issues: BTreeSet<u64>,
}

impl FailureCounters {
    pub fn new(max_bounces: u32) -> Self {
        Self {
            max_bounces,
            bounce_count: 0,
            consecutive_escalations: 0,
            escalated_issues: BTreeSet::new(),
        }
    }

    /// Reset the per-cycle bounce counter.
    pub fn start_cycle(&mut self) {
        self.bounce_count = 0;
    }

    /// Record a step-back transition. Returns `true` once the bounce count
    /// exceeds the maximum and the caller must escalate.
    pub fn record_bounce(&mut self) -> bool {
        self.bounce_count += 1;
        self.bounce_count > self.max_bounces
    }

    /// Record an escalation of `issue`. Returns `true` when the circuit
    /// breaker trips.
    pub fn record_escalation(&mut self, issue: Option<u64>) -> bool {
        if let Some(issue) = issue {
            self.escalated_issues.insert(issue);
        }
        self.consecutive_escalations += 1;
        self.consecutive_escalations >= MAX_CONSECUTIVE_ESCALATIONS
    }

    /// A successful merge breaks any run of escalations.
    pub fn record_merge(&mut self) {
        self.consecutive_escalations = 0;
    }

    pub fn bounce_count(&self) -> u32 {
        self.bounce_count
    }

    pub fn max_bounces(&self) -> u32 {
        self.max_bounces
    }

    pub fn consecutive_escalations(&self) -> u32 {
        self.consecutive_escalations
    }

    pub fn escalated_issues(&self) -> &BTreeSet<u64> {
        &self.escalated_issues
    }

    pub fn is_escalated(&self, issue: u64) -> bool {
        self.escalated_issues.contains(&issue)
    }

    /// `#10, #20`, or `none` when nothing was escalated.
    pub fn escalated_list(&self) -> String {
        format_issue_list(&self.escalated_issues)
    }
}

pub fn format_issue_list(issues: &BTreeSet<u64>) -> String {
    if issues.is_empty() {
        return "none".to_string();
    }
    issues
        .iter()
        .map(|issue| format!("#{issue}"))
        .collect::<Vec<_>>()
        .join(", ")
}
