//! The fixed, ordered step table and per-step setting resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Model used when neither the CLI, the step, nor the config names one.
pub const DEFAULT_MODEL: &str = "opus";
pub const DEFAULT_MAX_TURNS: u32 = 20;
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 10;

/// First step of a cycle.
pub const FIRST_STEP: u8 = 1;
/// Last step of a cycle.
pub const LAST_STEP: u8 = 9;

/// Stable key of each pipeline step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKey {
    StartCycle,
    StartIssue,
    WriteSpecs,
    Implement,
    Verify,
    CommitPush,
    #[serde(rename = "createPR")]
    CreatePr,
    #[serde(rename = "monitorCI")]
    MonitorCi,
    Merge,
}

impl StepKey {
    pub const ALL: [StepKey; 9] = [
        StepKey::StartCycle,
        StepKey::StartIssue,
        StepKey::WriteSpecs,
        StepKey::Implement,
        StepKey::Verify,
        StepKey::CommitPush,
        StepKey::CreatePr,
        StepKey::MonitorCi,
        StepKey::Merge,
    ];

    /// 1-based position in the cycle.
    pub fn number(self) -> u8 {
        match self {
            StepKey::StartCycle => 1,
            StepKey::StartIssue => 2,
            StepKey::WriteSpecs => 3,
            StepKey::Implement => 4,
            StepKey::Verify => 5,
            StepKey::CommitPush => 6,
            StepKey::CreatePr => 7,
            StepKey::MonitorCi => 8,
            StepKey::Merge => 9,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.number() == number)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepKey::StartCycle => "startCycle",
            StepKey::StartIssue => "startIssue",
            StepKey::WriteSpecs => "writeSpecs",
            StepKey::Implement => "implement",
            StepKey::Verify => "verify",
            StepKey::CommitPush => "commitPush",
            StepKey::CreatePr => "createPR",
            StepKey::MonitorCi => "monitorCI",
            StepKey::Merge => "merge",
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKey {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match Self::ALL.iter().copied().find(|key| key.as_str() == value) {
            Some(key) => Ok(key),
            None => bail!("unknown step key {value:?}"),
        }
    }
}

/// Reasoning effort passed to the agent via `CLAUDE_CODE_EFFORT_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn as_str(self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effort {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "low" => Ok(Effort::Low),
            "medium" => Ok(Effort::Medium),
            "high" => Ok(Effort::High),
            other => bail!("invalid effort {other:?} (must be one of: low, medium, high)"),
        }
    }
}

impl TryFrom<String> for Effort {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Per-step overrides from the `[steps.<key>]` config tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepOverride {
    pub max_turns: Option<u32>,
    pub timeout_min: Option<u64>,
    pub model: Option<String>,
    pub effort: Option<Effort>,
    pub skill: Option<String>,
}

/// Immutable definition of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub number: u8,
    pub key: StepKey,
    pub max_turns: u32,
    pub timeout_minutes: u64,
    pub model_override: Option<String>,
    pub effort_override: Option<Effort>,
    /// Skill directory name under the plugins root, appended as a system prompt.
    pub skill: Option<String>,
}

impl Step {
    fn from_override(key: StepKey, over: Option<&StepOverride>) -> Self {
        let over = over.cloned().unwrap_or_default();
        Self {
            number: key.number(),
            key,
            max_turns: over.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
            timeout_minutes: over.timeout_min.unwrap_or(DEFAULT_TIMEOUT_MINUTES),
            model_override: over.model.filter(|model| !model.trim().is_empty()),
            effort_override: over.effort,
            skill: over.skill.filter(|skill| !skill.trim().is_empty()),
        }
    }
}

/// Ordered table of all nine steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Steps {
    steps: Vec<Step>,
}

impl Steps {
    pub fn get(&self, number: u8) -> Option<&Step> {
        self.steps.iter().find(|step| step.number == number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }
}

/// Build the step table, applying any config overrides by step key.
pub fn build_steps(overrides: &BTreeMap<String, StepOverride>) -> Steps {
    let steps = StepKey::ALL
        .iter()
        .map(|key| Step::from_override(*key, overrides.get(key.as_str())))
        .collect();
    Steps { steps }
}

/// Three-tier resolution: CLI override, then per-step override, then global.
pub fn resolve_tier<T: Clone>(cli: Option<&T>, step: Option<&T>, global: T) -> T {
    cli.or(step).cloned().unwrap_or(global)
}

/// Settings the launcher needs after resolving every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSettings {
    pub model: String,
    pub effort: Option<Effort>,
    pub max_turns: u32,
    pub timeout_minutes: u64,
}

/// CLI-level and config-level defaults for the tiers above a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSettings {
    pub cli_model: Option<String>,
    pub cli_effort: Option<Effort>,
    pub model: Option<String>,
    pub effort: Option<Effort>,
}

impl StepSettings {
    pub fn resolve(step: &Step, global: &GlobalSettings) -> Self {
        let model = resolve_tier(
            global.cli_model.as_ref(),
            step.model_override.as_ref(),
            global
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        );
        // Effort has no hardcoded default: an unset tier leaves the agent's own.
        let effort = global
            .cli_effort
            .or(step.effort_override)
            .or(global.effort);
        Self {
            model,
            effort,
            max_turns: step.max_turns,
            timeout_minutes: step.timeout_minutes,
        }
    }
}
