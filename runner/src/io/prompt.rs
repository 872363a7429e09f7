//! Per-step prompt rendering and skill loading.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::counters::format_issue_list;
use crate::core::steps::{Step, StepKey};
use crate::core::types::CycleState;

const TEMPLATES: [(StepKey, &str); 9] = [
    (StepKey::StartCycle, include_str!("prompts/startCycle.md")),
    (StepKey::StartIssue, include_str!("prompts/startIssue.md")),
    (StepKey::WriteSpecs, include_str!("prompts/writeSpecs.md")),
    (StepKey::Implement, include_str!("prompts/implement.md")),
    (StepKey::Verify, include_str!("prompts/verify.md")),
    (StepKey::CommitPush, include_str!("prompts/commitPush.md")),
    (StepKey::CreatePr, include_str!("prompts/createPR.md")),
    (StepKey::MonitorCi, include_str!("prompts/monitorCI.md")),
    (StepKey::Merge, include_str!("prompts/merge.md")),
];

const UNKNOWN: &str = "<unknown>";

/// Rendered input for one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPrompt {
    pub prompt: String,
    /// Skill instructions appended to the agent's system prompt.
    pub system_prompt: Option<String>,
}

/// Renders step prompts from the embedded templates.
pub struct PromptBuilder {
    env: Environment<'static>,
    plugins_path: PathBuf,
}

impl PromptBuilder {
    pub fn new(plugins_path: impl Into<PathBuf>) -> Result<Self> {
        let mut env = Environment::new();
        for (key, source) in TEMPLATES {
            env.add_template(key.as_str(), source)
                .with_context(|| format!("load prompt template {key}"))?;
        }
        Ok(Self {
            env,
            plugins_path: plugins_path.into(),
        })
    }

    /// Directory holding the skill's `SKILL.md` and its relative references.
    pub fn skill_root(&self, skill: &str) -> PathBuf {
        skill_root(&self.plugins_path, skill)
    }

    pub fn read_skill(&self, skill: &str) -> Result<String> {
        let path = self.skill_root(skill).join("SKILL.md");
        if !path.is_file() {
            return Err(anyhow!("Skill file not found: {}", path.display()));
        }
        fs::read_to_string(&path).with_context(|| format!("read skill {}", path.display()))
    }

    /// Render the prompt for `step`. Fails when the step names a skill that
    /// does not exist.
    pub fn render(
        &self,
        step: &Step,
        state: &CycleState,
        escalated_issues: &BTreeSet<u64>,
    ) -> Result<StepPrompt> {
        let skill_root = step
            .skill
            .as_deref()
            .map(|skill| self.skill_root(skill).display().to_string());
        let issue = state
            .current_issue
            .map(|issue| issue.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let branch = if state.current_branch.is_empty() {
            UNKNOWN
        } else {
            state.current_branch.as_str()
        };
        let escalated = (!escalated_issues.is_empty()).then(|| format_issue_list(escalated_issues));

        let template = self.env.get_template(step.key.as_str())?;
        let prompt = template
            .render(context! {
                issue => issue,
                branch => branch,
                skill_root => skill_root,
                escalated => escalated,
            })
            .with_context(|| format!("render prompt for step {}", step.number))?;

        let system_prompt = match step.skill.as_deref() {
            Some(skill) => Some(self.read_skill(skill)?),
            None => None,
        };
        debug!(step = step.number, bytes = prompt.len(), skill = ?step.skill, "rendered prompt");
        Ok(StepPrompt {
            prompt,
            system_prompt,
        })
    }
}

fn skill_root(plugins_path: &Path, skill: &str) -> PathBuf {
    plugins_path
        .join("plugins")
        .join("nmg-sdlc")
        .join("skills")
        .join(skill)
}
