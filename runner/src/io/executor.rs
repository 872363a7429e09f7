//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples step orchestration from the actual agent
//! backend (currently `claude -p`). Tests use scripted executors that return
//! predetermined results without spawning processes.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::steps::{GlobalSettings, Step, StepSettings};
use crate::core::types::{CycleState, StepResult};
use crate::io::process::{
    CommandOutput, DEFAULT_OUTPUT_LIMIT_BYTES, SupervisedLimits, run_command_supervised,
};
use crate::io::process_tree::{PidTracker, ProcessTable, kill_tree};
use crate::io::prompt::{PromptBuilder, StepPrompt};

/// Time between the graceful termination request and the forceful kill.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Exit code reported for an agent stopped at its step timeout, whatever it
/// exited with itself.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const EFFORT_ENV: &str = "CLAUDE_CODE_EFFORT_LEVEL";

/// Parameters for one step invocation.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub step: &'a Step,
    pub state: &'a CycleState,
    /// Issues escalated earlier in this process; step 2 must avoid them.
    pub escalated_issues: &'a BTreeSet<u64>,
}

/// Abstraction over agent execution backends.
pub trait Executor: Send + Sync {
    /// Run the agent for one step. A process that could not be spawned is a
    /// failed [`StepResult`], not an error; errors are reserved for problems
    /// no retry can fix (e.g. a missing skill file).
    fn execute(&self, request: &ExecRequest<'_>) -> Result<StepResult>;
}

/// Executor that spawns `claude` in the project directory.
pub struct ClaudeExecutor {
    program: OsString,
    project: PathBuf,
    prompts: PromptBuilder,
    global: GlobalSettings,
    tracker: PidTracker,
    table: Arc<dyn ProcessTable>,
    dry_run: bool,
}

impl ClaudeExecutor {
    pub fn new(
        project: impl Into<PathBuf>,
        prompts: PromptBuilder,
        global: GlobalSettings,
        tracker: PidTracker,
        table: Arc<dyn ProcessTable>,
        dry_run: bool,
    ) -> Self {
        Self {
            program: OsString::from("claude"),
            project: project.into(),
            prompts,
            global,
            tracker,
            table,
            dry_run,
        }
    }

    /// Use a different executable in place of `claude`.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }
}

impl Executor for ClaudeExecutor {
    #[instrument(skip_all, fields(step = request.step.number, key = %request.step.key))]
    fn execute(&self, request: &ExecRequest<'_>) -> Result<StepResult> {
        let step = request.step;
        let prompt = self
            .prompts
            .render(step, request.state, request.escalated_issues)
            .with_context(|| format!("build prompt for step {}", step.number))?;
        let settings = StepSettings::resolve(step, &self.global);
        let args = build_claude_args(&settings, &prompt);

        if self.dry_run {
            info!(
                model = %settings.model,
                max_turns = settings.max_turns,
                timeout_min = settings.timeout_minutes,
                "dry run, not launching agent"
            );
            return Ok(StepResult::dry_run());
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).current_dir(&self.project);
        if let Some(effort) = settings.effort {
            cmd.env(EFFORT_ENV, effort.as_str());
        }

        let limits = SupervisedLimits {
            timeout: Duration::from_secs(settings.timeout_minutes.saturating_mul(60)),
            grace: TERMINATION_GRACE,
            drain: TERMINATION_GRACE,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        };
        info!(model = %settings.model, max_turns = settings.max_turns, "launching agent");
        let started = Instant::now();
        let tracker = self.tracker.clone();
        let table = Arc::clone(&self.table);
        let outcome = run_command_supervised(
            cmd,
            limits,
            move |pid| tracker.track(pid),
            move |pid| kill_tree(table.as_ref(), pid).map(|_| ()),
        );
        let duration_secs = started.elapsed().as_secs_f64().round() as u64;

        let output = match outcome {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent could not be run");
                return Ok(StepResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("\n{err:#}"),
                    duration_secs,
                });
            }
        };
        let result = agent_result(&output, duration_secs, settings.timeout_minutes);
        info!(exit_code = result.exit_code, duration_secs, "agent finished");
        Ok(result)
    }
}

/// Turn captured agent output into a [`StepResult`]. A run stopped at the
/// timeout always fails, even if the agent exited cleanly on SIGTERM.
fn agent_result(output: &CommandOutput, duration_secs: u64, timeout_minutes: u64) -> StepResult {
    let mut stderr = output.stderr_lossy();
    let exit_code = if output.timed_out {
        warn!(timeout_min = timeout_minutes, "agent exceeded step timeout");
        stderr.push_str(&format!("\nStep timed out after {timeout_minutes} minutes"));
        TIMEOUT_EXIT_CODE
    } else {
        output.status.code().unwrap_or(1)
    };
    StepResult {
        exit_code,
        stdout: output.stdout_lossy(),
        stderr,
        duration_secs,
    }
}

/// Command-line arguments for one headless `claude` invocation.
pub fn build_claude_args(settings: &StepSettings, prompt: &StepPrompt) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        settings.model.clone(),
        "-p".to_string(),
        prompt.prompt.clone(),
        "--dangerously-skip-permissions".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        "--max-turns".to_string(),
        settings.max_turns.to_string(),
    ];
    if let Some(system_prompt) = &prompt.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt.clone());
    }
    args
}
