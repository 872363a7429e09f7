//! Deterministic SDLC pipeline runner.
//!
//! Drives the nine-step development cycle (pick an issue, write specs,
//! implement, verify, push, open a PR, watch CI, merge) over a project
//! repository, one headless agent invocation per step.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use sdlc_runner::core::failure::FailureRules;
use sdlc_runner::core::steps::{Effort, GlobalSettings, build_steps};
use sdlc_runner::core::types::Verb;
use sdlc_runner::exit_codes;
use sdlc_runner::io::config::{RunnerConfig, load_config};
use sdlc_runner::io::executor::ClaudeExecutor;
use sdlc_runner::io::notify::DiscordNotifier;
use sdlc_runner::io::process_tree::{PgrepProcessTable, ProcessSupervisor, ProcessTable};
use sdlc_runner::io::prompt::PromptBuilder;
use sdlc_runner::io::repo::CliRepository;
use sdlc_runner::io::step_log::StepLogWriter;
use sdlc_runner::logging;
use sdlc_runner::looping::LoopStop;
use sdlc_runner::orchestrator::{Collaborators, Orchestrator, RunSettings};
use sdlc_runner::policy::FailureLoopHalt;
use sdlc_runner::shutdown::spawn_signal_listener;

#[derive(Parser, Debug)]
#[command(
    name = "sdlc-runner",
    version,
    about = "Deterministic SDLC pipeline runner"
)]
struct Cli {
    /// Runner config file (TOML).
    #[arg(long)]
    config: PathBuf,

    /// Log what each step would do without launching agents, committing or posting.
    #[arg(long)]
    dry_run: bool,

    /// Discord channel for status messages; overrides `discord_channel_id`.
    #[arg(long)]
    discord_channel: Option<String>,

    /// Run only step N (1-9), then exit.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(1..=9))]
    step: Option<u8>,

    /// Keep retry counters from the existing state file.
    #[arg(long)]
    resume: bool,

    /// Model for every step; beats per-step and global config.
    #[arg(long)]
    model: Option<String>,

    /// Effort for every step (low, medium, high); beats per-step and global config.
    #[arg(long)]
    effort: Option<Effort>,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let config = load_config(&cli.config)?;
    logging::init(&config.resolved_log_dir())?;
    info!(
        config = %cli.config.display(),
        project = %config.project_path.display(),
        dry_run = cli.dry_run,
        "sdlc-runner starting"
    );

    let mut orchestrator = build_orchestrator(cli, &config)?;
    let listener = spawn_signal_listener(orchestrator.shutdown_context())?;

    match drive(&mut orchestrator, cli) {
        Ok(Some(code)) => Ok(code),
        Ok(None) => {
            info!("waiting for shutdown to finish");
            // The signal thread exits the process once cleanup is done.
            if listener.join().is_err() {
                error!("signal thread panicked");
            }
            Ok(exit_codes::OK)
        }
        Err(err) => {
            if let Some(halt) = err.downcast_ref::<FailureLoopHalt>() {
                error!(kind = %halt.kind, "runner halted");
                eprintln!("{}", halt.diagnostic);
                return Ok(exit_codes::HALTED);
            }
            error!(err = %format!("{err:#}"), "runner crashed");
            orchestrator.report_crash(&err);
            Err(err)
        }
    }
}

/// Run the session. `None` means a shutdown signal stopped the loop.
fn drive(orchestrator: &mut Orchestrator, cli: &Cli) -> Result<Option<i32>> {
    orchestrator.prepare_run(cli.resume)?;

    if let Some(step) = cli.step {
        let verb = orchestrator.run_single(step)?;
        return Ok(Some(if verb == Verb::Ok {
            exit_codes::OK
        } else {
            exit_codes::STEP_NOT_OK
        }));
    }

    match orchestrator.run_loop()? {
        LoopStop::ShutDown => Ok(None),
        stop @ (LoopStop::NoOpenIssues | LoopStop::DryRunComplete) => {
            info!(?stop, "runner finished");
            Ok(Some(exit_codes::OK))
        }
    }
}

fn build_orchestrator(cli: &Cli, config: &RunnerConfig) -> Result<Orchestrator> {
    let own_pid = std::process::id();
    let table: Arc<dyn ProcessTable> = Arc::new(PgrepProcessTable);
    let processes = Arc::new(ProcessSupervisor::new(
        Arc::clone(&table),
        config.cleanup.process_patterns.clone(),
        own_pid,
        cli.dry_run,
    ));

    let prompts = PromptBuilder::new(&config.plugins_path).context("load step prompts")?;
    let global = GlobalSettings {
        cli_model: cli.model.clone(),
        cli_effort: cli.effort,
        model: Some(config.model.clone()),
        effort: config.effort,
    };
    let executor = ClaudeExecutor::new(
        &config.project_path,
        prompts,
        global,
        processes.tracker().clone(),
        table,
        cli.dry_run,
    );

    let channel = cli
        .discord_channel
        .clone()
        .or_else(|| config.discord_channel_id.clone());
    let notifier = DiscordNotifier::new(channel, cli.dry_run);

    let rules = FailureRules::from_config(
        &config.classifier.escalation_patterns,
        &config.classifier.benign_denials,
    )
    .context("compile classifier patterns")?;

    let settings = RunSettings {
        project: config.project_path.clone(),
        steps: build_steps(&config.steps),
        rules,
        max_retries: config.max_retries_per_step,
        dry_run: cli.dry_run,
        step_logs: Some(StepLogWriter::new(
            config.resolved_log_dir(),
            config.max_log_disk_bytes(),
        )),
        own_pid,
    };
    let collaborators = Collaborators {
        repo: Arc::new(CliRepository::new(&config.project_path)),
        executor: Arc::new(executor),
        notifier: Arc::new(notifier),
        processes,
    };
    Ok(Orchestrator::new(settings, collaborators))
}
