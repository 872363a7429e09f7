//! Signal-driven shutdown.
//!
//! SIGINT and SIGTERM are awaited on a dedicated thread running a
//! current-thread tokio runtime. The first signal saves whatever can be saved
//! and exits with [`exit_codes::OK`]; later signals are swallowed.

use std::process;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, instrument, warn};

use crate::core::types::StatePatch;
use crate::exit_codes;
use crate::io::init::{ProjectPaths, remove_auto_mode};
use crate::io::notify::Notifier;
use crate::io::repo::Repository;
use crate::io::state_store::StateStore;
use crate::orchestrator::{Orchestrator, SharedSupervisor, ShutdownFlag};

/// How long the final notification may take before the process exits anyway.
const NOTIFY_GRACE: Duration = Duration::from_secs(10);

/// Everything the signal thread needs, detached from the orchestrator so the
/// main thread can keep running the loop.
#[derive(Clone)]
pub struct ShutdownContext {
    paths: ProjectPaths,
    store: StateStore,
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    processes: Arc<SharedSupervisor>,
    flag: ShutdownFlag,
    dry_run: bool,
}

impl Orchestrator {
    pub fn shutdown_context(&self) -> ShutdownContext {
        ShutdownContext {
            paths: self.paths.clone(),
            store: self.store.clone(),
            repo: Arc::clone(&self.repo),
            notifier: Arc::clone(&self.notifier),
            processes: Arc::clone(&self.processes),
            flag: self.shutdown.clone(),
            dry_run: self.dry_run,
        }
    }
}

impl ShutdownContext {
    /// Best-effort cleanup after `signal`.
    ///
    /// Returns `false` without doing anything when a shutdown is already in
    /// progress. Nothing in here fails: every problem is logged and the next
    /// step still runs.
    #[instrument(skip(self))]
    pub fn shut_down(&self, signal: &str) -> bool {
        if !self.flag.request() {
            info!("shutdown already in progress, ignoring signal");
            return false;
        }
        info!("received {signal}, shutting down");

        if let Err(err) = self.processes.cleanup() {
            error!(err = %format!("{err:#}"), "process cleanup failed during shutdown");
        }
        self.commit_dirty_work(signal);

        let next_step = match self.store.patch(StatePatch {
            runner_pid: Some(None),
            ..StatePatch::default()
        }) {
            Ok(state) => state.last_completed_step + 1,
            Err(err) => {
                error!(err = %format!("{err:#}"), "could not persist state during shutdown");
                self.store.load().last_completed_step + 1
            }
        };

        self.notify_bounded(format!(
            "SDLC runner stopped ({signal}). Work saved. Resume with --resume to continue from Step {next_step}."
        ));
        remove_auto_mode(&self.paths);
        true
    }

    fn commit_dirty_work(&self, signal: &str) {
        let dirty = match self.repo.dirty_paths() {
            Ok(dirty) => dirty,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not inspect working tree during shutdown");
                return;
            }
        };
        if dirty.is_empty() {
            return;
        }
        if self.dry_run {
            info!("dry run, not committing work on shutdown");
            return;
        }
        match self
            .repo
            .commit_all_and_push(&format!("chore: save work on signal {signal}"))
        {
            Ok(true) => info!("committed work in progress"),
            Ok(false) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "could not commit work on shutdown"),
        }
    }

    /// Send `message` on its own thread and wait at most [`NOTIFY_GRACE`].
    fn notify_bounded(&self, message: String) {
        let notifier = Arc::clone(&self.notifier);
        let (done_tx, done_rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("shutdown-notify".to_string())
            .spawn(move || {
                notifier.notify(&message);
                // The receiver may have given up already.
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(_) => {
                if done_rx.recv_timeout(NOTIFY_GRACE).is_err() {
                    warn!("shutdown notification still pending, exiting anyway");
                }
            }
            Err(err) => warn!(err = %err, "could not spawn notification thread"),
        }
    }
}

async fn wait_for_signal() -> Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt()).context("listen for SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(name)
}

/// Listen for SIGINT/SIGTERM in the background and shut the process down on
/// the first one.
pub fn spawn_signal_listener(ctx: ShutdownContext) -> Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime for signal handling")?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            loop {
                match runtime.block_on(wait_for_signal()) {
                    Ok(name) => {
                        if ctx.shut_down(name) {
                            process::exit(exit_codes::OK);
                        }
                    }
                    Err(err) => {
                        error!(err = %format!("{err:#}"), "signal handling unavailable");
                        return;
                    }
                }
            }
        })
        .context("spawn signal listener thread")
}

#[cfg(test)]
mod tests {
    use crate::test_support::{FakeRepository, Harness};

    #[test]
    fn saves_work_and_clears_pid() {
        let repo = FakeRepository::on_branch("42-add-login");
        repo.set_dirty(&["src/lib.rs"]);
        let harness = Harness::new(repo.clone());
        harness.seed_issue(42, 4);
        harness.create_auto_mode();
        harness.process_table().add_child(500, 501);
        harness.orchestrator().processes.tracker().track(500);

        let ctx = harness.orchestrator().shutdown_context();
        assert!(ctx.shut_down("SIGTERM"));

        assert_eq!(repo.commits(), vec!["chore: save work on signal SIGTERM".to_string()]);
        assert_eq!(harness.process_table().terminated(), vec![501, 500]);
        let state = harness.orchestrator().load_state();
        assert_eq!(state.runner_pid, None);
        assert_eq!(state.current_issue, Some(42));
        assert!(!harness.orchestrator().paths().auto_mode_path.exists());
        assert!(harness.notifier().contains(
            "SDLC runner stopped (SIGTERM). Work saved. Resume with --resume to continue from Step 5."
        ));
        assert!(harness.orchestrator().shutdown_flag().is_requested());
    }

    #[test]
    fn second_signal_is_ignored() {
        let repo = FakeRepository::on_branch("main");
        let harness = Harness::new(repo);
        let ctx = harness.orchestrator().shutdown_context();

        assert!(ctx.shut_down("SIGINT"));
        let sent = harness.notifier().messages().len();
        assert!(!ctx.shut_down("SIGINT"));
        assert_eq!(harness.notifier().messages().len(), sent);
    }

    #[test]
    fn dry_run_commits_nothing() {
        let repo = FakeRepository::on_branch("main");
        repo.set_dirty(&["notes.md"]);
        let harness = Harness::new(repo.clone()).dry_run();

        assert!(harness.orchestrator().shutdown_context().shut_down("SIGINT"));
        assert!(repo.commits().is_empty());
    }
}
