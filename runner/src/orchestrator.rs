//! The pipeline controller and its collaborators.
//!
//! [`Orchestrator`] owns everything one runner process needs: the step table,
//! the state store, the failure-loop counters and the collaborator handles.
//! Its behavior is split by concern across [`crate::step`],
//! [`crate::policy`], [`crate::preconditions`], [`crate::postconditions`],
//! [`crate::version_bump`] and [`crate::looping`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::core::counters::FailureCounters;
use crate::core::failure::{FailureRules, RATE_LIMIT_BACKOFF};
use crate::core::steps::Steps;
use crate::core::types::{CycleState, StatePatch};
use crate::io::executor::Executor;
use crate::io::init::ProjectPaths;
use crate::io::notify::Notifier;
use crate::io::process_tree::{ProcessSupervisor, ProcessTable};
use crate::io::repo::Repository;
use crate::io::specs::SpecsDir;
use crate::io::state_store::StateStore;
use crate::io::step_log::StepLogWriter;

/// Process supervisor shared between the executor, the loop and shutdown.
pub type SharedSupervisor = ProcessSupervisor<Arc<dyn ProcessTable>>;

/// Set once a shutdown signal arrived; the loop stops at the next boundary.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// Mark shutdown. Returns `false` if it was already requested.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// External systems the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub repo: Arc<dyn Repository>,
    pub executor: Arc<dyn Executor>,
    pub notifier: Arc<dyn Notifier>,
    pub processes: Arc<SharedSupervisor>,
}

/// Static settings for one runner process.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project: PathBuf,
    pub steps: Steps,
    pub rules: FailureRules,
    pub max_retries: u32,
    pub dry_run: bool,
    /// `None` disables per-step audit logs.
    pub step_logs: Option<StepLogWriter>,
    pub own_pid: u32,
}

pub struct Orchestrator {
    pub(crate) paths: ProjectPaths,
    pub(crate) store: StateStore,
    pub(crate) specs: SpecsDir,
    pub(crate) steps: Steps,
    pub(crate) rules: FailureRules,
    pub(crate) max_retries: u32,
    pub(crate) dry_run: bool,
    pub(crate) step_logs: Option<StepLogWriter>,
    pub(crate) counters: FailureCounters,
    pub(crate) rate_limit_backoff: Duration,
    pub(crate) shutdown: ShutdownFlag,
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) processes: Arc<SharedSupervisor>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.paths.root)
            .field("max_retries", &self.max_retries)
            .field("dry_run", &self.dry_run)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(settings: RunSettings, collaborators: Collaborators) -> Self {
        let paths = ProjectPaths::new(settings.project);
        Self {
            store: StateStore::new(paths.state_path.clone(), settings.own_pid),
            specs: SpecsDir::new(paths.specs_dir.clone()),
            paths,
            steps: settings.steps,
            rules: settings.rules,
            max_retries: settings.max_retries,
            dry_run: settings.dry_run,
            step_logs: settings.step_logs,
            counters: FailureCounters::new(settings.max_retries),
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
            shutdown: ShutdownFlag::default(),
            repo: collaborators.repo,
            executor: collaborators.executor,
            notifier: collaborators.notifier,
            processes: collaborators.processes,
        }
    }

    /// Override the rate-limit backoff (tests use zero).
    pub fn with_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn steps(&self) -> &Steps {
        &self.steps
    }

    pub fn counters(&self) -> &FailureCounters {
        &self.counters
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn load_state(&self) -> CycleState {
        self.store.load()
    }

    pub(crate) fn patch_state(&self, patch: StatePatch) -> Result<CycleState> {
        self.store.patch(patch)
    }

    pub(crate) fn notify(&self, message: &str) {
        self.notifier.notify(message);
    }

    /// Kill leftovers of the last agent run. Infrastructure errors propagate.
    pub(crate) fn cleanup_processes(&self) -> Result<()> {
        self.processes.cleanup()
    }

    pub(crate) fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        warn!(secs = duration.as_secs(), "backing off");
        thread::sleep(duration);
    }
}
