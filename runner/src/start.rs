//! Orchestration for starting (or resuming) a runner session.
//!
//! Starting validates the project, makes sure runner-owned files are ignored
//! by git, raises the auto-mode flag and then seeds the cycle state from the
//! repository itself before falling back to the state file.

use anyhow::{Result, bail};
use tracing::{info, instrument, warn};

use crate::core::types::{CycleState, StatePatch};
use crate::hydrate::{Hydration, detect_work};
use crate::io::init::{create_auto_mode, ensure_runner_artifacts_gitignored, remove_auto_mode};
use crate::orchestrator::Orchestrator;

/// How the session's starting state was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Default state on the trunk.
    Fresh,
    /// The previous branch was merged; the trunk was checked out.
    AfterMerge,
    /// Progress was reconstructed from the repository.
    Hydrated { issue: u64, last_completed_step: u8 },
    /// The state file was used as is (`--resume`).
    Resumed,
}

impl Orchestrator {
    /// Prepare the project and persist the state the loop starts from.
    #[instrument(skip(self))]
    pub fn prepare_run(&self, resume: bool) -> Result<StartMode> {
        let root = &self.paths.root;
        if !root.is_dir() {
            bail!("project_path does not exist: {}", root.display());
        }
        if !self.repo.is_work_tree() {
            bail!("project_path is not a git repository: {}", root.display());
        }

        let added = ensure_runner_artifacts_gitignored(&self.paths)?;
        if !added.is_empty() {
            info!(entries = ?added, "added runner artifacts to .gitignore");
        }
        create_auto_mode(&self.paths)?;

        let mode = match detect_work(self.repo.as_ref(), &self.specs, self.dry_run) {
            Hydration::Merged => {
                self.store.reset()?;
                self.notify("Detected merged PR. Checked out main, starting fresh cycle.");
                StartMode::AfterMerge
            }
            Hydration::InProgress(work) => {
                let retries = if resume && self.store.exists() {
                    self.load_state().retries
                } else {
                    if resume {
                        warn!(
                            "--resume specified but state file not found, starting with empty retry counters"
                        );
                    }
                    Default::default()
                };
                let state = CycleState {
                    current_issue: Some(work.issue),
                    current_branch: work.branch,
                    feature_name: work.feature_name,
                    last_completed_step: work.last_completed_step,
                    retries,
                    ..self.store.default_state()
                };
                self.store.save(&state)?;
                let next = work.last_completed_step + 1;
                self.notify(&format!(
                    "Detected in-progress work on issue #{} (step {} complete). Resuming from Step {next}.",
                    work.issue, work.last_completed_step
                ));
                StartMode::Hydrated {
                    issue: work.issue,
                    last_completed_step: work.last_completed_step,
                }
            }
            Hydration::Nothing if resume => {
                let state = self.load_state();
                let next = state.last_completed_step + 1;
                info!(
                    last_completed = state.last_completed_step,
                    issue = %state.issue_label(),
                    "resuming from state file"
                );
                self.notify(&format!("SDLC runner resuming from Step {next}."));
                StartMode::Resumed
            }
            Hydration::Nothing => {
                self.store.reset()?;
                self.notify("SDLC runner started.");
                StartMode::Fresh
            }
        };

        self.patch_state(StatePatch {
            runner_pid: Some(Some(self.store.pid())),
            ..StatePatch::default()
        })?;
        Ok(mode)
    }

    /// Tell the channel the runner died and drop the auto-mode flag.
    pub fn report_crash(&self, err: &anyhow::Error) {
        self.notify(&format!("SDLC runner crashed: {err:#}"));
        if let Err(err) = self.patch_state(StatePatch {
            runner_pid: Some(None),
            ..StatePatch::default()
        }) {
            warn!(err = %format!("{err:#}"), "could not clear runner pid");
        }
        remove_auto_mode(&self.paths);
    }
}
