//! Scripted collaborators and a temp-dir harness for orchestration tests.
//!
//! Every fake records what it was asked to do and answers from state the test
//! sets up front. Fakes are cheap to clone and share their state, so a test
//! can keep a handle while the orchestrator owns another.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use crate::core::failure::FailureRules;
use crate::core::steps::{Step, build_steps};
use crate::core::types::{CiStatus, StatePatch, StepResult, TRUNK_BRANCH};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::init::{REQUIRED_SPEC_FILES, create_auto_mode};
use crate::io::notify::Notifier;
use crate::io::process_tree::{ProcessSupervisor, ProcessTable, Termination};
use crate::io::repo::Repository;
use crate::io::step_log::StepLogWriter;
use crate::logging::ORCHESTRATION_LOG_FILE;
use crate::orchestrator::{Collaborators, Orchestrator, RunSettings};

const MAX_RETRIES: u32 = 3;
const LOG_DIR: &str = "logs";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct TableState {
    children: BTreeMap<u32, Vec<u32>>,
    failing_children: BTreeSet<u32>,
    gone: BTreeSet<u32>,
    denied: BTreeSet<u32>,
    command_lines: Vec<(u32, String)>,
    failing_patterns: BTreeSet<String>,
    terminated: Vec<u32>,
}

/// In-memory process table.
#[derive(Debug, Default)]
pub struct FakeProcessTable {
    state: Mutex<TableState>,
}

impl FakeProcessTable {
    pub fn add_child(&self, parent: u32, child: u32) {
        lock(&self.state).children.entry(parent).or_default().push(child);
    }

    pub fn fail_children_of(&self, pid: u32) {
        lock(&self.state).failing_children.insert(pid);
    }

    /// `pid` exits before it can be signalled.
    pub fn mark_gone(&self, pid: u32) {
        lock(&self.state).gone.insert(pid);
    }

    /// Signalling `pid` fails with a permission error.
    pub fn deny(&self, pid: u32) {
        lock(&self.state).denied.insert(pid);
    }

    pub fn add_command_line(&self, pid: u32, command_line: &str) {
        lock(&self.state)
            .command_lines
            .push((pid, command_line.to_string()));
    }

    pub fn fail_pattern(&self, pattern: &str) {
        lock(&self.state).failing_patterns.insert(pattern.to_string());
    }

    /// PIDs signalled so far, in order.
    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.state).terminated.clone()
    }
}

impl ProcessTable for FakeProcessTable {
    fn children_of(&self, pid: u32) -> Result<Vec<u32>> {
        let state = lock(&self.state);
        if state.failing_children.contains(&pid) {
            bail!("pgrep -P {pid} failed");
        }
        Ok(state.children.get(&pid).cloned().unwrap_or_default())
    }

    fn terminate(&self, pid: u32) -> Result<Termination> {
        let mut state = lock(&self.state);
        if state.denied.contains(&pid) {
            bail!("send SIGTERM to {pid}: EPERM: Operation not permitted");
        }
        if state.gone.contains(&pid) {
            return Ok(Termination::AlreadyGone);
        }
        state.terminated.push(pid);
        Ok(Termination::Signalled)
    }

    fn find_by_command_line(&self, pattern: &str) -> Result<Vec<u32>> {
        let state = lock(&self.state);
        if state.failing_patterns.contains(pattern) {
            bail!("pgrep -f {pattern} failed");
        }
        Ok(state
            .command_lines
            .iter()
            .filter(|(_, line)| line.contains(pattern))
            .map(|(pid, _)| *pid)
            .collect())
    }
}

#[derive(Debug)]
struct RepoState {
    branch: Result<String, String>,
    dirty: Vec<String>,
    commits_ahead: Result<usize, String>,
    /// `None` means the remote branch does not exist.
    unpushed: Option<usize>,
    ci: CiStatus,
    pr_exists: bool,
    pr_state: Option<String>,
    version_diff: Result<String, String>,
    labels: BTreeMap<u64, Vec<String>>,
    milestones: BTreeMap<u64, Option<u64>>,
    issue_queries_fail: bool,
    open_issues: VecDeque<Vec<u64>>,
    work_tree: bool,
    commits: Vec<String>,
    checkouts: usize,
    pulls: usize,
    fetches: usize,
}

/// Scriptable [`Repository`]. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeRepository {
    state: Arc<Mutex<RepoState>>,
}

impl FakeRepository {
    /// A clean work tree on `branch` with no remote branch, PR or issues.
    pub fn on_branch(branch: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(RepoState {
                branch: Ok(branch.to_string()),
                dirty: Vec::new(),
                commits_ahead: Ok(0),
                unpushed: None,
                ci: CiStatus::NoChecks,
                pr_exists: false,
                pr_state: None,
                version_diff: Ok(String::new()),
                labels: BTreeMap::new(),
                milestones: BTreeMap::new(),
                issue_queries_fail: false,
                open_issues: VecDeque::new(),
                work_tree: true,
                commits: Vec::new(),
                checkouts: 0,
                pulls: 0,
                fetches: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RepoState> {
        lock(&self.state)
    }

    pub fn set_branch(&self, branch: &str) {
        self.state().branch = Ok(branch.to_string());
    }

    pub fn fail_branch_query(&self) {
        self.state().branch = Err("fatal: not a git repository".to_string());
    }

    pub fn set_dirty(&self, paths: &[&str]) {
        self.state().dirty = paths.iter().map(ToString::to_string).collect();
    }

    pub fn set_commits_ahead(&self, count: usize) {
        self.state().commits_ahead = Ok(count);
    }

    pub fn fail_commits_ahead(&self) {
        self.state().commits_ahead = Err("unknown revision main".to_string());
    }

    pub fn set_unpushed(&self, count: Option<usize>) {
        self.state().unpushed = count;
    }

    pub fn set_ci(&self, status: CiStatus) {
        self.state().ci = status;
    }

    pub fn set_pr_exists(&self, exists: bool) {
        self.state().pr_exists = exists;
    }

    pub fn set_pr_state(&self, pr_state: &str) {
        self.state().pr_state = Some(pr_state.to_string());
    }

    pub fn set_version_diff(&self, diff: Result<&str, &str>) {
        self.state().version_diff = diff.map(ToString::to_string).map_err(ToString::to_string);
    }

    pub fn set_labels(&self, issue: u64, labels: &[&str]) {
        self.state()
            .labels
            .insert(issue, labels.iter().map(ToString::to_string).collect());
    }

    pub fn set_milestone_open(&self, issue: u64, open: Option<u64>) {
        self.state().milestones.insert(issue, open);
    }

    pub fn fail_issue_queries(&self) {
        self.state().issue_queries_fail = true;
    }

    /// Answers for successive `open_issues` calls; the last one repeats.
    pub fn set_open_issues_sequence(&self, sequence: Vec<Vec<u64>>) {
        self.state().open_issues = sequence.into();
    }

    pub fn set_work_tree(&self, work_tree: bool) {
        self.state().work_tree = work_tree;
    }

    /// Commit messages pushed so far.
    pub fn commits(&self) -> Vec<String> {
        self.state().commits.clone()
    }

    pub fn checkouts(&self) -> usize {
        self.state().checkouts
    }

    pub fn pulls(&self) -> usize {
        self.state().pulls
    }

    pub fn fetches(&self) -> usize {
        self.state().fetches
    }

    pub fn current_branch_name(&self) -> String {
        self.state().branch.clone().unwrap_or_default()
    }
}

impl Repository for FakeRepository {
    fn is_work_tree(&self) -> bool {
        self.state().work_tree
    }

    fn current_branch(&self) -> Result<String> {
        self.state().branch.clone().map_err(|err| anyhow!(err))
    }

    fn dirty_paths(&self) -> Result<Vec<String>> {
        Ok(self.state().dirty.clone())
    }

    fn commits_ahead_of_trunk(&self) -> Result<usize> {
        self.state().commits_ahead.clone().map_err(|err| anyhow!(err))
    }

    fn unpushed_commits(&self, branch: &str) -> Result<usize> {
        self.state()
            .unpushed
            .ok_or_else(|| anyhow!("unknown revision origin/{branch}"))
    }

    fn fetch(&self) -> Result<()> {
        self.state().fetches += 1;
        Ok(())
    }

    fn pull(&self) -> Result<()> {
        self.state().pulls += 1;
        Ok(())
    }

    fn checkout_trunk(&self) -> Result<()> {
        let mut state = self.state();
        state.branch = Ok(TRUNK_BRANCH.to_string());
        state.checkouts += 1;
        Ok(())
    }

    fn commit_all_and_push(&self, message: &str) -> Result<bool> {
        let mut state = self.state();
        if state.dirty.is_empty() {
            return Ok(false);
        }
        state.dirty.clear();
        state.commits.push(message.to_string());
        Ok(true)
    }

    fn commit_paths_and_push(&self, _paths: &[&str], message: &str) -> Result<bool> {
        self.state().commits.push(message.to_string());
        Ok(true)
    }

    fn diff_against_trunk(&self, _path: &str) -> Result<String> {
        self.state().version_diff.clone().map_err(|err| anyhow!(err))
    }

    fn pr_exists(&self) -> bool {
        self.state().pr_exists
    }

    fn pr_state(&self) -> Result<String> {
        self.state()
            .pr_state
            .clone()
            .ok_or_else(|| anyhow!("no pull requests found for branch"))
    }

    fn ci_status(&self) -> CiStatus {
        self.state().ci.clone()
    }

    fn open_issues(&self) -> Result<Vec<u64>> {
        let mut state = self.state();
        if state.open_issues.len() > 1 {
            return Ok(state.open_issues.pop_front().unwrap_or_default());
        }
        Ok(state.open_issues.front().cloned().unwrap_or_default())
    }

    fn issue_labels(&self, issue: u64) -> Result<Vec<String>> {
        let state = self.state();
        if state.issue_queries_fail {
            bail!("gh issue view {issue} failed");
        }
        Ok(state.labels.get(&issue).cloned().unwrap_or_default())
    }

    fn milestone_open_issues(&self, issue: u64) -> Result<Option<u64>> {
        let state = self.state();
        if state.issue_queries_fail {
            bail!("gh issue view {issue} failed");
        }
        Ok(state.milestones.get(&issue).copied().flatten())
    }
}

type SideEffect = Box<dyn FnOnce() + Send>;

/// [`Executor`] that replays queued results; an empty queue behaves like a
/// dry run.
#[derive(Default)]
pub struct ScriptedExecutor {
    queue: Mutex<VecDeque<(StepResult, Option<SideEffect>)>>,
    calls: Mutex<Vec<u8>>,
}

impl ScriptedExecutor {
    pub fn push(&self, result: StepResult) {
        lock(&self.queue).push_back((result, None));
    }

    /// Queue `result` and run `effect` when the step executes, standing in
    /// for what the agent would have changed.
    pub fn push_with(&self, result: StepResult, effect: impl FnOnce() + Send + 'static) {
        lock(&self.queue).push_back((result, Some(Box::new(effect))));
    }

    /// Step numbers executed so far.
    pub fn calls(&self) -> Vec<u8> {
        lock(&self.calls).clone()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest<'_>) -> Result<StepResult> {
        lock(&self.calls).push(request.step.number);
        let next = lock(&self.queue).pop_front();
        match next {
            Some((result, effect)) => {
                if let Some(effect) = effect {
                    effect();
                }
                Ok(result)
            }
            None => Ok(StepResult::dry_run()),
        }
    }
}

/// [`Notifier`] that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    /// Whether any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.messages)
            .iter()
            .any(|message| message.contains(needle))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }
}

/// An orchestrator over a temporary project directory and fake collaborators.
pub struct Harness {
    temp: TempDir,
    orchestrator: Orchestrator,
    executor: Arc<ScriptedExecutor>,
    notifier: Arc<RecordingNotifier>,
    table: Arc<FakeProcessTable>,
}

impl Harness {
    pub fn new(repo: FakeRepository) -> Self {
        let temp = tempfile::tempdir().expect("create temp project");
        let executor = Arc::new(ScriptedExecutor::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let table = Arc::new(FakeProcessTable::default());
        let own_pid = std::process::id();
        let shared_table: Arc<dyn ProcessTable> = table.clone();
        let settings = RunSettings {
            project: temp.path().to_path_buf(),
            steps: build_steps(&BTreeMap::new()),
            rules: FailureRules::defaults().expect("default failure rules"),
            max_retries: MAX_RETRIES,
            dry_run: false,
            step_logs: None,
            own_pid,
        };
        let collaborators = Collaborators {
            repo: Arc::new(repo),
            executor: executor.clone(),
            notifier: notifier.clone(),
            processes: Arc::new(ProcessSupervisor::new(shared_table, Vec::new(), own_pid, false)),
        };
        let orchestrator =
            Orchestrator::new(settings, collaborators).with_rate_limit_backoff(Duration::ZERO);
        Self {
            temp,
            orchestrator,
            executor,
            notifier,
            table,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.orchestrator.dry_run = true;
        self
    }

    /// Write step logs to `<project>/logs`.
    pub fn with_step_logs(mut self) -> Self {
        self.orchestrator.step_logs = Some(StepLogWriter::new(
            self.temp.path().join(LOG_DIR),
            1024 * 1024,
        ));
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }

    pub fn executor(&self) -> &ScriptedExecutor {
        &self.executor
    }

    pub fn notifier(&self) -> &RecordingNotifier {
        &self.notifier
    }

    pub fn process_table(&self) -> &FakeProcessTable {
        &self.table
    }

    pub fn step(&self, number: u8) -> Step {
        self.orchestrator
            .steps()
            .get(number)
            .cloned()
            .expect("known step")
    }

    /// Write non-empty `files` into the spec directory of `feature`.
    pub fn write_specs(&self, feature: &str, files: &[&str]) {
        let dir = self.orchestrator.paths().specs_dir.join(feature);
        fs::create_dir_all(&dir).expect("create feature dir");
        for file in files {
            fs::write(dir.join(file), format!("# {file}\n")).expect("write spec file");
        }
    }

    /// Write every required spec file of `feature` under `specs_dir`.
    pub fn write_spec_files(specs_dir: &Path, feature: &str) {
        let dir = specs_dir.join(feature);
        fs::create_dir_all(&dir).expect("create feature dir");
        for file in REQUIRED_SPEC_FILES {
            fs::write(dir.join(file), format!("# {file}\n")).expect("write spec file");
        }
    }

    /// Persist state as if `issue` was picked and `last_completed` finished.
    pub fn seed_issue(&self, issue: u64, last_completed: u8) {
        let branch = self
            .orchestrator
            .repo
            .current_branch()
            .expect("fake branch");
        self.orchestrator
            .patch_state(StatePatch {
                current_step: Some(last_completed),
                last_completed_step: Some(last_completed),
                current_issue: Some(Some(issue)),
                current_branch: Some(branch),
                ..StatePatch::default()
            })
            .expect("seed state");
    }

    pub fn create_auto_mode(&self) {
        create_auto_mode(self.orchestrator.paths()).expect("create auto-mode flag");
    }

    /// Step log file names, sorted.
    pub fn step_log_files(&self) -> Vec<String> {
        let dir = self.temp.path().join(LOG_DIR);
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != ORCHESTRATION_LOG_FILE)
            .collect();
        names.sort();
        names
    }
}
