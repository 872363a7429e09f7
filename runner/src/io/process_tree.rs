//! Process-tree discovery and termination.
//!
//! The agent spawns its own children (shells, test runners, dev servers). A
//! step is only finished once none of them survive, so the supervisor walks
//! the tree below the tracked agent PID and terminates it leaves first, then
//! sweeps for known stragglers by command line.

use std::collections::BTreeSet;
use std::fmt;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

const PROCESS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const PROCESS_QUERY_LIMIT: usize = 1024 * 1024;

/// Result of asking one process to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Signalled,
    /// The process had already exited.
    AlreadyGone,
}

/// Access to the operating system's process table.
pub trait ProcessTable: Send + Sync {
    /// Direct children of `pid`.
    fn children_of(&self, pid: u32) -> Result<Vec<u32>>;
    /// Send a graceful termination request to `pid`.
    fn terminate(&self, pid: u32) -> Result<Termination>;
    /// PIDs whose full command line contains `pattern`.
    fn find_by_command_line(&self, pattern: &str) -> Result<Vec<u32>>;
}

impl<T: ProcessTable + ?Sized> ProcessTable for Arc<T> {
    fn children_of(&self, pid: u32) -> Result<Vec<u32>> {
        (**self).children_of(pid)
    }

    fn terminate(&self, pid: u32) -> Result<Termination> {
        (**self).terminate(pid)
    }

    fn find_by_command_line(&self, pattern: &str) -> Result<Vec<u32>> {
        (**self).find_by_command_line(pattern)
    }
}

/// Send `signal` to `pid`.
///
/// `ESRCH` means the process already exited and is reported as
/// [`Termination::AlreadyGone`]; every other errno is an error.
pub fn send_signal(pid: u32, signal: Signal) -> Result<Termination> {
    // 0 and negative values address process groups, not a single process.
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| anyhow!("refusing to signal pid {pid}"))?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(Termination::Signalled),
        Err(Errno::ESRCH) => Ok(Termination::AlreadyGone),
        Err(errno) => Err(errno).with_context(|| format!("send {signal:?} to {pid}")),
    }
}

/// [`ProcessTable`] backed by `pgrep` for lookups and `kill(2)` for signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgrepProcessTable;

impl PgrepProcessTable {
    fn pgrep(args: &[&str]) -> Result<Vec<u32>> {
        let mut cmd = Command::new("pgrep");
        cmd.args(args);
        let output = run_command_with_timeout(cmd, PROCESS_QUERY_TIMEOUT, PROCESS_QUERY_LIMIT)?;
        match output.status.code() {
            Some(0) => Ok(parse_pid_list(&output.stdout_lossy())),
            // pgrep exits 1 when nothing matched.
            Some(1) => Ok(Vec::new()),
            code => bail!(
                "pgrep {} failed (exit {code:?}): {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ),
        }
    }
}

impl ProcessTable for PgrepProcessTable {
    fn children_of(&self, pid: u32) -> Result<Vec<u32>> {
        Self::pgrep(&["-P", &pid.to_string()])
    }

    fn terminate(&self, pid: u32) -> Result<Termination> {
        send_signal(pid, Signal::SIGTERM)
    }

    fn find_by_command_line(&self, pattern: &str) -> Result<Vec<u32>> {
        Self::pgrep(&["-f", "--", pattern])
    }
}

fn parse_pid_list(raw: &str) -> Vec<u32> {
    raw.split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Direct children of `pid`; any lookup failure yields an empty list.
pub fn get_children(table: &dyn ProcessTable, pid: u32) -> Vec<u32> {
    match table.children_of(pid) {
        Ok(children) => children,
        Err(err) => {
            debug!(pid, err = %err, "child lookup failed");
            Vec::new()
        }
    }
}

/// `pid` and all its descendants in post-order: every descendant appears
/// before its ancestors and `pid` comes last.
pub fn get_tree(table: &dyn ProcessTable, pid: u32) -> Vec<u32> {
    let mut order = Vec::new();
    let mut visited = BTreeSet::new();
    collect_post_order(table, pid, &mut visited, &mut order);
    order
}

fn collect_post_order(
    table: &dyn ProcessTable,
    pid: u32,
    visited: &mut BTreeSet<u32>,
    order: &mut Vec<u32>,
) {
    // PIDs are reused; a cycle in a racy snapshot must not recurse forever.
    if !visited.insert(pid) {
        return;
    }
    for child in get_children(table, pid) {
        collect_post_order(table, child, visited, order);
    }
    order.push(pid);
}

/// Terminate the whole tree below (and including) `pid`.
///
/// Returns how many processes were signalled. Processes that exited in the
/// meantime are skipped; any other failure is returned to the caller.
#[instrument(skip(table))]
pub fn kill_tree(table: &dyn ProcessTable, pid: u32) -> Result<usize> {
    let mut signalled = 0;
    for target in get_tree(table, pid) {
        match table.terminate(target)? {
            Termination::Signalled => {
                debug!(pid = target, "terminated");
                signalled += 1;
            }
            Termination::AlreadyGone => debug!(pid = target, "already gone"),
        }
    }
    Ok(signalled)
}

/// Shared slot holding the PID of the agent currently (or last) running.
#[derive(Debug, Clone, Default)]
pub struct PidTracker(Arc<Mutex<Option<u32>>>);

impl PidTracker {
    pub fn track(&self, pid: u32) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(pid);
    }

    pub fn current(&self) -> Option<u32> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn take(&self) -> Option<u32> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Kills what a step left behind.
pub struct ProcessSupervisor<P> {
    table: P,
    patterns: Vec<String>,
    own_pid: u32,
    tracker: PidTracker,
    dry_run: bool,
}

impl<P: fmt::Debug> fmt::Debug for ProcessSupervisor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("table", &self.table)
            .field("patterns", &self.patterns)
            .field("own_pid", &self.own_pid)
            .field("tracked", &self.tracker.current())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl<P: ProcessTable> ProcessSupervisor<P> {
    pub fn new(table: P, patterns: Vec<String>, own_pid: u32, dry_run: bool) -> Self {
        Self {
            table,
            patterns,
            own_pid,
            tracker: PidTracker::default(),
            dry_run,
        }
    }

    pub fn tracker(&self) -> &PidTracker {
        &self.tracker
    }

    pub fn table(&self) -> &P {
        &self.table
    }

    /// Phase 1: kill the tree of the last tracked agent, then forget it.
    /// Phase 2: sweep configured command-line patterns.
    #[instrument(skip(self))]
    pub fn cleanup(&self) -> Result<()> {
        if self.dry_run {
            debug!("dry run, skipping process cleanup");
            return Ok(());
        }
        if let Some(pid) = self.tracker.take() {
            let killed = kill_tree(&self.table, pid)?;
            if killed > 0 {
                info!(pid, killed, "killed agent process tree");
            }
        }
        self.sweep_patterns();
        Ok(())
    }

    /// Terminate stragglers matching the configured patterns. Failures are
    /// logged per pattern and never abort the sweep.
    pub fn sweep_patterns(&self) {
        for pattern in &self.patterns {
            let pids = match self.table.find_by_command_line(pattern) {
                Ok(pids) => pids,
                Err(err) => {
                    warn!(pattern = %pattern, err = %err, "process pattern lookup failed");
                    continue;
                }
            };
            for pid in pids.into_iter().filter(|pid| *pid != self.own_pid) {
                match self.table.terminate(pid) {
                    Ok(Termination::Signalled) => {
                        info!(pattern = %pattern, pid, "killed orphaned process");
                    }
                    Ok(Termination::AlreadyGone) => {}
                    Err(err) => warn!(pattern = %pattern, pid, err = %err, "failed to kill orphan"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProcessTable;

    fn sample_table() -> FakeProcessTable {
        // 100 -> [200, 300], 200 -> [400]
        let table = FakeProcessTable::default();
        table.add_child(100, 200);
        table.add_child(100, 300);
        table.add_child(200, 400);
        table
    }

    #[test]
    fn tree_is_post_order() {
        assert_eq!(get_tree(&sample_table(), 100), vec![400, 200, 300, 100]);
    }

    #[test]
    fn failing_child_lookup_yields_leaf() {
        let table = sample_table();
        table.fail_children_of(200);
        assert_eq!(get_children(&table, 200), Vec::<u32>::new());
        assert_eq!(get_tree(&table, 100), vec![200, 300, 100]);
    }

    #[test]
    fn cyclic_snapshot_terminates() {
        let table = sample_table();
        table.add_child(400, 100);
        assert_eq!(get_tree(&table, 100), vec![400, 200, 300, 100]);
    }

    #[test]
    fn kill_tree_tolerates_exited_processes() {
        let table = sample_table();
        table.mark_gone(300);
        assert_eq!(kill_tree(&table, 100).expect("kill"), 3);
        assert_eq!(table.terminated(), vec![400, 200, 100]);
    }

    #[test]
    fn kill_tree_propagates_permission_errors() {
        let table = sample_table();
        table.deny(200);
        let err = kill_tree(&table, 100).expect_err("permission error");
        assert!(err.to_string().contains("Operation not permitted"));
    }

    #[test]
    fn cleanup_kills_tracked_tree_then_sweeps_patterns() {
        let table = sample_table();
        table.add_command_line(900, "node dev-server");
        table.add_command_line(1, "node runner");
        let supervisor = ProcessSupervisor::new(table, vec!["node".to_string()], 1, false);
        supervisor.tracker().track(100);

        supervisor.cleanup().expect("cleanup");

        assert_eq!(supervisor.tracker().current(), None);
        assert_eq!(supervisor.table().terminated(), vec![400, 200, 300, 100, 900]);
    }

    #[test]
    fn sweep_logs_lookup_errors_and_continues() {
        let table = FakeProcessTable::default();
        table.fail_pattern("broken");
        table.add_command_line(700, "chrome --headless");
        let supervisor = ProcessSupervisor::new(
            table,
            vec!["broken".to_string(), "chrome".to_string()],
            1,
            false,
        );
        supervisor.sweep_patterns();
        assert_eq!(supervisor.table().terminated(), vec![700]);
    }

    #[test]
    fn dry_run_cleanup_touches_nothing() {
        let supervisor = ProcessSupervisor::new(sample_table(), Vec::new(), 1, true);
        supervisor.tracker().track(100);
        supervisor.cleanup().expect("cleanup");
        assert!(supervisor.table().terminated().is_empty());
    }

    #[test]
    fn signalling_distinguishes_live_and_exited_processes() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();

        assert_eq!(
            PgrepProcessTable.terminate(pid).expect("terminate"),
            Termination::Signalled
        );
        let status = child.wait().expect("wait");
        assert_eq!(status.signal(), Some(15));

        assert_eq!(
            PgrepProcessTable.terminate(pid).expect("terminate reaped"),
            Termination::AlreadyGone
        );
    }

    #[test]
    fn refuses_to_signal_process_groups() {
        let err = send_signal(0, Signal::SIGTERM).expect_err("pid 0");
        assert!(err.to_string().contains("refusing to signal pid 0"));
        assert!(send_signal(u32::MAX, Signal::SIGTERM).is_err());
    }

    #[test]
    fn pid_list_parsing_ignores_noise() {
        assert_eq!(parse_pid_list("12\n34\n\nabc\n"), vec![12, 34]);
    }
}
