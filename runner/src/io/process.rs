//! Helpers for running child processes with timeouts and bounded output.

use std::io::{BufRead, BufReader, Read};
use std::mem;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Default bound on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let (mut child, stdout, stderr) = spawn_piped(cmd)?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    finish(status, timed_out, stdout_handle, stderr_handle)
}

/// Limits applied to a supervised (long-running) child.
#[derive(Debug, Clone, Copy)]
pub struct SupervisedLimits {
    pub timeout: Duration,
    /// Time between the graceful termination request and the forceful kill.
    pub grace: Duration,
    /// How long output is still collected once the child has exited.
    pub drain: Duration,
    pub output_limit_bytes: usize,
}

/// Run a long-lived command, reporting its PID as soon as it is spawned.
///
/// The child leads its own process group. On timeout `terminate` is asked to
/// stop the child gracefully; if it is still running after `limits.grace` it
/// is killed outright. Once the child is gone, whatever is left in its group
/// gets SIGTERM, and output is collected for at most `limits.drain` so a
/// descendant holding the pipes cannot stall the caller.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), grace_secs = limits.grace.as_secs()))]
pub fn run_command_supervised<S, T>(
    mut cmd: Command,
    limits: SupervisedLimits,
    on_spawn: S,
    terminate: T,
) -> Result<CommandOutput>
where
    S: FnOnce(u32),
    T: FnOnce(u32) -> Result<()>,
{
    cmd.process_group(0);
    let (mut child, stdout, stderr) = spawn_piped(cmd)?;
    let pid = child.id();
    on_spawn(pid);

    let limit = limits.output_limit_bytes;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let stdout_handle = spawn_capture(stdout, limit, &stdout_capture);
    let stderr_handle = spawn_capture(stderr, limit, &stderr_capture);

    let mut timed_out = false;
    let status = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            timed_out = true;
            warn!(pid, "command exceeded timeout, requesting termination");
            if let Err(err) = terminate(pid) {
                warn!(pid, err = %err, "graceful termination failed");
            }
            match child.wait_timeout(limits.grace).context("wait for command after terminate")? {
                Some(status) => status,
                None => {
                    warn!(pid, "grace period expired, killing");
                    child.kill().context("kill command")?;
                    child.wait().context("wait command after kill")?
                }
            }
        }
    };

    terminate_group(pid);
    let deadline = Instant::now() + limits.drain;
    let (stdout, stdout_truncated) = drain_until(stdout_handle, &stdout_capture, deadline, "stdout");
    let (stderr, stderr_truncated) = drain_until(stderr_handle, &stderr_capture, deadline, "stderr");

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// SIGTERM whatever is still running in process group `pgid`.
fn terminate_group(pgid: u32) {
    let Some(raw) = i32::try_from(pgid).ok().filter(|raw| *raw > 0) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!(pgid, "signalled leftover process group"),
        Err(Errno::ESRCH) => {}
        Err(errno) => warn!(pgid, err = %errno, "could not signal process group"),
    }
}

/// Run a command until `marker` shows up on stdout, the child exits, or `timeout` elapses.
///
/// Some CLIs keep running after their work is done; the marker lets the caller
/// treat the visible confirmation as success and stop waiting. Returns the
/// captured output and whether the marker was seen.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_command_until_marker(
    cmd: Command,
    timeout: Duration,
    marker: &Regex,
) -> Result<(CommandOutput, bool)> {
    const POLL: Duration = Duration::from_millis(100);

    let (mut child, stdout, stderr) = spawn_piped(cmd)?;
    let seen = Arc::new(AtomicBool::new(false));

    let watcher_seen = Arc::clone(&seen);
    let watcher_marker = marker.clone();
    let stdout_handle = thread::spawn(move || {
        read_lines_watching(stdout, DEFAULT_OUTPUT_LIMIT_BYTES, &watcher_marker, &watcher_seen)
    });
    let stderr_handle =
        thread::spawn(move || read_stream_limited(stderr, DEFAULT_OUTPUT_LIMIT_BYTES));

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL).context("wait for command")? {
            break status;
        }
        if seen.load(Ordering::SeqCst) {
            info!("success marker seen, stopping command");
            break kill_and_wait(&mut child)?;
        }
        if started.elapsed() >= timeout {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            break kill_and_wait(&mut child)?;
        }
    };

    let output = finish(status, timed_out, stdout_handle, stderr_handle)?;
    Ok((output, seen.load(Ordering::SeqCst)))
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    // The child may exit between the poll and the kill.
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after exit");
    }
    child.wait().context("wait command after kill")
}

fn spawn_piped(mut cmd: Command) -> Result<(Child, ChildStdout, ChildStderr)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    Ok((child, stdout, stderr))
}

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

fn finish(
    status: ExitStatus,
    timed_out: bool,
    stdout_handle: ReaderHandle,
    stderr_handle: ReaderHandle,
) -> Result<CommandOutput> {
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: ReaderHandle) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Output collected so far by one reader thread.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

fn spawn_capture<R>(reader: R, limit: usize, capture: &SharedCapture) -> thread::JoinHandle<Result<()>>
where
    R: Read + Send + 'static,
{
    let sink = Arc::clone(capture);
    thread::spawn(move || capture_limited(reader, limit, &sink))
}

fn capture_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}

/// Wait for a reader until `deadline`, then take whatever it has collected.
/// A reader still blocked at the deadline is left behind.
fn drain_until(
    handle: thread::JoinHandle<Result<()>>,
    capture: &SharedCapture,
    deadline: Instant,
    stream: &'static str,
) -> (Vec<u8>, usize) {
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(DRAIN_POLL);
    }
    if handle.is_finished() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(stream, err = %format!("{err:#}"), "output reader failed"),
            Err(_) => warn!(stream, "output reader thread panicked"),
        }
    } else {
        warn!(stream, "output pipe still open after the command exited, giving up on it");
    }
    let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
    (mem::take(&mut captured.bytes), captured.truncated)
}

fn read_lines_watching<R: Read>(
    reader: R,
    limit: usize,
    marker: &Regex,
    seen: &AtomicBool,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if marker.is_match(&String::from_utf8_lossy(&line)) {
            seen.store(true, Ordering::SeqCst);
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
