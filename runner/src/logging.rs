//! Tracing setup for the runner binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: orchestration diagnostics filtered by
//!   `RUST_LOG`, written to stderr and appended to [`ORCHESTRATION_LOG_FILE`]
//!   in the log directory.
//!
//! - **Step logs (`io/step_log`)**: raw agent output, one file per executed
//!   step. Always written, unaffected by `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Orchestration log inside the log directory; never pruned.
pub const ORCHESTRATION_LOG_FILE: &str = "sdlc-runner.log";

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`; defaults to `info`. Output: stderr (compact) plus the
/// orchestration log in `log_dir` (compact, no ANSI colors).
///
/// # Example
/// ```bash
/// RUST_LOG=sdlc_runner=debug sdlc-runner --config runner.toml
/// ```
pub fn init(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let path = log_dir.join(ORCHESTRATION_LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .compact(),
        )
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}
