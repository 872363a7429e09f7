//! Status notifications.
//!
//! Notifications are fire-and-forget: a failed delivery is a warning and never
//! changes what the pipeline does.

use std::ffi::OsString;
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use regex::{Regex, RegexBuilder};
use tracing::{info, instrument, warn};

use crate::io::process::run_command_until_marker;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

static SUCCESS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new("Sent via|Message ID")
        .case_insensitive(true)
        .build()
        .expect("success marker pattern should be valid")
});

/// Outbound notification channel.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Posts messages to a Discord channel through `openclaw message send`.
///
/// The CLI keeps its gateway connection open after delivering, so it is
/// killed as soon as stdout confirms delivery.
#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    program: OsString,
    channel: Option<String>,
    dry_run: bool,
    backoff_unit: Duration,
}

impl DiscordNotifier {
    pub fn new(channel: Option<String>, dry_run: bool) -> Self {
        Self {
            program: OsString::from("openclaw"),
            channel: channel.filter(|id| !id.trim().is_empty()),
            dry_run,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Use a different executable in place of `openclaw`.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Scale the retry backoff (2 and 4 units between attempts).
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn send_once(&self, channel: &str, message: &str) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "message",
            "send",
            "--channel",
            "discord",
            "--target",
            channel,
            "-m",
            message,
        ]);
        let (output, delivered) = run_command_until_marker(cmd, SEND_TIMEOUT, &SUCCESS_MARKER)?;
        if delivered || output.status.success() {
            return Ok(());
        }
        if output.timed_out {
            bail!(
                "openclaw message send timed out ({}s) with no success marker",
                SEND_TIMEOUT.as_secs()
            );
        }
        bail!(
            "openclaw message send exited with code {:?}: {}",
            output.status.code(),
            output.stdout_lossy().trim()
        )
    }
}

impl Notifier for DiscordNotifier {
    #[instrument(skip_all)]
    fn notify(&self, message: &str) {
        let Some(channel) = self.channel.as_deref() else {
            warn!("no Discord channel configured (use --discord-channel or discord_channel_id)");
            return;
        };
        if self.dry_run {
            info!(message, "dry run, not posting to Discord");
            return;
        }
        for attempt in 1..=MAX_ATTEMPTS {
            match self.send_once(channel, message) {
                Ok(()) => return,
                Err(err) if attempt < MAX_ATTEMPTS => {
                    let backoff = self.backoff_unit * 2u32.pow(attempt);
                    warn!(
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        backoff_ms = backoff.as_millis() as u64,
                        err = %format!("{err:#}"),
                        "Discord post failed, retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(err) => {
                    warn!(
                        attempts = MAX_ATTEMPTS,
                        err = %format!("{err:#}"),
                        "Discord post failed"
                    );
                }
            }
        }
    }
}

/// Notifier that only logs; used when notifications are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!(message, "notification");
    }
}
