//! Stable exit codes for the runner binary.

/// The loop finished (no open issues, dry run complete, or shutdown), or a
/// single step returned `ok`.
pub const OK: i32 = 0;
/// Invalid config or arguments, an unreadable project, or any other error
/// that stopped the runner.
pub const INVALID: i32 = 1;
/// `--step N` ran but did not return `ok` (retry, bounce, escalation or skip).
pub const STEP_NOT_OK: i32 = 2;
/// A failure loop was detected; state was preserved for inspection.
pub const HALTED: i32 = 3;
