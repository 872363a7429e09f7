//! Deterministic SDLC pipeline runner.
//!
//! This crate drives a fixed nine-step development cycle over a project
//! repository, delegating each step to a headless agent and deciding in code
//! (never in the agent) whether the step really succeeded. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (step table, failure
//!   classification, counters, version arithmetic). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting adapters (state file, git, GitHub, agent
//!   process, notifications) behind traits so tests can script them.
//!
//! Orchestration modules ([`step`], [`looping`], [`policy`],
//! [`preconditions`], [`postconditions`], [`version_bump`], [`start`],
//! [`hydrate`], [`shutdown`]) coordinate core logic with I/O through
//! [`orchestrator::Orchestrator`].

pub mod core;
pub mod exit_codes;
pub mod hydrate;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
pub mod policy;
pub mod postconditions;
pub mod preconditions;
pub mod shutdown;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod version_bump;
