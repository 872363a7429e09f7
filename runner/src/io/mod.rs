//! I/O adapters used by the orchestrator.

pub mod config;
pub mod executor;
pub mod git;
pub mod github;
pub mod init;
pub mod notify;
pub mod process;
pub mod process_tree;
pub mod prompt;
pub mod repo;
pub mod specs;
pub mod state_store;
pub mod step_log;
