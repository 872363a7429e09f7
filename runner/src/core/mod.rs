//! Pure, deterministic runner logic. Nothing in here touches the filesystem,
//! spawns processes, or reads the clock.

pub mod artifacts;
pub mod branch;
pub mod counters;
pub mod cursor;
pub mod failure;
pub mod steps;
pub mod types;
pub mod version;
