//! Deterministic classification of runner-owned paths.
//!
//! The runner writes its own bookkeeping into the project. Those files must
//! never count as "work" when deciding whether the tree is dirty.

use std::path::{Component, Path, PathBuf};

/// Runner state file, relative to the project root.
pub const STATE_FILE: &str = ".claude/sdlc-state.json";
/// Flag file that tells skills they run unattended.
pub const AUTO_MODE_FILE: &str = ".claude/auto-mode";

/// Every path the runner owns inside the project.
pub const RUNNER_ARTIFACTS: &[&str] = &[STATE_FILE, AUTO_MODE_FILE];

/// `true` when `path` is one of [`RUNNER_ARTIFACTS`].
///
/// Comparison is component-wise, so `./.claude/auto-mode` matches but
/// `src/.claude/auto-mode` and `.claude/auto-mode.bak` do not.
pub fn is_runner_artifact(path: &Path) -> bool {
    let normalized = normalize(path);
    RUNNER_ARTIFACTS
        .iter()
        .any(|artifact| normalize(Path::new(artifact)) == normalized)
}

/// Changed paths that represent real work.
pub fn meaningful_changes<P: AsRef<Path>>(changed_paths: &[P]) -> Vec<PathBuf> {
    changed_paths
        .iter()
        .map(|path| path.as_ref())
        .filter(|path| !is_runner_artifact(path))
        .map(Path::to_path_buf)
        .collect()
}

fn normalize(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir | Component::RootDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_files_are_artifacts() {
        assert!(is_runner_artifact(Path::new(".claude/sdlc-state.json")));
        assert!(is_runner_artifact(Path::new("./.claude/auto-mode")));
    }

    #[test]
    fn lookalike_paths_are_not_artifacts() {
        assert!(!is_runner_artifact(Path::new("src/.claude/auto-mode")));
        assert!(!is_runner_artifact(Path::new(".claude/auto-mode.bak")));
        assert!(!is_runner_artifact(Path::new(".claude/specs/feature/design.md")));
    }

    #[test]
    fn only_runner_changes_are_not_meaningful() {
        let paths = [".claude/sdlc-state.json", ".claude/auto-mode"];
        assert!(meaningful_changes(&paths).is_empty());
    }

    #[test]
    fn mixed_changes_keep_real_work() {
        let paths = [".claude/auto-mode", "src/lib.rs"];
        assert_eq!(meaningful_changes(&paths), vec![PathBuf::from("src/lib.rs")]);
    }

    #[test]
    fn empty_input_has_no_meaningful_changes() {
        let paths: Vec<PathBuf> = Vec::new();
        assert!(meaningful_changes(&paths).is_empty());
    }
}
