//! Project layout and runner-owned file hygiene.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::artifacts::{AUTO_MODE_FILE, RUNNER_ARTIFACTS, STATE_FILE};

/// Spec files every feature directory must contain after step 3.
pub const REQUIRED_SPEC_FILES: &[&str] = &[
    "requirements.md",
    "design.md",
    "tasks.md",
    "feature.gherkin",
];

/// Version file at the project root.
pub const VERSION_FILE: &str = "VERSION";

const GITIGNORE_HEADER: &str = "# SDLC runner artifacts";

/// All canonical paths the runner touches for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub claude_dir: PathBuf,
    pub state_path: PathBuf,
    pub auto_mode_path: PathBuf,
    pub specs_dir: PathBuf,
    pub steering_tech_path: PathBuf,
    pub version_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let claude_dir = root.join(".claude");
        Self {
            root: root.clone(),
            claude_dir: claude_dir.clone(),
            state_path: root.join(STATE_FILE),
            auto_mode_path: root.join(AUTO_MODE_FILE),
            specs_dir: claude_dir.join("specs"),
            steering_tech_path: claude_dir.join("steering").join("tech.md"),
            version_path: root.join(VERSION_FILE),
            gitignore_path: root.join(".gitignore"),
        }
    }
}

/// Append missing runner artifacts to the project's `.gitignore`.
///
/// Append-only and idempotent. Returns the entries that were added.
pub fn ensure_runner_artifacts_gitignored(paths: &ProjectPaths) -> Result<Vec<String>> {
    let content = match fs::read_to_string(&paths.gitignore_path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read {}", paths.gitignore_path.display()));
        }
    };

    let existing: Vec<&str> = content.lines().map(str::trim).collect();
    let missing: Vec<String> = RUNNER_ARTIFACTS
        .iter()
        .filter(|entry| !existing.contains(entry))
        .map(ToString::to_string)
        .collect();
    if missing.is_empty() {
        debug!("runner artifacts already gitignored");
        return Ok(missing);
    }

    let mut append = String::new();
    if !content.is_empty() && !content.ends_with('\n') {
        append.push('\n');
    }
    append.push('\n');
    append.push_str(GITIGNORE_HEADER);
    append.push('\n');
    for entry in &missing {
        append.push_str(entry);
        append.push('\n');
    }

    let mut updated = content;
    updated.push_str(&append);
    fs::write(&paths.gitignore_path, updated)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    info!(entries = %missing.join(", "), "appended runner artifacts to .gitignore");
    Ok(missing)
}

/// Create the auto-mode flag if it does not exist yet.
pub fn create_auto_mode(paths: &ProjectPaths) -> Result<()> {
    if paths.auto_mode_path.exists() {
        return Ok(());
    }
    fs::create_dir_all(&paths.claude_dir)
        .with_context(|| format!("create directory {}", paths.claude_dir.display()))?;
    fs::write(&paths.auto_mode_path, "")
        .with_context(|| format!("write {}", paths.auto_mode_path.display()))?;
    info!("created .claude/auto-mode flag");
    Ok(())
}

/// Remove the auto-mode flag. Best effort: a missing file is fine.
pub fn remove_auto_mode(paths: &ProjectPaths) {
    match fs::remove_file(&paths.auto_mode_path) {
        Ok(()) => info!("removed .claude/auto-mode flag"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(err = %err, "failed to remove .claude/auto-mode flag"),
    }
}

/// Read an optional text file; missing files are `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_missing_entries_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::write(&paths.gitignore_path, "node_modules/").expect("write");

        let added = ensure_runner_artifacts_gitignored(&paths).expect("ensure");
        assert_eq!(added.len(), 2);
        let content = fs::read_to_string(&paths.gitignore_path).expect("read");
        assert_eq!(
            content,
            "node_modules/\n\n# SDLC runner artifacts\n.claude/sdlc-state.json\n.claude/auto-mode\n"
        );

        let added = ensure_runner_artifacts_gitignored(&paths).expect("ensure");
        assert!(added.is_empty());
        assert_eq!(fs::read_to_string(&paths.gitignore_path).expect("read"), content);
    }

    #[test]
    fn appends_only_what_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::write(&paths.gitignore_path, ".claude/auto-mode\n").expect("write");

        let added = ensure_runner_artifacts_gitignored(&paths).expect("ensure");
        assert_eq!(added, vec![".claude/sdlc-state.json".to_string()]);
    }

    #[test]
    fn creates_gitignore_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        ensure_runner_artifacts_gitignored(&paths).expect("ensure");
        let content = fs::read_to_string(&paths.gitignore_path).expect("read");
        assert!(content.starts_with("\n# SDLC runner artifacts\n"));
    }

    #[test]
    fn auto_mode_flag_lifecycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        create_auto_mode(&paths).expect("create");
        assert!(paths.auto_mode_path.exists());
        create_auto_mode(&paths).expect("idempotent");
        remove_auto_mode(&paths);
        assert!(!paths.auto_mode_path.exists());
        remove_auto_mode(&paths);
    }
}
