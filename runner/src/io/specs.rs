//! Feature spec directories under `.claude/specs`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::io::init::REQUIRED_SPEC_FILES;

/// The specs root of one project.
#[derive(Debug, Clone)]
pub struct SpecsDir {
    root: PathBuf,
}

/// Why a feature directory does not satisfy the spec gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecProblem {
    NoSpecsDir,
    NoFeatureDir,
    MissingFiles(Vec<String>),
}

impl SpecProblem {
    pub fn reason(&self) -> String {
        match self {
            SpecProblem::NoSpecsDir => "No .claude/specs directory".to_string(),
            SpecProblem::NoFeatureDir => "No feature spec directory found".to_string(),
            SpecProblem::MissingFiles(files) => format!("Missing spec files: {}", files.join(", ")),
        }
    }
}

impl SpecsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Feature directory names, sorted lexicographically.
    pub fn features(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in
            fs::read_dir(&self.root).with_context(|| format!("read {}", self.root.display()))?
        {
            let entry = entry.with_context(|| format!("read entry in {}", self.root.display()))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Lexicographically last feature directory.
    pub fn latest_feature(&self) -> Result<Option<String>> {
        Ok(self.features()?.pop())
    }

    /// Feature directory whose name contains `slug`, else the latest one.
    pub fn match_slug(&self, slug: &str) -> Result<Option<String>> {
        let features = self.features()?;
        let matched = features.iter().find(|name| name.contains(slug)).cloned();
        Ok(matched.or_else(|| features.last().cloned()))
    }

    /// Check that `feature` (or the latest feature) holds every required,
    /// non-empty spec file.
    pub fn check(&self, feature: Option<&str>) -> Result<(), SpecProblem> {
        if !self.root.is_dir() {
            return Err(SpecProblem::NoSpecsDir);
        }
        let name = match feature {
            Some(name) => Some(name.to_string()),
            None => self
                .latest_feature()
                .map_err(|_| SpecProblem::NoFeatureDir)?,
        };
        let dir = match name {
            Some(name) => self.root.join(name),
            None => return Err(SpecProblem::NoFeatureDir),
        };
        if !dir.is_dir() {
            return Err(SpecProblem::NoFeatureDir);
        }
        let missing = missing_spec_files(&dir);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SpecProblem::MissingFiles(missing))
        }
    }
}

/// Required spec files absent or empty in `dir`.
pub fn missing_spec_files(dir: &Path) -> Vec<String> {
    REQUIRED_SPEC_FILES
        .iter()
        .filter(|name| {
            fs::metadata(dir.join(name))
                .map(|meta| !meta.is_file() || meta.len() == 0)
                .unwrap_or(true)
        })
        .map(ToString::to_string)
        .collect()
}
