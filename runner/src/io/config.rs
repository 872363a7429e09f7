//! Runner configuration file (TOML).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::failure::{DEFAULT_BENIGN_DENIALS, DEFAULT_ESCALATION_PATTERNS};
use crate::core::steps::{DEFAULT_MODEL, Effort, StepKey, StepOverride};

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing optional fields take
/// defaults; `project_path` and `plugins_path` are required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Repository the pipeline works on.
    pub project_path: PathBuf,
    /// Root of the plugin checkout that provides skills.
    pub plugins_path: PathBuf,
    pub model: String,
    pub effort: Option<Effort>,
    pub max_retries_per_step: u32,
    pub discord_channel_id: Option<String>,
    /// Directory for step logs and the orchestration log.
    pub log_dir: Option<PathBuf>,
    pub max_log_disk_mb: u64,
    pub cleanup: CleanupConfig,
    pub classifier: ClassifierConfig,
    /// Per-step overrides keyed by step key (`implement`, `monitorCI`, ...).
    pub steps: BTreeMap<String, StepOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Command-line substrings of processes to kill after every step.
    pub process_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Denied tools that do not fail a step.
    pub benign_denials: Vec<String>,
    /// Case-insensitive regexes that escalate a failure immediately, in order.
    pub escalation_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            benign_denials: DEFAULT_BENIGN_DENIALS
                .iter()
                .map(ToString::to_string)
                .collect(),
            escalation_patterns: DEFAULT_ESCALATION_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            project_path: PathBuf::new(),
            plugins_path: PathBuf::new(),
            model: DEFAULT_MODEL.to_string(),
            effort: None,
            max_retries_per_step: 3,
            discord_channel_id: None,
            log_dir: None,
            max_log_disk_mb: 500,
            cleanup: CleanupConfig::default(),
            classifier: ClassifierConfig::default(),
            steps: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Every problem with the config, in a stable order.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.project_path.as_os_str().is_empty() {
            errors.push("project_path is required".to_string());
        }
        if self.plugins_path.as_os_str().is_empty() {
            errors.push("plugins_path is required".to_string());
        }
        if self.model.trim().is_empty() {
            errors.push("model must be a non-empty string".to_string());
        }
        if self.max_retries_per_step == 0 {
            errors.push("max_retries_per_step must be > 0".to_string());
        }
        if self.max_log_disk_mb == 0 {
            errors.push("max_log_disk_mb must be > 0".to_string());
        }
        for (key, step) in &self.steps {
            if key.parse::<StepKey>().is_err() {
                errors.push(format!("steps.{key}: unknown step"));
            }
            if step.model.as_deref().is_some_and(|model| model.trim().is_empty()) {
                errors.push(format!("steps.{key}.model must be a non-empty string"));
            }
            if step.max_turns == Some(0) {
                errors.push(format!("steps.{key}.max_turns must be > 0"));
            }
            if step.timeout_min == Some(0) {
                errors.push(format!("steps.{key}.timeout_min must be > 0"));
            }
        }
        errors
    }

    pub fn validate(&self) -> Result<()> {
        let errors = self.errors();
        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!("invalid config:\n  {}", errors.join("\n  ")))
    }

    /// Configured log directory, or `<tmp>/sdlc-logs/<project name>`.
    pub fn resolved_log_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => dir.clone(),
            None => {
                let project = self
                    .project_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "project".to_string());
                std::env::temp_dir().join("sdlc-logs").join(project)
            }
        }
    }

    pub fn max_log_disk_bytes(&self) -> u64 {
        self.max_log_disk_mb.saturating_mul(1024 * 1024)
    }
}

/// Load and validate config from a TOML file. The file must exist.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    debug!(path = %path.display(), "loading config");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
project_path = "/work/app"
plugins_path = "/work/plugins"
"#;

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg: RunnerConfig = toml::from_str(MINIMAL).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.model, "opus");
        assert_eq!(cfg.max_retries_per_step, 3);
        assert_eq!(cfg.max_log_disk_bytes(), 500 * 1024 * 1024);
        assert_eq!(cfg.classifier, ClassifierConfig::default());
        assert!(cfg.cleanup.process_patterns.is_empty());
        assert_eq!(
            cfg.resolved_log_dir(),
            std::env::temp_dir().join("sdlc-logs").join("app")
        );
    }

    #[test]
    fn step_overrides_parse_by_key() {
        let raw = format!(
            "{MINIMAL}\n[steps.monitorCI]\nmax_turns = 40\ntimeout_min = 30\neffort = \"high\"\n"
        );
        let cfg: RunnerConfig = toml::from_str(&raw).expect("parse");
        cfg.validate().expect("valid");
        let step = cfg.steps.get("monitorCI").expect("override");
        assert_eq!(step.max_turns, Some(40));
        assert_eq!(step.effort, Some(Effort::High));
    }

    #[test]
    fn validation_collects_every_error() {
        let raw = "model = \"  \"\n[steps.deploy]\nmax_turns = 0\n";
        let cfg: RunnerConfig = toml::from_str(raw).expect("parse");
        let errors = cfg.errors();
        assert_eq!(
            errors,
            vec![
                "project_path is required".to_string(),
                "plugins_path is required".to_string(),
                "model must be a non-empty string".to_string(),
                "steps.deploy: unknown step".to_string(),
                "steps.deploy.max_turns must be > 0".to_string(),
            ]
        );
    }

    #[test]
    fn invalid_effort_is_rejected_at_parse_time() {
        let raw = format!("{MINIMAL}\neffort = \"maximum\"\n");
        let err = toml::from_str::<RunnerConfig>(&raw).expect_err("invalid effort");
        assert!(err.to_string().contains("low, medium, high"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_config(&temp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("sdlc.toml");
        let cfg: RunnerConfig = toml::from_str(MINIMAL).expect("parse");
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }
}
