//! CLI tests for the `sdlc-runner` binary.
//!
//! Spawns the binary against a throwaway git repository and verifies exit
//! codes and the files a run leaves behind.

use std::fs;
use std::path::Path;
use std::process::Command;

use sdlc_runner::exit_codes;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q", "-b", "main"]);
    git(
        dir,
        &[
            "-c",
            "user.name=Runner Test",
            "-c",
            "user.email=runner@example.com",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "init",
        ],
    );
}

fn write_config(dir: &Path, project: &Path) -> std::path::PathBuf {
    let config = dir.join("runner.toml");
    fs::write(
        &config,
        format!(
            "project_path = {:?}\nplugins_path = {:?}\nlog_dir = {:?}\n",
            project.display().to_string(),
            dir.join("plugins").display().to_string(),
            dir.join("logs").display().to_string(),
        ),
    )
    .expect("write config");
    config
}

#[test]
fn missing_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = Command::new(env!("CARGO_BIN_EXE_sdlc-runner"))
        .arg("--config")
        .arg(temp.path().join("nope.toml"))
        .status()
        .expect("sdlc-runner");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("runner.toml");
    fs::write(&config, "max_retries_per_step = 0\n").expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_sdlc-runner"))
        .arg("--config")
        .arg(&config)
        .output()
        .expect("sdlc-runner");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("project_path is required"), "{stderr}");
    assert!(stderr.contains("max_retries_per_step must be > 0"), "{stderr}");
}

#[test]
fn project_outside_git_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path().join("project");
    fs::create_dir_all(&project).expect("mkdir");
    let config = write_config(temp.path(), &project);

    let output = Command::new(env!("CARGO_BIN_EXE_sdlc-runner"))
        .arg("--config")
        .arg(&config)
        .arg("--dry-run")
        .output()
        .expect("sdlc-runner");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("is not a git repository"));
}

#[test]
fn dry_run_single_step_succeeds_and_logs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let project = temp.path().join("project");
    fs::create_dir_all(&project).expect("mkdir");
    init_repo(&project);
    let config = write_config(temp.path(), &project);

    let status = Command::new(env!("CARGO_BIN_EXE_sdlc-runner"))
        .arg("--config")
        .arg(&config)
        .args(["--dry-run", "--step", "1"])
        .status()
        .expect("sdlc-runner");

    assert_eq!(status.code(), Some(exit_codes::OK));

    let state: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(project.join(".claude/sdlc-state.json")).expect("state file"),
    )
    .expect("state json");
    assert_eq!(state["lastCompletedStep"], 1);
    assert_eq!(state["currentBranch"], "main");
    assert!(!project.join(".claude/auto-mode").exists());

    let logs: Vec<String> = fs::read_dir(temp.path().join("logs"))
        .expect("log dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert!(logs.iter().any(|name| name == "sdlc-runner.log"), "{logs:?}");
    assert!(logs.iter().any(|name| name.starts_with("startCycle-")), "{logs:?}");
}

#[test]
fn step_out_of_range_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_sdlc-runner"))
        .args(["--config", "runner.toml", "--step", "10"])
        .output()
        .expect("sdlc-runner");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--step"));
}
