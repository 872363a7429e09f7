//! GitHub CLI (`gh`) adapter.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::CiStatus;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const GH_TIMEOUT: Duration = Duration::from_secs(60);
const GH_OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;
const ISSUE_LIST_LIMIT: &str = "200";

/// Wrapper for executing `gh` commands in a repository checkout.
#[derive(Debug, Clone)]
pub struct Gh {
    workdir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct IssueNumber {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct IssueMilestone {
    milestone: Option<MilestoneRef>,
}

#[derive(Debug, Deserialize)]
struct MilestoneRef {
    title: String,
}

#[derive(Debug, Deserialize)]
struct Milestone {
    title: String,
    open_issues: u64,
}

impl Gh {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// `true` when a PR exists for the current branch.
    pub fn pr_exists(&self) -> bool {
        self.run_capture(&["pr", "view", "--json", "number"]).is_ok()
    }

    /// State of the current branch's PR (`OPEN`, `MERGED`, `CLOSED`).
    pub fn pr_state(&self) -> Result<String> {
        let out = self.run_capture(&["pr", "view", "--json", "state", "--jq", ".state"])?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all)]
    pub fn pr_checks(&self) -> CiStatus {
        match self.run(&["pr", "checks"]) {
            Ok(output) => {
                let status = classify_checks(&output);
                debug!(?status, "ci status");
                status
            }
            Err(err) => CiStatus::Unknown(format!("{err:#}")),
        }
    }

    /// Numbers of all open issues.
    pub fn open_issue_numbers(&self) -> Result<Vec<u64>> {
        let out = self.run_capture(&[
            "issue",
            "list",
            "--state",
            "open",
            "--limit",
            ISSUE_LIST_LIMIT,
            "--json",
            "number",
        ])?;
        parse_issue_numbers(&out)
    }

    pub fn issue_labels(&self, issue: u64) -> Result<Vec<String>> {
        let number = issue.to_string();
        let out = self.run_capture(&[
            "issue",
            "view",
            &number,
            "--json",
            "labels",
            "--jq",
            ".labels[].name",
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Open issue count of the issue's milestone, or `None` without one.
    pub fn milestone_open_issues(&self, issue: u64) -> Result<Option<u64>> {
        let number = issue.to_string();
        let out = self.run_capture(&["issue", "view", &number, "--json", "milestone"])?;
        let Some(title) = parse_milestone_title(&out)? else {
            return Ok(None);
        };
        let milestones = self.run_capture(&["api", "repos/{owner}/{repo}/milestones"])?;
        open_issues_for(&milestones, &title)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, GH_TIMEOUT, GH_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("gh {}", args.join(" ")))
    }
}

/// Interpret `gh pr checks`, which signals failures through its exit code
/// but reports "no checks" only as text.
fn classify_checks(output: &CommandOutput) -> CiStatus {
    let stdout = output.stdout_lossy();
    let stderr = output.stderr_lossy();
    let all = format!("{stdout}\n{stderr}").to_ascii_lowercase();
    if all.contains("no checks reported") {
        return CiStatus::NoChecks;
    }
    let stdout = stdout.to_ascii_lowercase();
    if stdout.contains("fail") {
        return CiStatus::Failing;
    }
    if stdout.contains("pending") {
        return CiStatus::Pending;
    }
    if output.status.success() {
        return CiStatus::Passing;
    }
    CiStatus::Unknown(stderr.trim().to_string())
}

fn parse_issue_numbers(raw: &str) -> Result<Vec<u64>> {
    let issues: Vec<IssueNumber> = serde_json::from_str(raw).context("parse issue list")?;
    Ok(issues.into_iter().map(|issue| issue.number).collect())
}

fn parse_milestone_title(raw: &str) -> Result<Option<String>> {
    let parsed: IssueMilestone = serde_json::from_str(raw).context("parse issue milestone")?;
    Ok(parsed.milestone.map(|milestone| milestone.title))
}

fn open_issues_for(raw: &str, title: &str) -> Result<Option<u64>> {
    let milestones: Vec<Milestone> = serde_json::from_str(raw).context("parse milestones")?;
    Ok(milestones
        .into_iter()
        .find(|milestone| milestone.title == title)
        .map(|milestone| milestone.open_issues))
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    use super::*;

    fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
        }
    }

    #[test]
    fn checks_classification() {
        assert_eq!(
            classify_checks(&output(0, "build\tpass\t1m\n", "")),
            CiStatus::Passing
        );
        assert_eq!(
            classify_checks(&output(1, "build\tfail\t1m\n", "")),
            CiStatus::Failing
        );
        assert_eq!(
            classify_checks(&output(8, "build\tpending\t0\n", "")),
            CiStatus::Pending
        );
        assert_eq!(
            classify_checks(&output(1, "", "no checks reported on the '7-x' branch")),
            CiStatus::NoChecks
        );
        assert_eq!(
            classify_checks(&output(1, "", "HTTP 502")),
            CiStatus::Unknown("HTTP 502".to_string())
        );
    }

    #[test]
    fn parses_issue_numbers() {
        assert_eq!(
            parse_issue_numbers(r#"[{"number":3},{"number":17}]"#).expect("parse"),
            vec![3, 17]
        );
        assert!(parse_issue_numbers("not json").is_err());
    }

    #[test]
    fn milestone_lookup_matches_title() {
        assert_eq!(
            parse_milestone_title(r#"{"milestone":null}"#).expect("parse"),
            None
        );
        let title = parse_milestone_title(r#"{"milestone":{"title":"v2"}}"#)
            .expect("parse")
            .expect("title");
        let milestones = r#"[{"title":"v1","open_issues":4},{"title":"v2","open_issues":1}]"#;
        assert_eq!(open_issues_for(milestones, &title).expect("parse"), Some(1));
        assert_eq!(open_issues_for(milestones, "v3").expect("parse"), None);
    }
}
