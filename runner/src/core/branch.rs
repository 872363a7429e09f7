//! Feature branch naming (`<issue>-<slug>`).

use std::sync::LazyLock;

use regex::Regex;

static FEATURE_BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(.+)$").expect("feature branch pattern should be valid"));

static ISSUE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-").expect("issue prefix pattern should be valid"));

/// A branch created for one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureBranch<'a> {
    pub issue: u64,
    pub slug: &'a str,
}

/// Parse `<issue>-<slug>`; anything else is not a feature branch.
pub fn parse_feature_branch(branch: &str) -> Option<FeatureBranch<'_>> {
    let caps = FEATURE_BRANCH.captures(branch)?;
    let issue = caps.get(1)?.as_str().parse().ok()?;
    let slug = caps.get(2)?.as_str();
    Some(FeatureBranch { issue, slug })
}

/// Issue number from a branch's leading `<digits>-` prefix.
pub fn issue_from_branch(branch: &str) -> Option<u64> {
    ISSUE_PREFIX
        .captures(branch)
        .and_then(|caps| caps.get(1))
        .and_then(|number| number.as_str().parse().ok())
}
