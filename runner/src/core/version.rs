//! Deterministic semantic-version bump computation.
//!
//! Everything here is pure: the caller gathers the current version string,
//! the issue's labels, its milestone pressure and the steering document, and
//! gets back the version to write (or `None` when there is nothing to bump).

use std::collections::BTreeMap;
use std::fmt;

/// Heading of the classification table inside the steering document.
pub const CLASSIFICATION_HEADING: &str = "Version Bump Classification";

/// A strict `MAJOR.MINOR.PATCH` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Parse exactly three dot-separated numeric parts, ignoring surrounding
    /// whitespace. Anything else (pre-release tags, `v` prefixes) is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = parse_part(parts.next()?)?;
        let minor = parse_part(parts.next()?)?;
        let patch = parse_part(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn bump(self, level: BumpLevel) -> Self {
        match level {
            BumpLevel::Patch => Self {
                patch: self.patch + 1,
                ..self
            },
            BumpLevel::Minor => Self {
                minor: self.minor + 1,
                patch: 0,
                ..self
            },
            BumpLevel::Major => Self {
                major: self.major + 1,
                minor: 0,
                patch: 0,
            },
        }
    }
}

fn parse_part(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BumpLevel {
    Patch,
    Minor,
    Major,
}

impl BumpLevel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "patch" => Some(BumpLevel::Patch),
            "minor" => Some(BumpLevel::Minor),
            "major" => Some(BumpLevel::Major),
            _ => None,
        }
    }
}

/// Label to bump-level mapping read from the steering document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BumpTable {
    rows: BTreeMap<String, BumpLevel>,
}

impl BumpTable {
    /// Parse the markdown table under the `### Version Bump Classification`
    /// heading. Returns `None` when the heading or a usable row is missing.
    ///
    /// Rows look like ``| `bug` | patch | Bug fix |``; the header and
    /// separator rows are skipped because their second cell is not a level.
    pub fn parse(markdown: &str) -> Option<Self> {
        let mut lines = markdown.lines();
        lines.find(|line| is_classification_heading(line))?;

        let mut rows = BTreeMap::new();
        for line in lines {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                break;
            }
            if !trimmed.starts_with('|') {
                if rows.is_empty() {
                    continue;
                }
                break;
            }
            let cells: Vec<&str> = trimmed.trim_matches('|').split('|').collect();
            let (Some(label), Some(level)) = (cells.first(), cells.get(1)) else {
                continue;
            };
            let label = label.trim().trim_matches('`').trim();
            if label.is_empty() {
                continue;
            }
            if let Some(level) = BumpLevel::parse(level) {
                rows.insert(label.to_string(), level);
            }
        }

        (!rows.is_empty()).then_some(Self { rows })
    }

    pub fn level_for(&self, label: &str) -> Option<BumpLevel> {
        self.rows.get(label).copied()
    }
}

fn is_classification_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') && trimmed.trim_start_matches('#').trim() == CLASSIFICATION_HEADING
}

/// Pick the bump level for an issue.
///
/// The first label with a table row wins. Without a matching row the
/// hardcoded mapping applies: `bug` is a patch, anything else a minor bump.
/// Closing the last open issue of a milestone always forces a major bump.
pub fn resolve_bump_level(
    labels: &[String],
    milestone_open_issues: Option<u64>,
    table: Option<&BumpTable>,
) -> BumpLevel {
    if milestone_open_issues == Some(1) {
        return BumpLevel::Major;
    }
    if let Some(level) = table.and_then(|table| {
        labels
            .iter()
            .find_map(|label| table.level_for(label.as_str()))
    }) {
        return level;
    }
    if labels.iter().any(|label| label == "bug") {
        BumpLevel::Patch
    } else {
        BumpLevel::Minor
    }
}

/// Next version for `current`, or `None` when `current` is absent or invalid.
pub fn compute_bump(
    current: Option<&str>,
    labels: &[String],
    milestone_open_issues: Option<u64>,
    table: Option<&BumpTable>,
) -> Option<Version> {
    let version = Version::parse(current?)?;
    Some(version.bump(resolve_bump_level(labels, milestone_open_issues, table)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    const TECH_MD: &str = "\
## Versioning

| File | Path | Notes |
|------|------|-------|

### Version Bump Classification

| Label | Bump Type | Description |
|-------|-----------|-------------|
| `bug` | patch | Bug fix |
| `security` | patch | Security fix |
| `enhancement` | minor | New feature |

### Path Syntax

| `docs` | major | not part of the table |
";

    #[test]
    fn parses_strict_semver_only() {
        assert_eq!(
            Version::parse("1.2.3\n"),
            Some(Version {
                major: 1,
                minor: 2,
                patch: 3
            })
        );
        for invalid in ["", "1.2", "1.2.3.4", "v1.2.3", "1.2.3-rc1", "bad-version", "1..3"] {
            assert_eq!(Version::parse(invalid), None, "{invalid}");
        }
    }

    #[test]
    fn bug_label_bumps_patch() {
        let next = compute_bump(Some("1.2.3"), &labels(&["bug"]), None, None);
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("1.2.4"));
    }

    #[test]
    fn other_labels_bump_minor() {
        let next = compute_bump(Some("1.2.3"), &labels(&["enhancement"]), None, None);
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("1.3.0"));
        let next = compute_bump(Some("1.2.3"), &[], None, None);
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("1.3.0"));
    }

    #[test]
    fn last_open_issue_in_milestone_bumps_major() {
        let next = compute_bump(Some("1.2.3"), &labels(&["bug"]), Some(1), None);
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("2.0.0"));
        let next = compute_bump(Some("1.2.3"), &labels(&["bug"]), Some(4), None);
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("1.2.4"));
    }

    #[test]
    fn missing_or_invalid_version_is_noop() {
        assert_eq!(compute_bump(None, &labels(&["bug"]), None, None), None);
        assert_eq!(compute_bump(Some("bad-version"), &labels(&["bug"]), None, None), None);
    }

    #[test]
    fn table_rows_are_read_until_next_heading() {
        let table = BumpTable::parse(TECH_MD).expect("table");
        assert_eq!(table.level_for("bug"), Some(BumpLevel::Patch));
        assert_eq!(table.level_for("security"), Some(BumpLevel::Patch));
        assert_eq!(table.level_for("enhancement"), Some(BumpLevel::Minor));
        assert_eq!(table.level_for("Label"), None);
        assert_eq!(table.level_for("docs"), None);
    }

    #[test]
    fn table_mapping_overrides_hardcoded_default() {
        let table = BumpTable::parse(TECH_MD).expect("table");
        let next = compute_bump(Some("2.0.0"), &labels(&["security"]), None, Some(&table));
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("2.0.1"));
    }

    #[test]
    fn unmatched_label_with_table_defaults_to_minor() {
        let table = BumpTable::parse(TECH_MD).expect("table");
        let next = compute_bump(Some("1.0.0"), &labels(&["documentation"]), None, Some(&table));
        assert_eq!(next.map(|v| v.to_string()).as_deref(), Some("1.1.0"));
    }

    #[test]
    fn missing_classification_section_yields_no_table() {
        let doc = "## Versioning\n\n| File | Path |\n|---|---|\n\n### Path Syntax\n";
        assert_eq!(BumpTable::parse(doc), None);
    }
}
