//! Consistency report data model and report assembly.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Character,
    Timeline,
    Foreshadow,
    Continuity,
    Style,
    Other,
}

impl IssueCategory {
    /// Lenient parse of a model-supplied category.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "character" | "characters" | "character_consistency" => Self::Character,
            "timeline" | "time" | "chronology" => Self::Timeline,
            "foreshadow" | "foreshadowing" => Self::Foreshadow,
            "continuity" | "plot" | "logic" => Self::Continuity,
            "style" | "tone" | "voice" => Self::Style,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Timeline => "timeline",
            Self::Foreshadow => "foreshadow",
            Self::Continuity => "continuity",
            Self::Style => "style",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" | "critical" | "major" => Self::High,
            "medium" | "moderate" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSource {
    Rule,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub category: IssueCategory,
    pub severity: Severity,
    pub title: String,
    pub evidence: String,
    pub suggestion: String,
    pub source: IssueSource,
}

impl ConsistencyIssue {
    pub fn rule(
        category: IssueCategory,
        severity: Severity,
        title: impl Into<String>,
        evidence: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            title: title.into(),
            evidence: evidence.into(),
            suggestion: suggestion.into(),
            source: IssueSource::Rule,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub chapter_number: usize,
    pub summary: String,
    pub issues: Vec<ConsistencyIssue>,
    /// Empty when no medium or high issue was found.
    pub regen_prompt_draft: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeshadowStatus {
    Open,
    Resolved,
    Contradicted,
}

impl ForeshadowStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "open" | "setup" | "planted" => Some(Self::Open),
            "resolved" | "closed" | "paid_off" => Some(Self::Resolved),
            "contradicted" | "broken" => Some(Self::Contradicted),
            _ => None,
        }
    }
}

/// One tracked foreshadowing thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeshadowEntry {
    pub title: String,
    pub status: ForeshadowStatus,
    pub introduced_at_chapter: usize,
    pub last_updated_chapter: usize,
}

/// A character note proposed by the model pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterUpdate {
    pub name: String,
    pub note: String,
}

/// Drop issues sharing category, severity, title and evidence, keeping the first.
pub fn dedup_issues(issues: Vec<ConsistencyIssue>) -> Vec<ConsistencyIssue> {
    let mut seen = HashSet::new();
    issues
        .into_iter()
        .filter(|issue| {
            seen.insert((
                issue.category,
                issue.severity,
                issue.title.trim().to_lowercase(),
                issue.evidence.trim().to_lowercase(),
            ))
        })
        .collect()
}

pub fn build_summary(
    chapter_number: usize,
    issues: &[ConsistencyIssue],
    model_summary: Option<&str>,
) -> String {
    let count = |s: Severity| issues.iter().filter(|i| i.severity == s).count();
    let mut summary = if issues.is_empty() {
        format!("Chapter {}: no consistency issues found", chapter_number)
    } else {
        format!(
            "Chapter {}: {} issue(s) ({} high, {} medium, {} low)",
            chapter_number,
            issues.len(),
            count(Severity::High),
            count(Severity::Medium),
            count(Severity::Low)
        )
    };
    if let Some(extra) = model_summary.map(str::trim).filter(|s| !s.is_empty()) {
        summary.push_str(". ");
        summary.push_str(extra);
    }
    summary
}

pub const REGEN_HARD_CONSTRAINTS: [&str; 3] = [
    "Do not introduce new major events.",
    "Preserve each character's established voice.",
    "Recover foreshadowing only lightly, at most one thread.",
];

/// Draft a regeneration prompt from the medium and high issues.
pub fn build_regen_draft(chapter_number: usize, issues: &[ConsistencyIssue]) -> String {
    let mut actionable: Vec<&ConsistencyIssue> = issues
        .iter()
        .filter(|i| i.severity >= Severity::Medium)
        .collect();
    if actionable.is_empty() {
        return String::new();
    }
    actionable.sort_by(|a, b| b.severity.cmp(&a.severity));

    let mut draft = format!(
        "Revise chapter {} to fix these consistency problems:\n",
        chapter_number
    );
    for (n, issue) in actionable.iter().enumerate() {
        draft.push_str(&format!(
            "{}. [{}] {}",
            n + 1,
            issue.severity,
            issue.title
        ));
        if !issue.suggestion.trim().is_empty() {
            draft.push_str(&format!(" - {}", issue.suggestion.trim()));
        }
        if !issue.evidence.trim().is_empty() {
            draft.push_str(&format!(
                " (evidence: {})",
                truncate_chars(issue.evidence.trim(), 160)
            ));
        }
        draft.push('\n');
    }
    draft.push_str("\nHard constraints:\n");
    for constraint in REGEN_HARD_CONSTRAINTS {
        draft.push_str("- ");
        draft.push_str(constraint);
        draft.push('\n');
    }
    draft
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(severity: Severity, title: &str) -> ConsistencyIssue {
        ConsistencyIssue::rule(IssueCategory::Timeline, severity, title, "day 3", "fix it")
    }

    #[test]
    fn test_dedup_uses_full_key() {
        let issues = vec![
            issue(Severity::High, "Regression"),
            issue(Severity::High, "regression "),
            issue(Severity::Low, "Regression"),
        ];
        let deduped = dedup_issues(issues);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let issues = vec![issue(Severity::High, "a"), issue(Severity::Low, "b")];
        let summary = build_summary(4, &issues, Some("Mostly fine"));
        assert!(summary.starts_with("Chapter 4: 2 issue(s) (1 high, 0 medium, 1 low)"));
        assert!(summary.ends_with("Mostly fine"));
        assert!(build_summary(1, &[], None).contains("no consistency issues"));
    }

    #[test]
    fn test_regen_draft_only_from_actionable_issues() {
        assert!(build_regen_draft(2, &[issue(Severity::Low, "minor")]).is_empty());

        let draft = build_regen_draft(
            2,
            &[issue(Severity::Medium, "second"), issue(Severity::High, "first")],
        );
        let first = draft.find("first").unwrap();
        let second = draft.find("second").unwrap();
        assert!(first < second);
        for constraint in REGEN_HARD_CONSTRAINTS {
            assert!(draft.contains(constraint));
        }
    }

    #[test]
    fn test_lenient_parsers() {
        assert_eq!(IssueCategory::parse("Foreshadowing"), IssueCategory::Foreshadow);
        assert_eq!(IssueCategory::parse("weird"), IssueCategory::Other);
        assert_eq!(Severity::parse("CRITICAL"), Severity::High);
        assert_eq!(Severity::parse(""), Severity::Low);
        assert_eq!(ForeshadowStatus::parse("paid_off"), Some(ForeshadowStatus::Resolved));
        assert_eq!(ForeshadowStatus::parse("maybe"), None);
    }
}
