//! Optional model pass: prompt construction and response parsing.

use async_trait::async_trait;
use serde_json::Value;

use super::report::{
    CharacterUpdate, ConsistencyIssue, ForeshadowEntry, ForeshadowStatus, IssueCategory,
    IssueSource, Severity,
};
use crate::errors::ProviderError;
use crate::util::{parse_json_payload, truncate_chars};

const MAX_CHAPTER_CHARS: usize = 24_000;
const MAX_CARDS_CHARS: usize = 6_000;

/// Sends a review prompt to a model and returns its raw reply.
#[async_trait]
pub trait ModelReviewer: Send + Sync {
    async fn review(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelFindings {
    pub summary: Option<String>,
    pub issues: Vec<ConsistencyIssue>,
    pub character_updates: Vec<CharacterUpdate>,
    pub foreshadow_updates: Vec<(String, ForeshadowStatus)>,
}

pub fn build_review_prompt(
    chapter_number: usize,
    chapter_text: &str,
    character_cards: &str,
    ledger: &[ForeshadowEntry],
) -> String {
    let ledger_lines = if ledger.is_empty() {
        "(none)".to_string()
    } else {
        ledger
            .iter()
            .map(|e| {
                format!(
                    "- {} [{:?}, since chapter {}]",
                    e.title, e.status, e.introduced_at_chapter
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are a continuity editor. Review chapter {chapter} against the character cards and the foreshadow ledger.

## Character cards
{cards}

## Foreshadow ledger
{ledger}

## Chapter {chapter}
{text}

Reply with a single JSON object and nothing else:
{{
  "summary": "one sentence",
  "issues": [{{"category": "character|timeline|foreshadow|continuity|style", "severity": "low|medium|high", "title": "...", "evidence": "quote from the chapter", "suggestion": "..."}}],
  "character_updates": [{{"name": "...", "note": "..."}}],
  "foreshadow_updates": [{{"title": "...", "status": "open|resolved|contradicted"}}]
}}"#,
        chapter = chapter_number,
        cards = truncate_chars(character_cards.trim(), MAX_CARDS_CHARS),
        ledger = ledger_lines,
        text = truncate_chars(chapter_text.trim(), MAX_CHAPTER_CHARS),
    )
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("").trim()
}

fn array_field<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Parse the model's reply. `None` when no JSON object can be recovered.
pub fn parse_review_response(raw: &str) -> Option<ModelFindings> {
    let value = parse_json_payload(raw)?;

    let issues = array_field(&value, "issues")
        .filter(|item| !str_field(item, "title").is_empty())
        .map(|item| ConsistencyIssue {
            category: IssueCategory::parse(str_field(item, "category")),
            severity: Severity::parse(str_field(item, "severity")),
            title: str_field(item, "title").to_string(),
            evidence: str_field(item, "evidence").to_string(),
            suggestion: str_field(item, "suggestion").to_string(),
            source: IssueSource::Model,
        })
        .collect();

    let character_updates = array_field(&value, "character_updates")
        .filter(|item| !str_field(item, "name").is_empty())
        .map(|item| CharacterUpdate {
            name: str_field(item, "name").to_string(),
            note: str_field(item, "note").to_string(),
        })
        .collect();

    let foreshadow_updates = array_field(&value, "foreshadow_updates")
        .filter_map(|item| {
            let title = str_field(item, "title");
            let status = ForeshadowStatus::parse(str_field(item, "status"))?;
            (!title.is_empty()).then(|| (title.to_string(), status))
        })
        .collect();

    let summary = Some(str_field(&value, "summary").to_string()).filter(|s| !s.is_empty());

    Some(ModelFindings {
        summary,
        issues,
        character_updates,
        foreshadow_updates,
    })
}

/// Low-severity issue recorded when the model pass yields nothing usable.
pub fn model_failure_issue(detail: &str) -> ConsistencyIssue {
    ConsistencyIssue {
        category: IssueCategory::Other,
        severity: Severity::Low,
        title: "Model review unavailable".to_string(),
        evidence: truncate_chars(detail.trim(), 200),
        suggestion: "Re-run the consistency check or review the chapter manually".to_string(),
        source: IssueSource::Model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_inputs() {
        let prompt = build_review_prompt(
            3,
            "Lin sailed.",
            "- Lin: captain",
            &[ForeshadowEntry {
                title: "silver locket".into(),
                status: ForeshadowStatus::Open,
                introduced_at_chapter: 1,
                last_updated_chapter: 1,
            }],
        );
        assert!(prompt.contains("Review chapter 3"));
        assert!(prompt.contains("- Lin: captain"));
        assert!(prompt.contains("silver locket"));
        assert!(prompt.contains("\"foreshadow_updates\""));
    }

    #[test]
    fn test_parse_fenced_response() {
        let raw = r#"Here you go:
```json
{
  "summary": "Mostly consistent",
  "issues": [
    {"category": "timeline", "severity": "high", "title": "Day jumps back", "evidence": "day 2", "suggestion": "fix"},
    {"category": "style", "severity": "low", "title": ""}
  ],
  "character_updates": [{"name": "Lin", "note": "now limps"}],
  "foreshadow_updates": [{"title": "silver locket", "status": "resolved"}, {"title": "x", "status": "???"}]
}
```"#;
        let findings = parse_review_response(raw).unwrap();
        assert_eq!(findings.summary.as_deref(), Some("Mostly consistent"));
        assert_eq!(findings.issues.len(), 1);
        assert_eq!(findings.issues[0].severity, Severity::High);
        assert_eq!(findings.issues[0].source, IssueSource::Model);
        assert_eq!(findings.character_updates[0].note, "now limps");
        assert_eq!(
            findings.foreshadow_updates,
            vec![("silver locket".to_string(), ForeshadowStatus::Resolved)]
        );
    }

    #[test]
    fn test_parse_bare_and_garbage() {
        let findings = parse_review_response(r#"{"issues": []}"#).unwrap();
        assert!(findings.issues.is_empty());
        assert!(findings.summary.is_none());
        assert!(parse_review_response("I could not review this.").is_none());
    }
}
