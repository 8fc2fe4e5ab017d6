//! Consistency checker
//!
//! Runs after every chapter-producing phase as a side channel of the
//! pipeline. A rule pass always runs offline:
//!
//! - known character names must appear; frequent undocumented names are flagged
//! - `day N` / `第N天` markers must not move backwards
//! - foreshadow setups, resolutions and contradictions are merged into a ledger
//!
//! An optional model pass adds issues, character notes and ledger updates.
//! A failing or unparsable model pass becomes a low-severity issue.

mod foreshadow;
mod model;
mod report;
mod rules;

pub use foreshadow::{
    ForeshadowMention, ForeshadowSignal, STALE_AFTER_CHAPTERS, TITLE_MATCH_THRESHOLD,
    ledger_issues, merge_mentions, scan_mentions, title_key, title_overlap, titles_match,
};
pub use model::{ModelFindings, ModelReviewer, build_review_prompt, parse_review_response};
pub use report::{
    CharacterUpdate, ConsistencyIssue, ConsistencyReport, ForeshadowEntry, ForeshadowStatus,
    IssueCategory, IssueSource, REGEN_HARD_CONSTRAINTS, Severity, build_regen_draft,
    build_summary, dedup_issues,
};
pub use rules::{
    UNKNOWN_NAME_THRESHOLD, day_markers, extract_character_names, find_unknown_names,
};

/// Pluggable heuristics used by the rule pass.
#[derive(Clone, Copy)]
pub struct Heuristics {
    pub extract_names: fn(&str) -> Vec<String>,
    pub unknown_names: fn(&str, &[String]) -> Vec<(String, usize)>,
    pub titles_match: fn(&str, &str) -> bool,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            extract_names: extract_character_names,
            unknown_names: find_unknown_names,
            titles_match,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsistencyInput {
    pub chapter_number: usize,
    pub latest_chapter_text: String,
    /// Every chapter so far; entries before `chapter_number` count as prior text.
    pub all_chapters: Vec<String>,
    pub character_cards: String,
    pub prior_ledger: Vec<ForeshadowEntry>,
}

#[derive(Debug, Clone)]
pub struct ConsistencyOutcome {
    pub report: ConsistencyReport,
    pub ledger: Vec<ForeshadowEntry>,
    pub character_updates: Vec<CharacterUpdate>,
}

/// Run the rule pass and, when `reviewer` is set, the model pass.
pub async fn check(
    input: &ConsistencyInput,
    heuristics: &Heuristics,
    reviewer: Option<&dyn ModelReviewer>,
) -> ConsistencyOutcome {
    let chapter = input.chapter_number;
    let text = input.latest_chapter_text.as_str();
    let mut issues = Vec::new();

    let known = (heuristics.extract_names)(&input.character_cards);
    let unknown = (heuristics.unknown_names)(text, &known);
    issues.extend(rules::check_characters(text, &known, &unknown));

    let prior = input
        .all_chapters
        .iter()
        .take(chapter.saturating_sub(1))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    issues.extend(rules::check_timeline(&prior, text));

    let mut ledger = input.prior_ledger.clone();
    merge_mentions(
        &mut ledger,
        &scan_mentions(text),
        chapter,
        heuristics.titles_match,
    );

    let mut character_updates = Vec::new();
    let mut model_summary = None;
    if let Some(reviewer) = reviewer {
        let prompt = build_review_prompt(chapter, text, &input.character_cards, &ledger);
        match reviewer.review(&prompt).await {
            Ok(raw) => match parse_review_response(&raw) {
                Some(findings) => {
                    issues.extend(findings.issues);
                    character_updates = findings.character_updates;
                    for (title, status) in &findings.foreshadow_updates {
                        foreshadow::apply_update(
                            &mut ledger,
                            title,
                            *status,
                            chapter,
                            heuristics.titles_match,
                        );
                    }
                    model_summary = findings.summary;
                }
                None => {
                    tracing::warn!(chapter, "Model review returned no parsable JSON");
                    issues.push(model::model_failure_issue(&format!(
                        "Unparsable model output: {}",
                        raw
                    )));
                }
            },
            Err(err) => {
                tracing::warn!(chapter, error = %err, "Model review failed");
                issues.push(model::model_failure_issue(&err.to_string()));
            }
        }
    }

    issues.extend(ledger_issues(&ledger, chapter));
    let issues = dedup_issues(issues);

    let report = ConsistencyReport {
        chapter_number: chapter,
        summary: build_summary(chapter, &issues, model_summary.as_deref()),
        regen_prompt_draft: build_regen_draft(chapter, &issues),
        issues,
    };
    tracing::info!(
        chapter,
        issues = report.issues.len(),
        ledger = ledger.len(),
        "Consistency check complete"
    );

    ConsistencyOutcome {
        report,
        ledger,
        character_updates,
    }
}
