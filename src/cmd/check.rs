//! Rule-only consistency check: `storyforge check`.

use anyhow::{Context, Result};
use std::path::Path;

use storyforge::consistency::{ConsistencyInput, ConsistencyReport, Heuristics, check};

use super::session::SessionFile;

/// Check one chapter of a session file without calling a model.
///
/// `chapter` defaults to the latest chapter. With `save` the report and the
/// updated foreshadow ledger are written back to the file.
pub async fn cmd_check(path: &Path, chapter: Option<usize>, json: bool, save: bool) -> Result<()> {
    let mut file = SessionFile::load(path)?;
    let count = file.session.chapter_count();
    if count == 0 {
        anyhow::bail!("Session '{}' has no chapters to check", file.session_id());
    }
    let chapter_number = chapter.unwrap_or(count);
    let text = chapter_number
        .checked_sub(1)
        .and_then(|i| file.session.chapters.get(i))
        .with_context(|| {
            format!(
                "Chapter {} does not exist; the session has {} chapter(s)",
                chapter_number, count
            )
        })?;

    let input = ConsistencyInput {
        chapter_number,
        latest_chapter_text: text.clone(),
        all_chapters: file.session.chapters.clone(),
        character_cards: file.session.effective_character_cards().to_string(),
        prior_ledger: file.session.foreshadow_ledger.clone(),
    };
    let outcome = check(&input, &Heuristics::default(), None).await;
    tracing::info!(
        session_id = %file.session_id(),
        chapter = chapter_number,
        issues = outcome.report.issues.len(),
        "Consistency check finished"
    );

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome.report).context("Failed to render report")?
        );
    } else {
        print_report(&outcome.report);
    }

    if save {
        file.session.consistency_reports.push(outcome.report);
        file.session.foreshadow_ledger = outcome.ledger;
        file.save(path)?;
    }
    Ok(())
}

fn print_report(report: &ConsistencyReport) {
    println!("{}", report.summary);
    if report.issues.is_empty() {
        return;
    }
    println!();
    for issue in &report.issues {
        println!(
            "[{}] {}: {}",
            issue.severity,
            issue.category.as_str(),
            issue.title
        );
        if !issue.evidence.is_empty() {
            println!("    evidence: {}", issue.evidence);
        }
        if !issue.suggestion.is_empty() {
            println!("    suggestion: {}", issue.suggestion);
        }
    }
    if !report.regen_prompt_draft.is_empty() {
        println!();
        println!("Regeneration draft:");
        println!("{}", report.regen_prompt_draft);
    }
}
