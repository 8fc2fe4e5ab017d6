//! Section contracts for structured phase output.

use crate::errors::PipelineError;
use crate::phase::PromptKey;
use crate::prompt::missing_sections_reminder;

/// Heading text of a markdown (`## Title`) or bold-line (`**Title**`) heading.
fn heading_text(line: &str) -> Option<String> {
    let line = line.trim();
    let text = if line.starts_with('#') {
        line.trim_start_matches('#')
    } else if line.starts_with("**") && line.len() > 4 {
        line.trim_matches('*')
    } else {
        return None;
    };
    let text = text.trim().trim_matches('*').trim().trim_end_matches([':', '：']);
    Some(text.trim().to_lowercase())
}

/// Required headings for `key` that do not appear in `content`.
///
/// A heading satisfies a requirement when its text starts with the required
/// name, ignoring case.
pub fn missing_sections(key: PromptKey, content: &str) -> Vec<String> {
    let headings: Vec<String> = content.lines().filter_map(heading_text).collect();
    key.required_sections()
        .iter()
        .filter(|required| {
            let required = required.to_lowercase();
            !headings.iter().any(|h| h.starts_with(&required))
        })
        .map(|s| s.to_string())
        .collect()
}

pub fn check_contract(key: PromptKey, content: &str) -> Result<(), PipelineError> {
    let missing = missing_sections(key, content);
    if missing.is_empty() {
        return Ok(());
    }
    Err(PipelineError::MissingSections {
        prompt_key: key.as_str().to_string(),
        reminder: missing_sections_reminder(key, &missing),
        missing,
    })
}
