//! Prompt rendering.
//!
//! Every [`PromptKey`] has a built-in template; `[prompts]` in the config
//! replaces it. Templates are minijinja and see the fields of [`PromptVars`].

use minijinja::Environment;
use serde::Serialize;

use crate::compression::{TaskId, marker_aliases};
use crate::config::ConfigResolver;
use crate::errors::PipelineError;
use crate::phase::PromptKey;

const COMPRESSION_TEMPLATE: &str = include_str!("templates/compression.md");
const ANALYSIS_TEMPLATE: &str = include_str!("templates/analysis.md");
const OUTLINE_SHAPE_TEMPLATE: &str = include_str!("templates/outline_shape.md");
const OUTLINE_TENSION_TEMPLATE: &str = include_str!("templates/outline_tension.md");
const BREAKDOWN_META_TEMPLATE: &str = include_str!("templates/breakdown_meta.md");
const BREAKDOWN_CHUNK_TEMPLATE: &str = include_str!("templates/breakdown_chunk.md");
const CHAPTER1_TEMPLATE: &str = include_str!("templates/chapter1.md");
const CONTINUATION_TEMPLATE: &str = include_str!("templates/continuation.md");
const CONSISTENCY_REVIEW_TEMPLATE: &str = include_str!("templates/consistency_review.md");

/// Appended to the prompt when a length cutoff is resumed.
pub const RESUME_DIRECTIVE: &str = "Your previous answer was cut off. Resume exactly where the output above stops. Do not repeat any of it and do not restart the section.";

/// Characters of the partial output quoted back when resuming.
const RESUME_TAIL_CHARS: usize = 4000;

/// Values available to every template. Empty fields render as empty strings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptVars {
    /// Story material: raw source or compressed context
    pub source: String,
    /// `raw` or `compressed`
    pub source_kind: String,
    pub user_notes: Option<String>,
    pub required_sections: Vec<String>,
    pub analysis: String,
    pub outline: String,
    pub outline_shape: String,
    pub breakdown: String,
    pub breakdown_meta: String,
    pub range_start: u32,
    pub range_end: u32,
    pub target_chapters: u32,
    pub chapter_number: usize,
    pub previous_chapter: String,
    pub character_cards: String,
    // compression tasks
    pub task: String,
    pub heading: String,
    pub marker: String,
    pub segments: String,
    /// Built-in review body for `consistency.review`
    pub review: String,
}

impl PromptVars {
    pub fn for_compression(task: TaskId, segments: &str) -> Self {
        Self {
            task: task.as_str().to_string(),
            heading: task.heading().to_string(),
            marker: marker_aliases(task)[0].to_string(),
            segments: segments.to_string(),
            ..Default::default()
        }
    }
}

fn builtin(key: PromptKey) -> &'static str {
    match key {
        PromptKey::Compression(_) => COMPRESSION_TEMPLATE,
        PromptKey::Analysis => ANALYSIS_TEMPLATE,
        PromptKey::OutlineShape => OUTLINE_SHAPE_TEMPLATE,
        PromptKey::OutlineTension => OUTLINE_TENSION_TEMPLATE,
        PromptKey::BreakdownMeta => BREAKDOWN_META_TEMPLATE,
        PromptKey::BreakdownChunk => BREAKDOWN_CHUNK_TEMPLATE,
        PromptKey::Chapter1 => CHAPTER1_TEMPLATE,
        PromptKey::Continuation => CONTINUATION_TEMPLATE,
        PromptKey::ConsistencyReview => CONSISTENCY_REVIEW_TEMPLATE,
    }
}

/// Render the template for `key`, preferring the configured override.
/// `required_sections` is filled from the key's contract.
pub fn render(
    config: &dyn ConfigResolver,
    key: PromptKey,
    vars: &PromptVars,
) -> Result<String, PipelineError> {
    let source = config.prompt_template(key);
    let template = source.as_deref().unwrap_or_else(|| builtin(key));

    let mut vars = vars.clone();
    if vars.required_sections.is_empty() {
        vars.required_sections = key
            .required_sections()
            .iter()
            .map(|s| s.to_string())
            .collect();
    }

    let env = Environment::new();
    let rendered = env
        .render_str(template, &vars)
        .map_err(|e| PipelineError::Template {
            key: key.as_str().to_string(),
            message: e.to_string(),
        })?;
    tracing::trace!(prompt_key = %key, chars = rendered.len(), overridden = source.is_some(), "Rendered prompt");
    Ok(rendered.trim().to_string())
}

/// Build the follow-up prompt that continues a cut-off answer.
pub fn resume_prompt(original_prompt: &str, partial_output: &str) -> String {
    let chars: Vec<char> = partial_output.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(RESUME_TAIL_CHARS)..]
        .iter()
        .collect();
    format!(
        "{}\n\n## Output so far\n\n{}\n\n{}",
        original_prompt, tail, RESUME_DIRECTIVE
    )
}

/// Reminder listing headings missing from a contract-bound output.
pub fn missing_sections_reminder(key: PromptKey, missing: &[String]) -> String {
    let list = missing
        .iter()
        .map(|s| format!("- ## {}", s))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Output for '{}' is missing required sections:\n{}\nRegenerate and include every heading listed above.",
        key, list
    )
}
