//! Shared utility functions for the storyforge crate.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\n(.*?)```").expect("fence regex is valid")
});

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object, ignoring braces
/// inside string literals.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JSON object from model output, preferring a fenced ```json block
/// and falling back to the first bare object in the text.
pub fn parse_json_payload(text: &str) -> Option<Value> {
    let fenced = FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| extract_json_object(m.as_str()));
    fenced
        .chain(extract_json_object(text))
        .find_map(|candidate| serde_json::from_str::<Value>(&candidate).ok())
        .filter(Value::is_object)
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
