//! Offline rule pass: characters and timeline.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use super::report::{ConsistencyIssue, IssueCategory, Severity};

/// Occurrences at which an undocumented capitalised name is flagged.
pub const UNKNOWN_NAME_THRESHOLD: usize = 4;

/// Maximum undocumented names reported per chapter.
const MAX_UNKNOWN_NAMES: usize = 3;

static CAPITALISED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]{2,}\b").expect("capitalised regex is valid"));

static DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bday\s+(\d{1,4})\b|第\s*(\d{1,4})\s*天").expect("day regex is valid")
});

/// Headings that look like names in a character-card blob.
const CARD_HEADINGS: &[&str] = &[
    "role cards",
    "character cards",
    "characters",
    "cast",
    "main characters",
    "supporting characters",
    "角色",
    "人物",
];

/// Capitalised words that are not names.
const COMMON_WORDS: &[&str] = &[
    "The", "And", "But", "Then", "When", "What", "Where", "Why", "How", "She", "Her", "His",
    "They", "Their", "There", "This", "That", "These", "Those", "You", "Your", "Not", "For",
    "With", "From", "Into", "After", "Before", "While", "Once", "Now", "Yes", "Its", "Our",
    "Chapter", "Day", "Night", "Morning", "Evening", "Monday", "Tuesday", "Wednesday",
    "Thursday", "Friday", "Saturday", "Sunday", "God", "Lord", "Sir", "Madam", "Mister",
];

/// Extract character names from a semi-structured character-card blob.
///
/// Accepts lines like `- Lin Wei: captain`, `Name: Lin Wei`, `**Mei** (pilot)`
/// or `## Lin Wei`.
pub fn extract_character_names(cards: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();

    for line in cards.lines() {
        let mut rest = line
            .trim()
            .trim_start_matches(['-', '*', '•', '#', '>', ' '])
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start_matches(['.', ')', ' '])
            .trim_start_matches('*');
        if rest.is_empty() {
            continue;
        }
        let lower = rest.to_lowercase();
        for prefix in ["name:", "name：", "姓名:", "姓名："] {
            if lower.starts_with(prefix) {
                rest = rest[prefix.len()..].trim_start();
                break;
            }
        }

        let end = rest
            .find([':', '：', '(', '（', '—', ',', '，', '*', '|'])
            .or_else(|| rest.find(" - "))
            .unwrap_or(rest.len());
        let candidate = rest[..end].trim().trim_matches('*').trim();
        if candidate.is_empty()
            || candidate.chars().count() > 40
            || candidate.split_whitespace().count() > 4
            || CARD_HEADINGS.contains(&candidate.to_lowercase().as_str())
        {
            continue;
        }
        // a bare line without a separator must look like a name
        if end == rest.len() && !looks_like_name(candidate) {
            continue;
        }
        if seen.insert(candidate.to_string()) {
            names.push(candidate.to_string());
        }
    }
    names
}

fn looks_like_name(candidate: &str) -> bool {
    candidate
        .split_whitespace()
        .all(|w| w.chars().next().is_some_and(|c| c.is_uppercase() || !c.is_ascii()))
}

/// Count capitalised tokens that are neither known names nor sentence-initial,
/// keeping those seen at least [`UNKNOWN_NAME_THRESHOLD`] times.
pub fn find_unknown_names(text: &str, known: &[String]) -> Vec<(String, usize)> {
    let known_words: HashSet<&str> = known
        .iter()
        .flat_map(|name| name.split_whitespace())
        .collect();

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for m in CAPITALISED_RE.find_iter(text) {
        let word = m.as_str();
        if known_words.contains(word) || COMMON_WORDS.contains(&word) {
            continue;
        }
        let preceding = text[..m.start()].trim_end_matches([' ', '\t']).chars().last();
        let sentence_start = match preceding {
            None => true,
            Some(c) => matches!(c, '.' | '!' | '?' | '\n' | '"' | '“' | '”' | '\'' | '。' | '」'),
        };
        if sentence_start {
            continue;
        }
        *counts.entry(word.to_string()).or_default() += 1;
    }

    let mut flagged: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, n)| *n >= UNKNOWN_NAME_THRESHOLD)
        .collect();
    flagged.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    flagged.truncate(MAX_UNKNOWN_NAMES);
    flagged
}

/// All `day N` / `第N天` markers in `text`.
pub fn day_markers(text: &str) -> Vec<u32> {
    DAY_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

pub fn check_characters(
    chapter_text: &str,
    known: &[String],
    unknown: &[(String, usize)],
) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();

    if !known.is_empty() && !known.iter().any(|name| chapter_text.contains(name.as_str())) {
        let listed: Vec<&str> = known.iter().take(5).map(String::as_str).collect();
        issues.push(ConsistencyIssue::rule(
            IssueCategory::Character,
            Severity::Medium,
            "No known character appears in this chapter",
            format!("Known characters: {}", listed.join(", ")),
            "Anchor the chapter on at least one established character",
        ));
    }

    for (name, count) in unknown {
        issues.push(ConsistencyIssue::rule(
            IssueCategory::Character,
            Severity::Low,
            format!("Possible undocumented character: {}", name),
            format!("'{}' appears {} times but has no character card", name, count),
            "Add a character card or check the name for typos",
        ));
    }
    issues
}

pub fn check_timeline(prior_text: &str, chapter_text: &str) -> Option<ConsistencyIssue> {
    let prior_max = day_markers(prior_text).into_iter().max()?;
    let current_min = day_markers(chapter_text).into_iter().min()?;
    (current_min < prior_max).then(|| {
        ConsistencyIssue::rule(
            IssueCategory::Timeline,
            Severity::Medium,
            "Timeline moves backwards",
            format!(
                "Earlier chapters reach day {}, this chapter mentions day {}",
                prior_max, current_min
            ),
            "Mark flashbacks explicitly or correct the day references",
        )
    })
}
