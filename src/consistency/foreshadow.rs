//! Foreshadow ledger: keyword scan, fuzzy title matching and merge.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::report::{
    ConsistencyIssue, ForeshadowEntry, ForeshadowStatus, IssueCategory, Severity,
};
use crate::util::truncate_chars;

/// Chapters an entry may stay open before it is flagged.
pub const STALE_AFTER_CHAPTERS: usize = 3;

/// Minimum overlap coefficient for two titles to be the same thread.
pub const TITLE_MATCH_THRESHOLD: f64 = 0.5;

const MAX_TITLE_CHARS: usize = 80;

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?。！？\n]+").expect("sentence regex is valid"));

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("word regex is valid"));

const SETUP_KEYWORDS: &[&str] = &[
    "foreshadow", "mysterious", "secret", "someday", "one day", "promised", "promise", "vowed",
    "swore", "hidden", "prophecy", "伏笔", "秘密", "发誓", "承诺", "预言",
];

const RESOLUTION_KEYWORDS: &[&str] = &[
    "finally", "revealed", "the truth", "at last", "fulfilled", "kept the promise", "solved",
    "揭开", "真相", "终于", "兑现",
];

const CONTRADICTION_KEYWORDS: &[&str] = &[
    "never happened", "contrary to", "contradict", "but earlier", "no such", "矛盾", "从未",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "but", "that", "this", "with", "from", "into", "was", "were", "had", "has",
    "his", "her", "their", "she", "they", "him", "them", "for", "about", "what", "would",
    "could", "all", "one", "day", "who", "which", "there", "its",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeshadowSignal {
    Setup,
    Resolution,
    Contradiction,
}

/// A sentence carrying a foreshadow signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeshadowMention {
    pub signal: ForeshadowSignal,
    pub title: String,
}

fn contains_any(lower: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| lower.contains(k))
}

/// Scan `text` sentence by sentence for setup, resolution and contradiction
/// keywords. Contradiction outranks resolution, which outranks setup.
pub fn scan_mentions(text: &str) -> Vec<ForeshadowMention> {
    SENTENCE_RE
        .find_iter(text)
        .filter_map(|m| {
            let sentence = m.as_str().trim();
            if sentence.is_empty() {
                return None;
            }
            let lower = sentence.to_lowercase();
            let signal = if contains_any(&lower, CONTRADICTION_KEYWORDS) {
                ForeshadowSignal::Contradiction
            } else if contains_any(&lower, RESOLUTION_KEYWORDS) {
                ForeshadowSignal::Resolution
            } else if contains_any(&lower, SETUP_KEYWORDS) {
                ForeshadowSignal::Setup
            } else {
                return None;
            };
            Some(ForeshadowMention {
                signal,
                title: truncate_chars(sentence, MAX_TITLE_CHARS),
            })
        })
        .collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Normalized key tokens of a title: lowercased content words, with CJK
/// text split into single characters. Signal keywords and stopwords are dropped.
pub fn title_key(title: &str) -> HashSet<String> {
    let mut lower = title.to_lowercase();
    for keyword in SETUP_KEYWORDS
        .iter()
        .chain(RESOLUTION_KEYWORDS)
        .chain(CONTRADICTION_KEYWORDS)
    {
        lower = lower.replace(keyword, " ");
    }

    let mut key = HashSet::new();
    for word in WORD_RE.find_iter(&lower).map(|m| m.as_str()) {
        if word.chars().any(is_cjk) {
            key.extend(word.chars().filter(|c| is_cjk(*c)).map(String::from));
        } else if word.chars().count() >= 3 && !STOPWORDS.contains(&word) {
            key.insert(word.to_string());
        }
    }
    key
}

/// Overlap coefficient of the two title keys, `|A ∩ B| / min(|A|, |B|)`.
pub fn title_overlap(a: &str, b: &str) -> f64 {
    let (a, b) = (title_key(a), title_key(b));
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / smaller as f64
}

pub fn titles_match(a: &str, b: &str) -> bool {
    title_overlap(a, b) >= TITLE_MATCH_THRESHOLD
}

/// Merge mentions from `chapter_number` into `ledger`.
pub fn merge_mentions(
    ledger: &mut Vec<ForeshadowEntry>,
    mentions: &[ForeshadowMention],
    chapter_number: usize,
    matches: fn(&str, &str) -> bool,
) {
    for mention in mentions {
        let existing = ledger.iter_mut().find(|e| matches(&e.title, &mention.title));
        match (mention.signal, existing) {
            (ForeshadowSignal::Setup, Some(entry)) => {
                entry.last_updated_chapter = chapter_number;
            }
            (ForeshadowSignal::Setup, None) => ledger.push(ForeshadowEntry {
                title: mention.title.clone(),
                status: ForeshadowStatus::Open,
                introduced_at_chapter: chapter_number,
                last_updated_chapter: chapter_number,
            }),
            (ForeshadowSignal::Resolution, Some(entry)) => {
                if entry.status == ForeshadowStatus::Open {
                    entry.status = ForeshadowStatus::Resolved;
                }
                entry.last_updated_chapter = chapter_number;
            }
            (ForeshadowSignal::Contradiction, Some(entry)) => {
                entry.status = ForeshadowStatus::Contradicted;
                entry.last_updated_chapter = chapter_number;
            }
            // nothing to resolve or contradict
            (_, None) => {}
        }
    }
}

/// Apply a status from the model pass, adding the entry when it is new.
pub fn apply_update(
    ledger: &mut Vec<ForeshadowEntry>,
    title: &str,
    status: ForeshadowStatus,
    chapter_number: usize,
    matches: fn(&str, &str) -> bool,
) {
    if let Some(entry) = ledger.iter_mut().find(|e| matches(&e.title, title)) {
        entry.status = status;
        entry.last_updated_chapter = chapter_number;
    } else {
        ledger.push(ForeshadowEntry {
            title: truncate_chars(title.trim(), MAX_TITLE_CHARS),
            status,
            introduced_at_chapter: chapter_number,
            last_updated_chapter: chapter_number,
        });
    }
}

/// Issues for stale open entries and every contradicted entry.
pub fn ledger_issues(ledger: &[ForeshadowEntry], chapter_number: usize) -> Vec<ConsistencyIssue> {
    ledger
        .iter()
        .filter_map(|entry| match entry.status {
            ForeshadowStatus::Contradicted => Some(ConsistencyIssue::rule(
                IssueCategory::Foreshadow,
                Severity::High,
                format!("Foreshadow contradicted: {}", entry.title),
                format!(
                    "Introduced in chapter {}, contradicted by chapter {}",
                    entry.introduced_at_chapter, entry.last_updated_chapter
                ),
                "Reconcile the later text with the original setup",
            )),
            ForeshadowStatus::Open
                if chapter_number.saturating_sub(entry.introduced_at_chapter)
                    >= STALE_AFTER_CHAPTERS =>
            {
                Some(ConsistencyIssue::rule(
                    IssueCategory::Foreshadow,
                    Severity::Low,
                    format!("Foreshadow still open: {}", entry.title),
                    format!(
                        "Open since chapter {} ({} chapters)",
                        entry.introduced_at_chapter,
                        chapter_number - entry.introduced_at_chapter
                    ),
                    "Advance or resolve this thread soon",
                ))
            }
            _ => None,
        })
        .collect()
}
