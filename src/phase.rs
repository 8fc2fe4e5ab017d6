//! Phase definitions for the story pipeline.
//!
//! This module provides:
//! - `Phase`, the fixed generation sequence
//!   (`compression → analysis → outline → breakdown → chapter1 → continuation`)
//! - `OutlineSubtask`, the two named parts of the outline phase
//! - `PromptKey`, one key per prompt the pipeline renders
//! - the section contracts some prompt keys must satisfy

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::compression::TaskId;

/// One stage of the fixed generation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compression,
    Analysis,
    Outline,
    Breakdown,
    Chapter1,
    Continuation,
}

impl Phase {
    /// All phases in pipeline order.
    pub const ALL: [Phase; 6] = [
        Phase::Compression,
        Phase::Analysis,
        Phase::Outline,
        Phase::Breakdown,
        Phase::Chapter1,
        Phase::Continuation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Compression => "compression",
            Phase::Analysis => "analysis",
            Phase::Outline => "outline",
            Phase::Breakdown => "breakdown",
            Phase::Chapter1 => "chapter1",
            Phase::Continuation => "continuation",
        }
    }

    /// The phase that follows this one. `continuation` loops onto itself.
    pub fn next(self) -> Phase {
        match self {
            Phase::Compression => Phase::Analysis,
            Phase::Analysis => Phase::Outline,
            Phase::Outline => Phase::Breakdown,
            Phase::Breakdown => Phase::Chapter1,
            Phase::Chapter1 | Phase::Continuation => Phase::Continuation,
        }
    }

    /// Phases whose output is a chapter of the story.
    pub fn is_chapter_producing(self) -> bool {
        matches!(self, Phase::Chapter1 | Phase::Continuation)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized || (normalized == "chapter_1" && *p == Phase::Chapter1))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: compression, analysis, outline, breakdown, chapter1, continuation",
                    s
                )
            })
    }
}

/// The two named parts of the outline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlineSubtask {
    /// Overall shape: arc and act structure
    Shape,
    /// Tension curve and foreshadowing
    Tension,
}

impl OutlineSubtask {
    pub const ALL: [OutlineSubtask; 2] = [OutlineSubtask::Shape, OutlineSubtask::Tension];

    pub fn as_str(self) -> &'static str {
        match self {
            OutlineSubtask::Shape => "shape",
            OutlineSubtask::Tension => "tension",
        }
    }

    pub fn prompt_key(self) -> PromptKey {
        match self {
            OutlineSubtask::Shape => PromptKey::OutlineShape,
            OutlineSubtask::Tension => PromptKey::OutlineTension,
        }
    }
}

impl fmt::Display for OutlineSubtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKey {
    Compression(TaskId),
    Analysis,
    OutlineShape,
    OutlineTension,
    BreakdownMeta,
    BreakdownChunk,
    Chapter1,
    Continuation,
    ConsistencyReview,
}

impl PromptKey {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptKey::Compression(task) => match task {
                TaskId::RoleCards => "compression.role_cards",
                TaskId::StyleGuide => "compression.style_guide",
                TaskId::PlotLedger => "compression.plot_ledger",
                TaskId::EvidencePack => "compression.evidence_pack",
                TaskId::EroticPack => "compression.erotic_pack",
            },
            PromptKey::Analysis => "analysis",
            PromptKey::OutlineShape => "outline.shape",
            PromptKey::OutlineTension => "outline.tension",
            PromptKey::BreakdownMeta => "breakdown.meta",
            PromptKey::BreakdownChunk => "breakdown.chunk",
            PromptKey::Chapter1 => "chapter1",
            PromptKey::Continuation => "continuation",
            PromptKey::ConsistencyReview => "consistency.review",
        }
    }

    /// Headings the output of this prompt must contain. Empty for keys without a contract.
    pub fn required_sections(self) -> &'static [&'static str] {
        match self {
            PromptKey::Analysis => &["Premise", "Characters", "Tone and Style"],
            PromptKey::OutlineShape => &["Overall Arc", "Act Structure"],
            PromptKey::OutlineTension => &["Tension Curve", "Foreshadowing"],
            PromptKey::BreakdownMeta => &["Chapter Overview"],
            _ => &[],
        }
    }
}

impl fmt::Display for PromptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
