//! Persisted session and workflow step models.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compression::{CompressionArtifacts, CompressionMeta};
use crate::consistency::{ConsistencyReport, ForeshadowEntry};
use crate::phase::{OutlineSubtask, Phase};
use crate::provider::FinishReason;

/// Externally observable run status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Error,
    Interrupted,
}

impl RunStatus {
    /// Queued or running.
    pub fn is_in_flight(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Error => "error",
            RunStatus::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Persisted mirror of a session's run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub status: RunStatus,
    /// Phase to offer for resumption after an error or interruption
    pub recoverable_phase: Option<Phase>,
    pub last_error: Option<String>,
    pub last_run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Idle,
    Streaming,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TruncationState {
    pub is_truncated: bool,
    pub last_finish_reason: Option<FinishReason>,
    pub auto_resume_rounds_used: u32,
    /// Stage that was cut off when the step has several
    pub last_truncated_subtask: Option<String>,
}

/// One phase's workflow step as presented to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub phase: Phase,
    pub status: StepStatus,
    pub content: String,
    pub truncation: TruncationState,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: StepStatus::Idle,
            content: String::new(),
            truncation: TruncationState::default(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// How continuation chapters are chained automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AutomationPolicy {
    #[default]
    Manual,
    FullAuto,
    /// Chain while the next chapter number is within `from..=to`
    Range { from: u32, to: u32 },
}

/// Read model of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub source_text: String,
    pub compression: Option<CompressionArtifacts>,
    pub compression_meta: Option<CompressionMeta>,
    /// Output of the non-chapter phases
    pub outputs: BTreeMap<Phase, String>,
    pub outline_sections: BTreeMap<OutlineSubtask, String>,
    pub chapters: Vec<String>,
    pub character_cards: String,
    pub foreshadow_ledger: Vec<ForeshadowEntry>,
    pub automation: AutomationPolicy,
    pub paused: bool,
    pub target_chapter_count: Option<u32>,
    pub run_meta: Option<RunMeta>,
    pub consistency_reports: Vec<ConsistencyReport>,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            source_text: source_text.into(),
            ..Default::default()
        }
    }

    pub fn output(&self, phase: Phase) -> Option<&str> {
        self.outputs
            .get(&phase)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn compressed_context(&self) -> Option<&str> {
        self.compression
            .as_ref()
            .filter(|c| c.has_context())
            .map(|c| c.compressed_context.as_str())
    }

    /// Character cards from the session, falling back to the role cards
    /// extracted by compression.
    pub fn effective_character_cards(&self) -> &str {
        if !self.character_cards.trim().is_empty() {
            return &self.character_cards;
        }
        self.compression
            .as_ref()
            .map(|c| c.role_cards.as_str())
            .unwrap_or("")
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }
}

/// Partial update applied by [`super::SessionStore::update_workflow`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub compression: Option<CompressionArtifacts>,
    pub compression_meta: Option<CompressionMeta>,
    pub outline_section: Option<(OutlineSubtask, String)>,
    pub foreshadow_ledger: Option<Vec<ForeshadowEntry>>,
    /// Notes appended to the character cards
    pub character_notes: Vec<String>,
    /// Replace the most recent chapter instead of appending
    pub replace_latest_chapter: Option<String>,
}
