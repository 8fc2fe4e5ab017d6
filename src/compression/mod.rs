//! Compression sub-pipeline
//!
//! Reduces a long source text to a compact context for the later phases:
//!
//! - **Chunking**: the source is split into overlapping character chunks and
//!   sampled down to at most `max_segments` representative segments
//! - **Fan-out**: independent extraction tasks run concurrently on a
//!   pull-based queue bounded by `parallelism`
//! - **Fan-in**: extracted sections are concatenated under canonical
//!   headings in a fixed order, without a model call
//!
//! ## Configuration
//!
//! ```toml
//! [compression]
//! mode = "auto"            # on | off | auto
//! threshold_chars = 120000 # auto compresses above this size
//! chunk_size = 6000
//! overlap = 400
//! max_segments = 12
//! parallelism = 4
//! ```

mod chunk;
mod extract;
mod merge;

pub use chunk::{Chunk, render_segments, sample_chunks, split_chunks};
pub use extract::{extract_section, marker_aliases};
pub use merge::merge_sections;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;

/// When the compression phase runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    On,
    Off,
    #[default]
    Auto,
}

impl FromStr for CompressionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "on" | "always" | "true" => Ok(Self::On),
            "off" | "never" | "false" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid compression mode '{}'. Valid values: on, off, auto",
                s
            )),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Auto => "auto",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub mode: CompressionMode,
    pub threshold_chars: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_segments: usize,
    pub parallelism: usize,
    pub include_erotic_pack: bool,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            mode: CompressionMode::Auto,
            threshold_chars: 120_000,
            chunk_size: 6000,
            overlap: 400,
            max_segments: 12,
            parallelism: 4,
            include_erotic_pack: false,
        }
    }
}

impl CompressionSettings {
    /// Extraction tasks this configuration runs, in merge order.
    pub fn tasks(&self) -> Vec<TaskId> {
        TaskId::ALL
            .into_iter()
            .filter(|t| *t != TaskId::EroticPack || self.include_erotic_pack)
            .collect()
    }
}

/// One independent extraction task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    RoleCards,
    StyleGuide,
    PlotLedger,
    EvidencePack,
    EroticPack,
}

impl TaskId {
    pub const ALL: [TaskId; 5] = [
        TaskId::RoleCards,
        TaskId::StyleGuide,
        TaskId::PlotLedger,
        TaskId::EvidencePack,
        TaskId::EroticPack,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskId::RoleCards => "role_cards",
            TaskId::StyleGuide => "style_guide",
            TaskId::PlotLedger => "plot_ledger",
            TaskId::EvidencePack => "evidence_pack",
            TaskId::EroticPack => "erotic_pack",
        }
    }

    /// Canonical heading used when merging.
    pub fn heading(self) -> &'static str {
        match self {
            TaskId::RoleCards => "Role Cards",
            TaskId::StyleGuide => "Style Guide",
            TaskId::PlotLedger => "Plot Ledger",
            TaskId::EvidencePack => "Evidence Pack",
            TaskId::EroticPack => "Erotic Content Pack",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ok,
    /// Succeeded on the second attempt
    Retry,
    /// Succeeded but the section marker was missing; raw output kept.
    /// Takes precedence over `Retry`; see [`CompressionMeta::retried_tasks`].
    Fallback,
    Failed,
}

/// Extracted sections plus the merged context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionArtifacts {
    pub role_cards: String,
    pub style_guide: String,
    pub plot_ledger: String,
    pub evidence_pack: String,
    pub erotic_pack: Option<String>,
    pub compressed_context: String,
}

impl CompressionArtifacts {
    pub fn has_context(&self) -> bool {
        !self.compressed_context.trim().is_empty()
    }

    fn set(&mut self, task: TaskId, content: String) {
        match task {
            TaskId::RoleCards => self.role_cards = content,
            TaskId::StyleGuide => self.style_guide = content,
            TaskId::PlotLedger => self.plot_ledger = content,
            TaskId::EvidencePack => self.evidence_pack = content,
            TaskId::EroticPack => self.erotic_pack = Some(content),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionMeta {
    pub source_chars: usize,
    pub compressed_chars: usize,
    pub ratio: f64,
    pub chunk_count: usize,
    pub sampled_chunk_count: usize,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub task_status: BTreeMap<TaskId, TaskStatus>,
    pub task_durations_ms: BTreeMap<TaskId, u64>,
    /// Tasks that needed a second attempt, whatever their final status
    #[serde(default)]
    pub retried_tasks: BTreeSet<TaskId>,
}

/// Whether compression runs for a source of `source_chars` characters.
pub fn should_run(mode: CompressionMode, source_chars: usize, threshold: usize) -> bool {
    match mode {
        CompressionMode::On => true,
        CompressionMode::Off => false,
        CompressionMode::Auto => source_chars > threshold,
    }
}

fn skip_reason(settings: &CompressionSettings, source_chars: usize) -> String {
    match settings.mode {
        CompressionMode::Off => "Compression is turned off".to_string(),
        _ => format!(
            "Source has {} characters, within the {} character threshold",
            source_chars, settings.threshold_chars
        ),
    }
}

/// Runs one extraction task against the sampled segments.
///
/// Only `PipelineError::Provider` failures are retried.
#[async_trait]
pub trait ExtractionRunner: Send + Sync {
    async fn extract(
        &self,
        task: TaskId,
        segments: &str,
        cancel: CancellationToken,
    ) -> Result<String, PipelineError>;
}

#[derive(Debug)]
pub enum CompressionOutcome {
    Skipped(CompressionMeta),
    Completed {
        artifacts: CompressionArtifacts,
        meta: CompressionMeta,
    },
}

impl CompressionOutcome {
    pub fn meta(&self) -> &CompressionMeta {
        match self {
            Self::Skipped(meta) => meta,
            Self::Completed { meta, .. } => meta,
        }
    }
}

/// A failed run, with the meta recorded up to the failure.
#[derive(Debug)]
pub struct CompressionFailure {
    pub meta: CompressionMeta,
    pub error: PipelineError,
}

#[derive(Default)]
struct TaskLedger {
    status: BTreeMap<TaskId, TaskStatus>,
    durations: BTreeMap<TaskId, u64>,
    retried: BTreeSet<TaskId>,
    sections: BTreeMap<TaskId, String>,
    error: Option<PipelineError>,
}

/// Run the compression sub-pipeline over `source`.
pub async fn compress(
    source: &str,
    settings: &CompressionSettings,
    runner: &dyn ExtractionRunner,
    cancel: &CancellationToken,
) -> Result<CompressionOutcome, CompressionFailure> {
    let source_chars = source.chars().count();
    let mut meta = CompressionMeta {
        source_chars,
        ..Default::default()
    };

    if !should_run(settings.mode, source_chars, settings.threshold_chars) {
        let reason = skip_reason(settings, source_chars);
        tracing::info!(source_chars, reason = %reason, "Skipping compression");
        meta.skipped = true;
        meta.skip_reason = Some(reason);
        return Ok(CompressionOutcome::Skipped(meta));
    }
    if source_chars == 0 {
        return Err(CompressionFailure {
            meta,
            error: PipelineError::InvalidState("No source text to compress".to_string()),
        });
    }

    let chunks = split_chunks(source, settings.chunk_size, settings.overlap);
    meta.chunk_count = chunks.len();
    let sampled = sample_chunks(chunks, settings.max_segments);
    meta.sampled_chunk_count = sampled.len();
    let segments = render_segments(&sampled, meta.chunk_count);

    let tasks = settings.tasks();
    let workers = settings.parallelism.max(1).min(tasks.len());
    tracing::info!(
        source_chars,
        chunks = meta.chunk_count,
        sampled = meta.sampled_chunk_count,
        tasks = tasks.len(),
        workers,
        "Starting compression"
    );

    let queue = Mutex::new(VecDeque::from(tasks));
    let ledger = Mutex::new(TaskLedger::default());
    let abort = cancel.child_token();

    join_all((0..workers).map(|_| worker(&queue, &ledger, runner, &segments, &abort))).await;

    let ledger = ledger.into_inner().unwrap_or_else(|p| p.into_inner());
    meta.task_status = ledger.status;
    meta.task_durations_ms = ledger.durations;
    meta.retried_tasks = ledger.retried;

    if let Some(error) = ledger.error {
        return Err(CompressionFailure { meta, error });
    }
    if cancel.is_cancelled() {
        return Err(CompressionFailure {
            meta,
            error: PipelineError::Cancelled,
        });
    }

    let mut artifacts = CompressionArtifacts::default();
    for (task, content) in &ledger.sections {
        artifacts.set(*task, content.clone());
    }
    artifacts.compressed_context = merge_sections(&ledger.sections);
    meta.compressed_chars = artifacts.compressed_context.chars().count();
    meta.ratio = meta.compressed_chars as f64 / source_chars as f64;

    tracing::info!(
        compressed_chars = meta.compressed_chars,
        ratio = meta.ratio,
        "Compression complete"
    );
    Ok(CompressionOutcome::Completed { artifacts, meta })
}

async fn worker(
    queue: &Mutex<VecDeque<TaskId>>,
    ledger: &Mutex<TaskLedger>,
    runner: &dyn ExtractionRunner,
    segments: &str,
    abort: &CancellationToken,
) {
    loop {
        if abort.is_cancelled() {
            return;
        }
        let Some(task) = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front() else {
            return;
        };

        let started = Instant::now();
        let mut status = TaskStatus::Ok;
        let mut result = runner.extract(task, segments, abort.clone()).await;
        if let Err(err @ PipelineError::Provider(_)) = &result
            && !err.is_cancellation()
            && !abort.is_cancelled()
        {
            tracing::warn!(task = %task, error = %err, "Extraction task failed, retrying once");
            status = TaskStatus::Retry;
            result = runner.extract(task, segments, abort.clone()).await;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut ledger = ledger.lock().unwrap_or_else(|p| p.into_inner());
        if status == TaskStatus::Retry {
            ledger.retried.insert(task);
        }
        match result {
            Ok(raw) => {
                let section = match extract_section(task, &raw) {
                    Some(section) => section,
                    None => {
                        tracing::warn!(task = %task, "Section marker missing, keeping raw output");
                        status = TaskStatus::Fallback;
                        raw.trim().to_string()
                    }
                };
                tracing::debug!(task = %task, ?status, elapsed_ms, "Extraction task finished");
                ledger.status.insert(task, status);
                ledger.durations.insert(task, elapsed_ms);
                ledger.sections.insert(task, section);
            }
            Err(err) if err.is_cancellation() => {
                if ledger.error.is_none() {
                    ledger.error = Some(PipelineError::Cancelled);
                }
                return;
            }
            Err(err) => {
                tracing::error!(task = %task, error = %err, "Extraction task failed");
                ledger.status.insert(task, TaskStatus::Failed);
                ledger.durations.insert(task, elapsed_ms);
                // a real failure outranks the cancellations it triggers
                if ledger.error.as_ref().is_none_or(PipelineError::is_cancellation) {
                    ledger.error = Some(match err {
                        PipelineError::Provider(source) => {
                            PipelineError::CompressionTask { task, source }
                        }
                        other => other,
                    });
                }
                abort.cancel();
                return;
            }
        }
    }
}
