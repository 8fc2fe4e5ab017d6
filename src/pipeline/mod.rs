//! Phase pipeline executor
//!
//! Implements [`RunExecutor`] for the fixed phase sequence
//! `compression → analysis → outline → breakdown → chapter1 → continuation`.
//!
//! For every run the executor:
//! - marks the step `streaming` and resolves the phase's generation config
//! - picks raw source or compressed context
//! - streams each stage, auto-resuming length cutoffs where the policy allows
//! - validates section contracts and stores the result
//!
//! Chapter-producing phases then hand the new chapter to the consistency
//! checker in the background, and `continuation` may enqueue the next chapter.

mod breakdown;
mod chapter;
mod compression;
mod contract;
mod outline;
mod review;
mod source;
mod stage;
mod step;

pub use breakdown::chunk_ranges;
pub use chapter::should_chain;
pub use contract::{check_contract, missing_sections};
pub use outline::{merge_outline, parse_outline_directive};
pub use source::{SourceMaterial, select_source};
pub use step::FLUSH_INTERVAL;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use crate::config::ConfigResolver;
use crate::consistency::Heuristics;
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::provider::{CompletionProvider, GenerationConfig, ProviderRegistry};
use crate::scheduler::{ContinuationPolicy, RunContext, RunExecutor, SchedulerHandle};
use crate::store::{SessionSnapshot, SessionStore, StepStore};
use stage::{Stage, StageOutput, run_stage};
use step::StepWriter;

/// Drives one phase per run against the configured providers and stores.
pub struct PipelineExecutor {
    store: Arc<dyn SessionStore>,
    steps: Arc<dyn StepStore>,
    config: Arc<dyn ConfigResolver>,
    providers: Arc<ProviderRegistry>,
    scheduler: SchedulerHandle,
    heuristics: Heuristics,
    side_tasks: TaskTracker,
    /// Completion signal of the newest consistency check per session.
    /// Checks for one session run one after another in chapter order.
    review_tail: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        steps: Arc<dyn StepStore>,
        config: Arc<dyn ConfigResolver>,
        providers: Arc<ProviderRegistry>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            store,
            steps,
            config,
            providers,
            scheduler,
            heuristics: Heuristics::default(),
            side_tasks: TaskTracker::new(),
            review_tail: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_heuristics(mut self, heuristics: Heuristics) -> Self {
        self.heuristics = heuristics;
        self
    }

    /// Wait for every background consistency check spawned so far.
    pub async fn drain_side_tasks(&self) {
        self.side_tasks.close();
        self.side_tasks.wait().await;
        self.side_tasks.reopen();
    }

    fn provider_for(
        &self,
        generation: &GenerationConfig,
    ) -> Result<Arc<dyn CompletionProvider>, crate::errors::ProviderError> {
        self.providers.get(&generation.provider)
    }

    fn resume_rounds(&self, phase: Phase) -> u32 {
        let policy = self.config.auto_resume();
        if policy.is_eligible(phase) {
            policy.max_rounds
        } else {
            0
        }
    }

    /// Stream one stage of `phase` into `writer`.
    async fn stage(
        &self,
        ctx: &RunContext,
        writer: &mut StepWriter<'_>,
        phase: Phase,
        label: &str,
        prompt: String,
        resume_from: Option<String>,
    ) -> Result<StageOutput, PipelineError> {
        let generation = self.config.generation(phase);
        let provider = self.provider_for(&generation)?;
        tracing::debug!(
            session_id = %ctx.session_id,
            run_id = %ctx.run_id,
            stage = label,
            provider = %generation.provider,
            model = %generation.model,
            "Starting stage"
        );
        run_stage(
            ctx,
            provider.as_ref(),
            &generation,
            &self.config.retry(),
            writer,
            Stage {
                phase,
                label,
                prompt,
                max_resume_rounds: self.resume_rounds(phase),
                resume_from,
            },
        )
        .await
    }

    /// Stored content to continue when the run asks for a manual resume.
    fn manual_resume(
        &self,
        ctx: &RunContext,
        writer: &StepWriter<'_>,
    ) -> Result<Option<String>, PipelineError> {
        if ctx.continuation_policy != Some(ContinuationPolicy::ResumeTruncated) {
            return Ok(None);
        }
        let previous = writer.previous();
        if previous.content.trim().is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "No stored {} content to resume",
                ctx.step
            )));
        }
        Ok(Some(previous.content.clone()))
    }

    async fn run_phase(
        &self,
        ctx: &RunContext,
        snapshot: &SessionSnapshot,
        writer: &mut StepWriter<'_>,
    ) -> Result<(), PipelineError> {
        match ctx.step {
            Phase::Compression => self.run_compression(ctx, snapshot, writer).await,
            Phase::Analysis => self.run_analysis(ctx, snapshot, writer).await,
            Phase::Outline => self.run_outline(ctx, snapshot, writer).await,
            Phase::Breakdown => self.run_breakdown(ctx, snapshot, writer).await,
            Phase::Chapter1 | Phase::Continuation => self.run_chapter(ctx, snapshot, writer).await,
        }
    }

    async fn run_analysis(
        &self,
        ctx: &RunContext,
        snapshot: &SessionSnapshot,
        writer: &mut StepWriter<'_>,
    ) -> Result<(), PipelineError> {
        let source = select_source(Phase::Analysis, snapshot, &self.config.compression())?;
        let vars = crate::prompt::PromptVars {
            source: source.text().to_string(),
            source_kind: source.kind().to_string(),
            user_notes: user_notes(ctx),
            ..Default::default()
        };
        let key = crate::phase::PromptKey::Analysis;
        let prompt = crate::prompt::render(self.config.as_ref(), key, &vars)?;
        let resume_from = self.manual_resume(ctx, writer)?;

        let out = self
            .stage(ctx, writer, Phase::Analysis, key.as_str(), prompt, resume_from)
            .await?;
        check_contract(key, &out.text)?;
        self.store
            .apply_step_result(&ctx.session_id, Phase::Analysis, &out.text)
            .await?;
        Ok(())
    }

    async fn after_completion(&self, ctx: &RunContext) {
        if !ctx.step.is_chapter_producing() {
            return;
        }
        let snapshot = match self.store.get_session_snapshot(&ctx.session_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(session_id = %ctx.session_id, error = %err, "Failed to reload session after chapter");
                return;
            }
        };
        let chapter_number = match ctx.step {
            Phase::Chapter1 => 1,
            _ => snapshot.chapter_count(),
        };
        self.spawn_consistency(&ctx.session_id, chapter_number, &snapshot);

        if ctx.step == Phase::Continuation {
            self.maybe_chain(ctx, &snapshot);
        }
    }
}

fn user_notes(ctx: &RunContext) -> Option<String> {
    ctx.user_notes
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl RunExecutor for PipelineExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<(), PipelineError> {
        let snapshot = self.store.get_session_snapshot(&ctx.session_id).await?;
        let mut writer = StepWriter::begin(self.steps.as_ref(), &ctx.session_id, ctx.step).await?;
        tracing::info!(
            session_id = %ctx.session_id,
            run_id = %ctx.run_id,
            phase = %ctx.step,
            source = ?ctx.source,
            "Phase started"
        );

        match self.run_phase(&ctx, &snapshot, &mut writer).await {
            Ok(()) => {
                writer.complete().await?;
                tracing::info!(session_id = %ctx.session_id, run_id = %ctx.run_id, phase = %ctx.step, "Phase completed");
                self.after_completion(&ctx).await;
                Ok(())
            }
            Err(err) if ctx.cancel.is_cancelled() || err.is_cancellation() => {
                if let Err(store_err) = writer.interrupt().await {
                    tracing::warn!(session_id = %ctx.session_id, error = %store_err, "Failed to record interrupted step");
                }
                Err(err)
            }
            Err(err) => {
                if let Err(store_err) = writer.fail(&err).await {
                    tracing::warn!(session_id = %ctx.session_id, error = %store_err, "Failed to record step error");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Wiring shared by the pipeline tests.

    use super::*;
    use crate::config::StoryConfig;
    use crate::provider::testing::{Script, ScriptedProvider};
    use crate::scheduler::{ProgressReporter, RunSource};
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    pub use crate::scheduler::RunExecutor;

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub provider: Arc<ScriptedProvider>,
        pub executor: PipelineExecutor,
    }

    pub fn config() -> StoryConfig {
        let mut config = StoryConfig::default();
        config.provider.provider = "scripted".into();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config
    }

    pub fn harness(config: StoryConfig, snapshot: SessionSnapshot, scripts: Vec<Script>) -> Harness {
        harness_with(config, snapshot, ScriptedProvider::new(scripts), SchedulerHandle::detached())
    }

    pub fn harness_with(
        config: StoryConfig,
        snapshot: SessionSnapshot,
        provider: ScriptedProvider,
        scheduler: SchedulerHandle,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.insert_session(snapshot).unwrap();
        let provider = Arc::new(provider);
        let registry = ProviderRegistry::new().with_provider(provider.clone());
        let executor = PipelineExecutor::new(
            store.clone(),
            store.clone(),
            Arc::new(config),
            Arc::new(registry),
            scheduler,
        );
        Harness {
            store,
            provider,
            executor,
        }
    }

    pub fn ctx(session_id: &str, step: Phase) -> RunContext {
        RunContext {
            run_id: format!("run-{}", step),
            session_id: session_id.to_string(),
            step,
            source: RunSource::Manual,
            user_notes: None,
            continuation_policy: None,
            cancel: CancellationToken::new(),
            progress: ProgressReporter::detached(),
        }
    }

    pub const ANALYSIS: &str = "## Premise\nA ferry town.\n\n## Characters\n- Lin\n\n## Tone and Style\nSpare.";
    pub const SHAPE: &str = "## Overall Arc\nRise.\n\n## Act Structure\nThree acts.";
    pub const TENSION: &str = "## Tension Curve\nSlow.\n\n## Foreshadowing\nThe bell.";
    pub const BREAKDOWN_META: &str = "## Chapter Overview\nTen chapters.";
}
