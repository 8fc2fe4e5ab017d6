//! Compression phase on top of the compression sub-pipeline.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::PipelineExecutor;
use super::stage::RunHooks;
use super::step::StepWriter;
use crate::compression::{CompressionOutcome, ExtractionRunner, TaskId, compress};
use crate::errors::PipelineError;
use crate::phase::{Phase, PromptKey};
use crate::prompt::{self, PromptVars};
use crate::provider::{TextEvent, generate};
use crate::scheduler::{RunContext, RunProgress};
use crate::store::{SessionSnapshot, WorkflowPatch};

/// Runs extraction tasks as single provider calls. Never auto-resumed.
struct ProviderExtractor<'a> {
    executor: &'a PipelineExecutor,
    ctx: &'a RunContext,
}

#[async_trait]
impl<'a> ExtractionRunner for ProviderExtractor<'a> {
    async fn extract(
        &self,
        task: TaskId,
        segments: &str,
        cancel: CancellationToken,
    ) -> Result<String, PipelineError> {
        let config = self.executor.config.as_ref();
        let vars = PromptVars::for_compression(task, segments);
        let prompt = prompt::render(config, PromptKey::Compression(task), &vars)?;
        let generation = config.generation(Phase::Compression);
        let provider = self.executor.provider_for(&generation)?;
        let hooks = RunHooks {
            ctx: self.ctx,
            stage: task.as_str(),
        };

        let out = generate(
            provider.as_ref(),
            generation.request(prompt),
            &config.retry(),
            &cancel,
            &hooks,
            &mut |_: TextEvent<'_>| {},
        )
        .await?;
        if out.finish_reason.is_length() {
            tracing::warn!(session_id = %self.ctx.session_id, task = %task, "Extraction output truncated");
        }
        self.ctx.progress.report(RunProgress {
            phase: Phase::Compression,
            stage: Some(task.as_str().to_string()),
            message: "Extraction finished".to_string(),
            chars: out.text.chars().count(),
        });
        Ok(out.text)
    }
}

impl PipelineExecutor {
    pub(super) async fn run_compression(
        &self,
        ctx: &RunContext,
        snapshot: &SessionSnapshot,
        writer: &mut StepWriter<'_>,
    ) -> Result<(), PipelineError> {
        let settings = self.config.compression();
        // surface broken template overrides before any provider call
        for task in settings.tasks() {
            prompt::render(
                self.config.as_ref(),
                PromptKey::Compression(task),
                &PromptVars::for_compression(task, ""),
            )?;
        }

        let runner = ProviderExtractor {
            executor: self,
            ctx,
        };
        match compress(&snapshot.source_text, &settings, &runner, &ctx.cancel).await {
            Ok(CompressionOutcome::Skipped(meta)) => {
                let reason = meta.skip_reason.clone().unwrap_or_default();
                writer.set_content(format!("Compression skipped: {}", reason));
                self.store
                    .update_workflow(
                        &ctx.session_id,
                        WorkflowPatch {
                            compression_meta: Some(meta),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Ok(CompressionOutcome::Completed { artifacts, meta }) => {
                tracing::info!(
                    session_id = %ctx.session_id,
                    source_chars = meta.source_chars,
                    compressed_chars = meta.compressed_chars,
                    ratio = meta.ratio,
                    "Compression completed"
                );
                let context = artifacts.compressed_context.clone();
                writer.set_content(context.clone());
                self.store
                    .update_workflow(
                        &ctx.session_id,
                        WorkflowPatch {
                            compression: Some(artifacts),
                            compression_meta: Some(meta),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .apply_step_result(&ctx.session_id, Phase::Compression, &context)
                    .await?;
                Ok(())
            }
            Err(failure) => {
                let patch = WorkflowPatch {
                    compression_meta: Some(failure.meta),
                    ..Default::default()
                };
                if let Err(err) = self.store.update_workflow(&ctx.session_id, patch).await {
                    tracing::warn!(session_id = %ctx.session_id, error = %err, "Failed to persist compression meta");
                }
                Err(failure.error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::compression::{CompressionMode, TaskStatus};
    use crate::provider::testing::{Script, ScriptError, reply};
    use crate::store::{StepStatus, StepStore};

    fn compressing_config() -> crate::config::StoryConfig {
        let mut config = config();
        config.compression.mode = CompressionMode::On;
        config.compression.chunk_size = 50;
        config.compression.overlap = 5;
        config.compression.parallelism = 1;
        config
    }

    fn long_source() -> SessionSnapshot {
        SessionSnapshot::new("s1", "Lin rang the bell at dawn. ".repeat(20))
    }

    #[tokio::test]
    async fn test_completed_compression_is_stored_and_used_downstream() {
        // parallelism 1 keeps task order deterministic
        let h = harness(
            compressing_config(),
            long_source(),
            vec![
                reply("[ROLE_CARDS]\n- Lin: ringer\n[/ROLE_CARDS]"),
                reply("[STYLE_GUIDE]\nShort lines.\n[/STYLE_GUIDE]"),
                reply("no markers here"),
                reply("[EVIDENCE_PACK]\n\"the bell\"\n[/EVIDENCE_PACK]"),
                reply(ANALYSIS),
            ],
        );
        h.executor.execute(ctx("s1", Phase::Compression)).await.unwrap();

        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        let artifacts = snapshot.compression.clone().unwrap();
        assert_eq!(artifacts.role_cards, "- Lin: ringer");
        assert_eq!(artifacts.plot_ledger, "no markers here");
        let meta = snapshot.compression_meta.clone().unwrap();
        assert_eq!(meta.task_status[&TaskId::PlotLedger], TaskStatus::Fallback);
        assert!(meta.ratio > 0.0);
        let step = h.store.get_step("s1", Phase::Compression).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.content.contains("## Role Cards"));

        h.executor.execute(ctx("s1", Phase::Analysis)).await.unwrap();
        let prompt = h.provider.prompts().pop().unwrap();
        assert!(prompt.contains("(compressed)"));
        assert!(prompt.contains("- Lin: ringer"));
    }

    #[tokio::test]
    async fn test_skipped_compression_records_reason() {
        let mut config = config();
        config.compression.mode = CompressionMode::Auto;
        let h = harness(config, SessionSnapshot::new("s1", "short"), vec![]);
        h.executor.execute(ctx("s1", Phase::Compression)).await.unwrap();

        assert_eq!(h.provider.call_count(), 0);
        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        let meta = snapshot.compression_meta.unwrap();
        assert!(meta.skipped);
        assert!(meta.skip_reason.is_some());
        assert!(snapshot.compression.is_none());
    }

    #[tokio::test]
    async fn test_failed_task_persists_meta_and_fails_run() {
        let mut config = compressing_config();
        config.retry.max_retries = 0;
        let h = harness(
            config,
            long_source(),
            vec![
                Script::Fail(ScriptError::Http(401)),
                Script::Fail(ScriptError::Http(401)),
            ],
        );
        let err = h.executor.execute(ctx("s1", Phase::Compression)).await.unwrap_err();
        assert!(matches!(err, PipelineError::CompressionTask { task: TaskId::RoleCards, .. }));

        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        let meta = snapshot.compression_meta.unwrap();
        assert_eq!(meta.task_status[&TaskId::RoleCards], TaskStatus::Failed);
        assert!(snapshot.compression.is_none());
        let step = h.store.get_step("s1", Phase::Compression).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Error);
    }

    #[tokio::test]
    async fn test_extractor_reports_render_failure_as_template_error() {
        let mut config = compressing_config();
        config
            .prompts
            .insert("compression.style_guide".into(), "{% if %}".into());
        let h = harness(config, long_source(), vec![]);
        let ctx = ctx("s1", Phase::Compression);
        let runner = ProviderExtractor {
            executor: &h.executor,
            ctx: &ctx,
        };

        let err = runner
            .extract(TaskId::StyleGuide, "[Segment 1/1]\ntext", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, PipelineError::Template { ref key, .. } if key == "compression.style_guide")
        );
        assert_eq!(h.provider.call_count(), 0);
    }
}
