//! Breakdown phase: one meta stage, then chapter-range chunk stages.

use super::step::StepWriter;
use super::{PipelineExecutor, check_contract};
use crate::errors::PipelineError;
use crate::phase::{Phase, PromptKey};
use crate::prompt::{self, PromptVars};
use crate::scheduler::RunContext;
use crate::store::SessionSnapshot;

/// Inclusive chapter ranges of `per_chunk` chapters covering `1..=target`.
pub fn chunk_ranges(target: u32, per_chunk: u32) -> Vec<(u32, u32)> {
    let per_chunk = per_chunk.max(1);
    (1..=target)
        .step_by(per_chunk as usize)
        .map(|start| (start, (start + per_chunk - 1).min(target)))
        .collect()
}

impl PipelineExecutor {
    pub(super) async fn run_breakdown(
        &self,
        ctx: &RunContext,
        snapshot: &SessionSnapshot,
        writer: &mut StepWriter<'_>,
    ) -> Result<(), PipelineError> {
        let outline = snapshot.output(Phase::Outline).ok_or_else(|| {
            PipelineError::InvalidState("Outline output missing; run outline first".into())
        })?;
        let settings = self.config.breakdown();
        let target = snapshot
            .target_chapter_count
            .unwrap_or(settings.default_target_chapters)
            .max(1);

        let meta_vars = PromptVars {
            outline: outline.to_string(),
            analysis: snapshot.output(Phase::Analysis).unwrap_or_default().to_string(),
            target_chapters: target,
            ..Default::default()
        };
        let key = PromptKey::BreakdownMeta;
        let prompt = prompt::render(self.config.as_ref(), key, &meta_vars)?;
        let meta = self
            .stage(ctx, writer, Phase::Breakdown, key.as_str(), prompt, None)
            .await?;
        check_contract(key, &meta.text)?;
        let meta = meta.text.trim().to_string();

        let mut chunks: Vec<String> = Vec::new();
        let compose = |chunks: &[String]| {
            std::iter::once(meta.as_str())
                .chain(chunks.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        writer.set_content(meta.clone());

        for (start, end) in chunk_ranges(target, settings.chapters_per_chunk) {
            let label = format!("{} {}-{}", PromptKey::BreakdownChunk, start, end);
            let vars = PromptVars {
                outline: outline.to_string(),
                breakdown_meta: meta.clone(),
                breakdown: chunks.join("\n\n"),
                range_start: start,
                range_end: end,
                target_chapters: target,
                ..Default::default()
            };
            let prompt = prompt::render(self.config.as_ref(), PromptKey::BreakdownChunk, &vars)?;

            writer.commit("\n\n");
            match self
                .stage(ctx, writer, Phase::Breakdown, &label, prompt, None)
                .await
            {
                Ok(out) => {
                    chunks.push(out.text.trim().to_string());
                    writer.set_content(compose(&chunks));
                }
                Err(err) => {
                    writer.set_content(compose(&chunks));
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        stage = %label,
                        completed_chunks = chunks.len(),
                        error = %err,
                        "Breakdown chunk failed, keeping completed stages"
                    );
                    return Err(PipelineError::PartialProgress {
                        stage: label,
                        completed: format!("meta and {} chunk(s)", chunks.len()),
                        source: Box::new(err),
                    });
                }
            }
        }

        let content = compose(&chunks);
        writer.set_content(content.clone());
        self.store
            .apply_step_result(&ctx.session_id, Phase::Breakdown, &content)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::provider::testing::{Script, ScriptError, reply};
    use crate::store::{StepStatus, StepStore};

    fn outlined(target: u32) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::new("s1", "source");
        snapshot.outputs.insert(Phase::Analysis, ANALYSIS.into());
        snapshot
            .outputs
            .insert(Phase::Outline, format!("{}\n\n{}", SHAPE, TENSION));
        snapshot.target_chapter_count = Some(target);
        snapshot
    }

    #[test]
    fn test_chunk_ranges() {
        assert_eq!(chunk_ranges(25, 10), vec![(1, 10), (11, 20), (21, 25)]);
        assert_eq!(chunk_ranges(10, 10), vec![(1, 10)]);
        assert_eq!(chunk_ranges(3, 0), vec![(1, 1), (2, 2), (3, 3)]);
        assert!(chunk_ranges(0, 10).is_empty());
    }

    #[tokio::test]
    async fn test_meta_then_chunks() {
        let mut config = config();
        config.breakdown.chapters_per_chunk = 5;
        let h = harness(
            config,
            outlined(8),
            vec![reply(BREAKDOWN_META), reply("| 1 | Bell |"), reply("| 6 | Key |")],
        );
        h.executor.execute(ctx("s1", Phase::Breakdown)).await.unwrap();

        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert_eq!(
            snapshot.output(Phase::Breakdown),
            Some(format!("{}\n\n| 1 | Bell |\n\n| 6 | Key |", BREAKDOWN_META).as_str())
        );
        let prompts = h.provider.prompts();
        assert!(prompts[1].contains("chapters 1 to 5"));
        assert!(prompts[2].contains("chapters 6 to 8"));
        assert!(prompts[2].contains("| 1 | Bell |"));
    }

    #[tokio::test]
    async fn test_chunk_failure_keeps_meta_and_reports_partial_progress() {
        let mut config = config();
        config.breakdown.chapters_per_chunk = 5;
        config.retry.max_retries = 0;
        let h = harness(
            config,
            outlined(10),
            vec![
                reply(BREAKDOWN_META),
                reply("| 1 | Bell |"),
                Script::Fail(ScriptError::Http(500)),
            ],
        );
        let err = h.executor.execute(ctx("s1", Phase::Breakdown)).await.unwrap_err();
        match &err {
            PipelineError::PartialProgress { stage, completed, .. } => {
                assert_eq!(stage, "breakdown.chunk 6-10");
                assert_eq!(completed, "meta and 1 chunk(s)");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_cancellation());

        let step = h.store.get_step("s1", Phase::Breakdown).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Error);
        assert_eq!(step.content, format!("{}\n\n| 1 | Bell |", BREAKDOWN_META));
        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert!(snapshot.output(Phase::Breakdown).is_none());
    }

    #[tokio::test]
    async fn test_meta_contract_failure_stops_before_chunks() {
        let h = harness(config(), outlined(10), vec![reply("no overview")]);
        let err = h.executor.execute(ctx("s1", Phase::Breakdown)).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingSections { .. }));
        assert_eq!(h.provider.call_count(), 1);
    }
}
