//! Chapter phases and continuation auto-chaining.

use super::step::StepWriter;
use super::{PipelineExecutor, select_source, user_notes};
use crate::errors::PipelineError;
use crate::phase::{Phase, PromptKey};
use crate::prompt::{self, PromptVars};
use crate::scheduler::{ContinuationPolicy, EnqueueRequest, RunContext, RunSource};
use crate::store::{AutomationPolicy, SessionSnapshot, WorkflowPatch};

/// Whether a finished continuation should enqueue the next chapter.
///
/// `default_target` applies when the session sets no target chapter count.
pub fn should_chain(snapshot: &SessionSnapshot, default_target: u32) -> bool {
    if snapshot.paused {
        return false;
    }
    let written = snapshot.chapter_count() as u32;
    let target = snapshot.target_chapter_count.unwrap_or(default_target);
    if written >= target {
        return false;
    }
    let next = written + 1;
    match snapshot.automation {
        AutomationPolicy::Manual => false,
        AutomationPolicy::FullAuto => true,
        AutomationPolicy::Range { from, to } => (from..=to).contains(&next),
    }
}

impl PipelineExecutor {
    pub(super) async fn run_chapter(
        &self,
        ctx: &RunContext,
        snapshot: &SessionSnapshot,
        writer: &mut StepWriter<'_>,
    ) -> Result<(), PipelineError> {
        let phase = ctx.step;
        let breakdown = snapshot.output(Phase::Breakdown).ok_or_else(|| {
            PipelineError::InvalidState("Breakdown output missing; run breakdown first".into())
        })?;
        let resume_from = self.manual_resume(ctx, writer)?;
        let resuming = resume_from.is_some();

        let mut vars = PromptVars {
            breakdown: breakdown.to_string(),
            outline: snapshot.output(Phase::Outline).unwrap_or_default().to_string(),
            character_cards: snapshot.effective_character_cards().to_string(),
            user_notes: user_notes(ctx),
            ..Default::default()
        };
        let key = match phase {
            Phase::Chapter1 => {
                let source = select_source(phase, snapshot, &self.config.compression())?;
                vars.source = source.text().to_string();
                vars.source_kind = source.kind().to_string();
                vars.chapter_number = 1;
                PromptKey::Chapter1
            }
            _ => {
                let count = snapshot.chapter_count();
                if count == 0 {
                    return Err(PipelineError::InvalidState(
                        "No chapters yet; run chapter1 first".into(),
                    ));
                }
                // a resumed continuation rewrites the latest chapter
                let (chapter_number, previous) = if resuming {
                    (count, count.checked_sub(2).map(|i| &snapshot.chapters[i]))
                } else {
                    (count + 1, snapshot.chapters.last())
                };
                vars.chapter_number = chapter_number;
                vars.previous_chapter = previous.cloned().unwrap_or_default();
                PromptKey::Continuation
            }
        };
        let prompt = prompt::render(self.config.as_ref(), key, &vars)?;

        let out = self
            .stage(ctx, writer, phase, key.as_str(), prompt, resume_from)
            .await?;
        if out.text.trim().is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "Model returned an empty chapter for {}",
                phase
            )));
        }

        if phase == Phase::Continuation && resuming {
            self.store
                .update_workflow(
                    &ctx.session_id,
                    WorkflowPatch {
                        replace_latest_chapter: Some(out.text),
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            self.store
                .apply_step_result(&ctx.session_id, phase, &out.text)
                .await?;
        }
        tracing::info!(
            session_id = %ctx.session_id,
            chapter = vars.chapter_number,
            resumed = resuming,
            truncated = out.truncated,
            "Chapter stored"
        );
        Ok(())
    }

    pub(super) fn maybe_chain(&self, ctx: &RunContext, snapshot: &SessionSnapshot) {
        let default_target = self.config.breakdown().default_target_chapters;
        if !should_chain(snapshot, default_target) {
            tracing::debug!(session_id = %ctx.session_id, chapters = snapshot.chapter_count(), "Not chaining next chapter");
            return;
        }
        let request = EnqueueRequest::new(ctx.session_id.clone(), Phase::Continuation)
            .source(RunSource::Auto)
            .continuation_policy(ContinuationPolicy::NextChapter)
            .allow_while_running();
        match self.scheduler.enqueue_run(request) {
            Some(run_id) => tracing::info!(
                session_id = %ctx.session_id,
                run_id = %run_id,
                next_chapter = snapshot.chapter_count() + 1,
                "Chained next chapter"
            ),
            None => tracing::warn!(session_id = %ctx.session_id, "Scheduler rejected chained chapter"),
        }
    }
}
