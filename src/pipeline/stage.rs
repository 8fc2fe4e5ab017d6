//! One generation stage: streaming, periodic flushes and truncation auto-resume.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::step::{FLUSH_INTERVAL, StepWriter};
use crate::errors::{PipelineError, ProviderError};
use crate::phase::Phase;
use crate::prompt::resume_prompt;
use crate::provider::{
    CompletionProvider, FinishReason, GenerationConfig, GenerationHooks, RetryPolicy, TextEvent,
    generate,
};
use crate::scheduler::{RunContext, RunProgress};

/// Logs retries and failures of provider calls made for a run.
pub(crate) struct RunHooks<'a> {
    pub ctx: &'a RunContext,
    pub stage: &'a str,
}

impl GenerationHooks for RunHooks<'_> {
    fn on_retry(&self, attempt: u32, delay: Duration, error: &ProviderError) {
        tracing::warn!(
            session_id = %self.ctx.session_id,
            run_id = %self.ctx.run_id,
            stage = self.stage,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying provider call"
        );
    }

    fn on_error(&self, error: &ProviderError) {
        tracing::warn!(
            session_id = %self.ctx.session_id,
            run_id = %self.ctx.run_id,
            stage = self.stage,
            error = %error,
            "Provider call failed"
        );
    }

    fn on_finish(&self, reason: &FinishReason) {
        tracing::debug!(
            session_id = %self.ctx.session_id,
            run_id = %self.ctx.run_id,
            stage = self.stage,
            finish_reason = %reason,
            "Provider call finished"
        );
    }
}

/// A stage to run.
pub(crate) struct Stage<'a> {
    pub phase: Phase,
    /// Name recorded in progress events and truncation state
    pub label: &'a str,
    pub prompt: String,
    /// Rounds of auto-resume allowed after a length cutoff
    pub max_resume_rounds: u32,
    /// Content to continue instead of starting fresh
    pub resume_from: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct StageOutput {
    pub text: String,
    pub finish_reason: FinishReason,
    pub truncated: bool,
}

/// Run `stage` until it finishes or its auto-resume rounds run out.
///
/// Every round's text is committed to `writer`. On failure the partial text of
/// the failing round is committed too, so the step keeps it.
pub(crate) async fn run_stage(
    ctx: &RunContext,
    provider: &dyn CompletionProvider,
    generation: &GenerationConfig,
    retry: &RetryPolicy,
    writer: &mut StepWriter<'_>,
    stage: Stage<'_>,
) -> Result<StageOutput, PipelineError> {
    let mut text = String::new();
    let mut prompt = stage.prompt.clone();
    if let Some(existing) = stage.resume_from.as_deref() {
        tracing::info!(
            session_id = %ctx.session_id,
            stage = stage.label,
            chars = existing.chars().count(),
            "Resuming truncated content"
        );
        writer.commit(existing);
        text.push_str(existing);
        prompt = resume_prompt(&stage.prompt, existing);
    }

    let mut rounds = 0u32;
    loop {
        let round = stream_round(ctx, provider, generation, retry, writer, stage.label, &prompt)
            .await?;
        text.push_str(&round.text);

        let truncation = writer.truncation_mut();
        truncation.last_finish_reason = Some(round.finish_reason.clone());
        truncation.auto_resume_rounds_used = rounds;

        if round.finish_reason.is_length() && rounds < stage.max_resume_rounds {
            rounds += 1;
            writer.truncation_mut().auto_resume_rounds_used = rounds;
            tracing::info!(
                session_id = %ctx.session_id,
                run_id = %ctx.run_id,
                stage = stage.label,
                round = rounds,
                max_rounds = stage.max_resume_rounds,
                "Output truncated, auto-resuming"
            );
            prompt = resume_prompt(&stage.prompt, &text);
            continue;
        }

        // sticky across the stages of one step
        let truncated = round.finish_reason.is_length();
        if truncated {
            let truncation = writer.truncation_mut();
            truncation.is_truncated = true;
            truncation.last_truncated_subtask = Some(stage.label.to_string());
            tracing::warn!(
                session_id = %ctx.session_id,
                stage = stage.label,
                rounds_used = rounds,
                "Output still truncated, manual resume available"
            );
        }
        writer.flush().await?;
        ctx.progress.report(RunProgress {
            phase: stage.phase,
            stage: Some(stage.label.to_string()),
            message: "Stage finished".to_string(),
            chars: text.chars().count(),
        });
        return Ok(StageOutput {
            text,
            finish_reason: round.finish_reason,
            truncated,
        });
    }
}

struct Round {
    text: String,
    finish_reason: FinishReason,
}

/// Stream one provider call, flushing the step at most every
/// [`FLUSH_INTERVAL`] while text arrives.
async fn stream_round(
    ctx: &RunContext,
    provider: &dyn CompletionProvider,
    generation: &GenerationConfig,
    retry: &RetryPolicy,
    writer: &mut StepWriter<'_>,
    label: &str,
    prompt: &str,
) -> Result<Round, PipelineError> {
    let live = Mutex::new(String::new());
    let hooks = RunHooks { ctx, stage: label };
    let mut on_text = |event: TextEvent<'_>| {
        let mut buffer = live.lock().unwrap_or_else(|p| p.into_inner());
        match event {
            TextEvent::Delta(delta) => buffer.push_str(delta),
            TextEvent::Restart => buffer.clear(),
        }
    };

    let call = generate(
        provider,
        generation.request(prompt),
        retry,
        &ctx.cancel,
        &hooks,
        &mut on_text,
    );
    tokio::pin!(call);

    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flushed_len = 0usize;

    let result = loop {
        tokio::select! {
            result = &mut call => break result,
            _ = ticker.tick() => {
                let snapshot = live.lock().unwrap_or_else(|p| p.into_inner()).clone();
                if snapshot.len() != flushed_len {
                    flushed_len = snapshot.len();
                    writer.flush_live(&snapshot).await?;
                    ctx.progress.report(RunProgress {
                        phase: ctx.step,
                        stage: Some(label.to_string()),
                        message: "Streaming".to_string(),
                        chars: snapshot.chars().count(),
                    });
                }
            }
        }
    };

    match result {
        Ok(generation) => {
            writer.commit(&generation.text);
            Ok(Round {
                text: generation.text,
                finish_reason: generation.finish_reason,
            })
        }
        Err(err) => {
            let partial = std::mem::take(&mut *live.lock().unwrap_or_else(|p| p.into_inner()));
            writer.commit(&partial);
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{Script, ScriptedProvider, reply, reply_with};
    use crate::provider::{Credentials, GenerationParams};
    use crate::scheduler::{ProgressReporter, RunSource};
    use crate::store::{MemoryStore, StepStore};
    use tokio_util::sync::CancellationToken;

    fn ctx(cancel: CancellationToken) -> RunContext {
        RunContext {
            run_id: "r1".into(),
            session_id: "s1".into(),
            step: Phase::Chapter1,
            source: RunSource::Manual,
            user_notes: None,
            continuation_policy: None,
            cancel,
            progress: ProgressReporter::detached(),
        }
    }

    fn generation() -> GenerationConfig {
        GenerationConfig {
            provider: "scripted".into(),
            model: "m".into(),
            credentials: Credentials::default(),
            system_prompt: None,
            params: GenerationParams::default(),
        }
    }

    fn stage(max_resume_rounds: u32) -> Stage<'static> {
        Stage {
            phase: Phase::Chapter1,
            label: "chapter1",
            prompt: "Write chapter one.".into(),
            max_resume_rounds,
            resume_from: None,
        }
    }

    #[tokio::test]
    async fn test_auto_resume_stops_at_cap_and_stays_truncated() {
        let store = MemoryStore::new();
        let provider = ScriptedProvider::new(vec![
            reply_with("one ", FinishReason::Length),
            reply_with("two ", FinishReason::Length),
            reply_with("three ", FinishReason::Length),
            reply("never"),
        ]);
        let mut writer = StepWriter::begin(&store, "s1", Phase::Chapter1).await.unwrap();
        let out = run_stage(
            &ctx(CancellationToken::new()),
            &provider,
            &generation(),
            &RetryPolicy::default(),
            &mut writer,
            stage(2),
        )
        .await
        .unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(out.text, "one two three ");
        assert!(out.truncated);
        let step = store.get_step("s1", Phase::Chapter1).await.unwrap().unwrap();
        assert!(step.truncation.is_truncated);
        assert_eq!(step.truncation.auto_resume_rounds_used, 2);
        assert_eq!(step.truncation.last_truncated_subtask.as_deref(), Some("chapter1"));
        assert_eq!(step.content, "one two three ");

        let prompts = provider.prompts();
        assert!(prompts[1].contains(crate::prompt::RESUME_DIRECTIVE));
        assert!(prompts[2].contains("one two "));
    }

    #[tokio::test]
    async fn test_resume_ends_on_stop() {
        let store = MemoryStore::new();
        let provider = ScriptedProvider::new(vec![
            reply_with("first half, ", FinishReason::Length),
            reply("second half."),
        ]);
        let mut writer = StepWriter::begin(&store, "s1", Phase::Chapter1).await.unwrap();
        let out = run_stage(
            &ctx(CancellationToken::new()),
            &provider,
            &generation(),
            &RetryPolicy::default(),
            &mut writer,
            stage(2),
        )
        .await
        .unwrap();
        assert_eq!(out.text, "first half, second half.");
        assert!(!out.truncated);
        assert_eq!(writer.truncation_mut().auto_resume_rounds_used, 1);
    }

    #[tokio::test]
    async fn test_ineligible_stage_does_not_resume() {
        let store = MemoryStore::new();
        let provider = ScriptedProvider::new(vec![reply_with("cut", FinishReason::Length)]);
        let mut writer = StepWriter::begin(&store, "s1", Phase::Chapter1).await.unwrap();
        let out = run_stage(
            &ctx(CancellationToken::new()),
            &provider,
            &generation(),
            &RetryPolicy::default(),
            &mut writer,
            stage(0),
        )
        .await
        .unwrap();
        assert_eq!(provider.call_count(), 1);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_manual_resume_seeds_existing_content() {
        let store = MemoryStore::new();
        let provider = ScriptedProvider::new(vec![reply(" and the end.")]);
        let mut writer = StepWriter::begin(&store, "s1", Phase::Chapter1).await.unwrap();
        let out = run_stage(
            &ctx(CancellationToken::new()),
            &provider,
            &generation(),
            &RetryPolicy::default(),
            &mut writer,
            Stage {
                resume_from: Some("The middle".into()),
                ..stage(2)
            },
        )
        .await
        .unwrap();
        assert_eq!(out.text, "The middle and the end.");
        assert!(provider.prompts()[0].contains("The middle"));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_partial_text() {
        let store = MemoryStore::new();
        let provider = ScriptedProvider::new(vec![Script::Stall("partial".into())]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut writer = StepWriter::begin(&store, "s1", Phase::Chapter1).await.unwrap();
        let err = run_stage(
            &ctx(cancel),
            &provider,
            &generation(),
            &RetryPolicy::default(),
            &mut writer,
            stage(2),
        )
        .await
        .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(writer.content(), "partial");
    }
}
