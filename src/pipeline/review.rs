//! Background consistency check after each stored chapter.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::PipelineExecutor;
use crate::config::ConfigResolver;
use crate::consistency::{ConsistencyInput, ModelReviewer, check};
use crate::errors::ProviderError;
use crate::phase::PromptKey;
use crate::prompt::{self, PromptVars};
use crate::provider::{
    CompletionProvider, GenerationConfig, NoHooks, RetryPolicy, TextEvent, generate,
};
use crate::store::{SessionSnapshot, WorkflowPatch};

/// [`ModelReviewer`] backed by a completion provider.
pub struct ProviderReviewer {
    provider: Arc<dyn CompletionProvider>,
    generation: GenerationConfig,
    retry: RetryPolicy,
    config: Arc<dyn ConfigResolver>,
    cancel: CancellationToken,
}

#[async_trait]
impl ModelReviewer for ProviderReviewer {
    async fn review(&self, prompt: &str) -> Result<String, ProviderError> {
        let vars = PromptVars {
            review: prompt.to_string(),
            ..Default::default()
        };
        let prompt = match prompt::render(self.config.as_ref(), PromptKey::ConsistencyReview, &vars) {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::warn!(error = %err, "Review template failed, sending built-in prompt");
                prompt.to_string()
            }
        };
        let out = generate(
            self.provider.as_ref(),
            self.generation.request(prompt),
            &self.retry,
            &self.cancel,
            &NoHooks,
            &mut |_: TextEvent<'_>| {},
        )
        .await?;
        Ok(out.text)
    }
}

impl PipelineExecutor {
    fn reviewer(&self) -> Option<ProviderReviewer> {
        if !self.config.consistency().model_check {
            return None;
        }
        let generation = self.config.consistency_generation();
        match self.provider_for(&generation) {
            Ok(provider) => Some(ProviderReviewer {
                provider,
                generation,
                retry: self.config.retry(),
                config: self.config.clone(),
                cancel: CancellationToken::new(),
            }),
            Err(err) => {
                tracing::warn!(error = %err, "Model review disabled for this chapter");
                None
            }
        }
    }

    /// Check chapter `chapter_number` of `snapshot` without blocking the run.
    ///
    /// Checks for one session run in the order they were spawned, and each
    /// starts from the ledger and cards its predecessor stored. Failures are
    /// logged and never reach the run's outcome.
    pub(super) fn spawn_consistency(
        &self,
        session_id: &str,
        chapter_number: usize,
        snapshot: &SessionSnapshot,
    ) {
        let Some(latest) = chapter_number
            .checked_sub(1)
            .and_then(|i| snapshot.chapters.get(i))
        else {
            tracing::warn!(session_id, chapter_number, "No chapter text to check");
            return;
        };
        let mut input = ConsistencyInput {
            chapter_number,
            latest_chapter_text: latest.clone(),
            all_chapters: snapshot.chapters.clone(),
            character_cards: snapshot.effective_character_cards().to_string(),
            prior_ledger: snapshot.foreshadow_ledger.clone(),
        };
        let reviewer = self.reviewer();
        let heuristics = self.heuristics;
        let store = self.store.clone();
        let session_id = session_id.to_string();

        let (done, finished) = oneshot::channel::<()>();
        let previous = self
            .review_tail
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session_id.clone(), finished);

        self.side_tasks.spawn(async move {
            // dropped when this check ends, releasing the next one
            let _done = done;
            if let Some(previous) = previous {
                // an error only means the predecessor is gone
                let _ = previous.await;
            }
            match store.get_session_snapshot(&session_id).await {
                Ok(current) => {
                    input.character_cards = current.effective_character_cards().to_string();
                    input.prior_ledger = current.foreshadow_ledger;
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "Checking against the ledger seen at spawn time");
                }
            }

            let outcome = check(
                &input,
                &heuristics,
                reviewer.as_ref().map(|r| r as &dyn ModelReviewer),
            )
            .await;
            tracing::info!(
                session_id = %session_id,
                chapter = chapter_number,
                issues = outcome.report.issues.len(),
                "Consistency check finished"
            );

            if let Err(err) = store
                .append_consistency_report(&session_id, outcome.report)
                .await
            {
                tracing::warn!(session_id = %session_id, error = %err, "Failed to store consistency report");
                return;
            }
            let patch = WorkflowPatch {
                foreshadow_ledger: Some(outcome.ledger),
                character_notes: outcome
                    .character_updates
                    .iter()
                    .map(|u| format!("- {}: {}", u.name, u.note))
                    .collect(),
                ..Default::default()
            };
            if let Err(err) = store.update_workflow(&session_id, patch).await {
                tracing::warn!(session_id = %session_id, error = %err, "Failed to store foreshadow ledger");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::consistency::{IssueSource, Severity};
    use crate::phase::Phase;
    use crate::provider::testing::{Script, ScriptError, reply};
    use crate::store::SessionSnapshot;

    fn planned() -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::new("s1", "Lin rang the bell.");
        snapshot.outputs.insert(Phase::Outline, SHAPE.into());
        snapshot
            .outputs
            .insert(Phase::Breakdown, BREAKDOWN_META.into());
        snapshot.character_cards = "- Lin: bell ringer".into();
        snapshot
    }

    #[tokio::test]
    async fn test_model_review_updates_cards_and_ledger() {
        let mut config = config();
        config.consistency.model_check = true;
        let review = r#"{"summary": "Steady", "issues": [], "character_updates": [{"name": "Lin", "note": "now keeps the key"}], "foreshadow_updates": [{"title": "the brass key", "status": "open"}]}"#;
        let h = harness(
            config,
            planned(),
            vec![reply("Lin found a brass key under the bell."), reply(review)],
        );
        h.executor.execute(ctx("s1", Phase::Chapter1)).await.unwrap();
        h.executor.drain_side_tasks().await;

        assert_eq!(h.provider.call_count(), 2);
        assert!(h.provider.prompts()[1].contains("continuity editor"));
        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert!(snapshot.character_cards.ends_with("- Lin: now keeps the key"));
        assert!(snapshot.foreshadow_ledger.iter().any(|e| e.title == "the brass key"));
        assert!(snapshot.consistency_reports[0].summary.ends_with("Steady"));
    }

    #[tokio::test]
    async fn test_failed_review_is_a_low_issue() {
        let mut config = config();
        config.consistency.model_check = true;
        config.retry.max_retries = 0;
        let h = harness(
            config,
            planned(),
            vec![reply("Lin waited."), Script::Fail(ScriptError::Http(401))],
        );
        h.executor.execute(ctx("s1", Phase::Chapter1)).await.unwrap();
        h.executor.drain_side_tasks().await;

        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        let report = &snapshot.consistency_reports[0];
        let issue = report
            .issues
            .iter()
            .find(|i| i.source == IssueSource::Model)
            .unwrap();
        assert_eq!(issue.severity, Severity::Low);
        assert_eq!(snapshot.chapters, vec!["Lin waited."]);
    }

    #[tokio::test]
    async fn test_review_template_override_wraps_prompt() {
        let mut config = config();
        config.consistency.model_check = true;
        config
            .prompts
            .insert("consistency.review".into(), "Be strict.\n\n{{ review }}".into());
        let h = harness(
            config,
            planned(),
            vec![reply("Lin waited."), reply(r#"{"summary": "ok"}"#)],
        );
        h.executor.execute(ctx("s1", Phase::Chapter1)).await.unwrap();
        h.executor.drain_side_tasks().await;

        let prompt = &h.provider.prompts()[1];
        assert!(prompt.starts_with("Be strict."));
        assert!(prompt.contains("continuity editor"));
    }

    #[tokio::test]
    async fn test_rule_only_check_skips_provider() {
        let h = harness(config(), planned(), vec![reply("Lin waited.")]);
        h.executor.execute(ctx("s1", Phase::Chapter1)).await.unwrap();
        h.executor.drain_side_tasks().await;

        assert_eq!(h.provider.call_count(), 1);
        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert_eq!(snapshot.consistency_reports.len(), 1);
        assert!(
            snapshot.consistency_reports[0]
                .issues
                .iter()
                .all(|i| i.source == IssueSource::Rule)
        );
    }
}
