//! Outline phase: `shape` and `tension` subtasks with merge-on-write.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::step::StepWriter;
use super::{PipelineExecutor, check_contract, select_source, user_notes};
use crate::errors::PipelineError;
use crate::phase::{OutlineSubtask, Phase};
use crate::prompt::{self, PromptVars};
use crate::scheduler::RunContext;
use crate::store::{SessionSnapshot, WorkflowPatch};

static OUTLINE_DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*outline\s*:\s*(shape|tension)\s*\]").expect("outline directive regex is valid")
});

/// Find an `[outline:shape]` / `[outline:tension]` directive in `notes`.
///
/// Returns the selected subtask and the notes with every directive removed
/// (`None` when nothing else is left).
pub fn parse_outline_directive(notes: Option<&str>) -> (Option<OutlineSubtask>, Option<String>) {
    let Some(notes) = notes else {
        return (None, None);
    };
    let selected = OUTLINE_DIRECTIVE_RE.captures(notes).map(|caps| {
        if caps[1].eq_ignore_ascii_case("shape") {
            OutlineSubtask::Shape
        } else {
            OutlineSubtask::Tension
        }
    });
    let rest = OUTLINE_DIRECTIVE_RE.replace_all(notes, "");
    let rest = rest.trim();
    (selected, (!rest.is_empty()).then(|| rest.to_string()))
}

/// Stored subtask sections joined in subtask order.
pub fn merge_outline(sections: &BTreeMap<OutlineSubtask, String>) -> String {
    OutlineSubtask::ALL
        .iter()
        .filter_map(|s| sections.get(s))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl PipelineExecutor {
    pub(super) async fn run_outline(
        &self,
        ctx: &RunContext,
        snapshot: &SessionSnapshot,
        writer: &mut StepWriter<'_>,
    ) -> Result<(), PipelineError> {
        let analysis = snapshot.output(Phase::Analysis).ok_or_else(|| {
            PipelineError::InvalidState("Analysis output missing; run analysis first".into())
        })?;
        let (only, notes) = parse_outline_directive(user_notes(ctx).as_deref());
        let subtasks = match only {
            Some(subtask) => vec![subtask],
            None => OutlineSubtask::ALL.to_vec(),
        };
        let target_chapters = snapshot
            .target_chapter_count
            .unwrap_or(self.config.breakdown().default_target_chapters);

        let mut sections = snapshot.outline_sections.clone();
        for subtask in subtasks {
            let key = subtask.prompt_key();
            let mut vars = PromptVars {
                analysis: analysis.to_string(),
                user_notes: notes.clone(),
                target_chapters,
                outline_shape: sections
                    .get(&OutlineSubtask::Shape)
                    .cloned()
                    .unwrap_or_default(),
                ..Default::default()
            };
            if subtask == OutlineSubtask::Shape {
                let source = select_source(Phase::Outline, snapshot, &self.config.compression())?;
                vars.source = source.text().to_string();
                vars.source_kind = source.kind().to_string();
            }
            let prompt = prompt::render(self.config.as_ref(), key, &vars)?;

            writer.set_content(String::new());
            let out = self
                .stage(ctx, writer, Phase::Outline, key.as_str(), prompt, None)
                .await?;
            check_contract(key, &out.text)?;

            let text = out.text.trim();
            if text.is_empty() {
                tracing::warn!(session_id = %ctx.session_id, subtask = %subtask, "Empty outline output, keeping stored section");
                continue;
            }
            sections.insert(subtask, text.to_string());
            self.store
                .update_workflow(
                    &ctx.session_id,
                    WorkflowPatch {
                        outline_section: Some((subtask, text.to_string())),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let merged = merge_outline(&sections);
        writer.set_content(merged.clone());
        self.store
            .apply_step_result(&ctx.session_id, Phase::Outline, &merged)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::provider::testing::reply;
    use crate::store::{StepStatus, StepStore};

    fn analysed() -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::new("s1", "source");
        snapshot.outputs.insert(Phase::Analysis, ANALYSIS.into());
        snapshot
    }

    #[test]
    fn test_directive_parsing() {
        assert_eq!(parse_outline_directive(None), (None, None));
        assert_eq!(
            parse_outline_directive(Some("[Outline: Tension] more dread")),
            (Some(OutlineSubtask::Tension), Some("more dread".into()))
        );
        assert_eq!(
            parse_outline_directive(Some("[ outline:shape ]")),
            (Some(OutlineSubtask::Shape), None)
        );
        assert_eq!(
            parse_outline_directive(Some("just notes")),
            (None, Some("just notes".into()))
        );
    }

    #[tokio::test]
    async fn test_both_subtasks_run_in_order() {
        let h = harness(config(), analysed(), vec![reply(SHAPE), reply(TENSION)]);
        h.executor.execute(ctx("s1", Phase::Outline)).await.unwrap();

        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert_eq!(snapshot.outline_sections[&OutlineSubtask::Shape], SHAPE);
        assert_eq!(snapshot.outline_sections[&OutlineSubtask::Tension], TENSION);
        assert_eq!(
            snapshot.output(Phase::Outline),
            Some(format!("{}\n\n{}", SHAPE, TENSION).as_str())
        );
        let prompts = h.provider.prompts();
        assert!(prompts[0].contains("- ## Overall Arc"));
        assert!(prompts[1].contains("- ## Tension Curve"));
        assert!(prompts[1].contains("Three acts."));
    }

    #[tokio::test]
    async fn test_directive_preserves_other_subtask() {
        let mut snapshot = analysed();
        snapshot
            .outline_sections
            .insert(OutlineSubtask::Shape, SHAPE.into());
        let new_tension = "## Tension Curve\nSharper.\n\n## Foreshadowing\nThe key.";
        let h = harness(config(), snapshot, vec![reply(new_tension)]);
        let mut ctx = ctx("s1", Phase::Outline);
        ctx.user_notes = Some("[outline:tension] raise stakes".into());
        h.executor.execute(ctx).await.unwrap();

        assert_eq!(h.provider.call_count(), 1);
        assert!(h.provider.prompts()[0].contains("raise stakes"));
        assert!(!h.provider.prompts()[0].contains("[outline:tension]"));
        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert_eq!(snapshot.outline_sections[&OutlineSubtask::Shape], SHAPE);
        assert_eq!(snapshot.outline_sections[&OutlineSubtask::Tension], new_tension);
    }

    #[tokio::test]
    async fn test_empty_output_never_overwrites_stored_section() {
        let mut snapshot = analysed();
        snapshot
            .outline_sections
            .insert(OutlineSubtask::Shape, SHAPE.into());
        let h = harness(config(), snapshot, vec![reply("")]);
        let mut ctx = ctx("s1", Phase::Outline);
        ctx.user_notes = Some("[outline:shape]".into());
        let err = h.executor.execute(ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingSections { .. }));

        let snapshot = h.store.export_session("s1").unwrap().unwrap();
        assert_eq!(snapshot.outline_sections[&OutlineSubtask::Shape], SHAPE);
        let step = h.store.get_step("s1", Phase::Outline).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Error);
    }

    #[tokio::test]
    async fn test_outline_requires_analysis() {
        let h = harness(config(), SessionSnapshot::new("s1", "source"), vec![]);
        let err = h.executor.execute(ctx("s1", Phase::Outline)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));
    }
}
