//! Mutex-guarded in-memory store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    RunMeta, SessionSnapshot, SessionStore, StepStore, WorkflowPatch, WorkflowStep,
};
use crate::consistency::ConsistencyReport;
use crate::errors::StoreError;
use crate::phase::Phase;

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
    steps: Mutex<HashMap<(String, Phase), WorkflowStep>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, snapshot: SessionSnapshot) -> Result<(), StoreError> {
        self.sessions()?
            .insert(snapshot.session_id.clone(), snapshot);
        Ok(())
    }

    pub fn export_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.sessions()?.get(session_id).cloned())
    }

    /// All steps of a session in phase order.
    pub fn export_steps(&self, session_id: &str) -> Result<Vec<WorkflowStep>, StoreError> {
        let steps = self.steps()?;
        Ok(Phase::ALL
            .iter()
            .filter_map(|phase| steps.get(&(session_id.to_string(), *phase)).cloned())
            .collect())
    }

    pub fn insert_step(&self, session_id: &str, step: WorkflowStep) -> Result<(), StoreError> {
        self.steps()?
            .insert((session_id.to_string(), step.phase), step);
        Ok(())
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<String, SessionSnapshot>>, StoreError> {
        self.sessions.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn steps(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<(String, Phase), WorkflowStep>>, StoreError> {
        self.steps.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionSnapshot) -> T,
    ) -> Result<T, StoreError> {
        let mut sessions = self.sessions()?;
        let snapshot = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(f(snapshot))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, StoreError> {
        self.with_session(session_id, |s| s.clone())
    }

    async fn apply_step_result(
        &self,
        session_id: &str,
        phase: Phase,
        content: &str,
    ) -> Result<(), StoreError> {
        self.with_session(session_id, |s| match phase {
            Phase::Chapter1 => {
                if s.chapters.is_empty() {
                    s.chapters.push(content.to_string());
                } else {
                    s.chapters[0] = content.to_string();
                }
            }
            Phase::Continuation => s.chapters.push(content.to_string()),
            _ => {
                s.outputs.insert(phase, content.to_string());
            }
        })
    }

    async fn update_workflow(
        &self,
        session_id: &str,
        patch: WorkflowPatch,
    ) -> Result<(), StoreError> {
        self.with_session(session_id, |s| {
            if let Some(artifacts) = patch.compression {
                s.compression = Some(artifacts);
            }
            if let Some(meta) = patch.compression_meta {
                s.compression_meta = Some(meta);
            }
            if let Some((subtask, content)) = patch.outline_section {
                s.outline_sections.insert(subtask, content);
            }
            if let Some(ledger) = patch.foreshadow_ledger {
                s.foreshadow_ledger = ledger;
            }
            for note in patch.character_notes {
                if !s.character_cards.is_empty() && !s.character_cards.ends_with('\n') {
                    s.character_cards.push('\n');
                }
                s.character_cards.push_str(&note);
            }
            if let Some(chapter) = patch.replace_latest_chapter {
                match s.chapters.last_mut() {
                    Some(last) => *last = chapter,
                    None => s.chapters.push(chapter),
                }
            }
        })
    }

    async fn set_run_meta(&self, session_id: &str, meta: RunMeta) -> Result<(), StoreError> {
        self.with_session(session_id, |s| s.run_meta = Some(meta))
    }

    async fn append_consistency_report(
        &self,
        session_id: &str,
        report: ConsistencyReport,
    ) -> Result<(), StoreError> {
        self.with_session(session_id, |s| s.consistency_reports.push(report))
    }

    async fn list_run_meta(&self) -> Result<Vec<(String, RunMeta)>, StoreError> {
        let sessions = self.sessions()?;
        let mut metas: Vec<(String, RunMeta)> = sessions
            .iter()
            .filter_map(|(id, s)| s.run_meta.clone().map(|m| (id.clone(), m)))
            .collect();
        metas.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(metas)
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn get_step(
        &self,
        session_id: &str,
        phase: Phase,
    ) -> Result<Option<WorkflowStep>, StoreError> {
        Ok(self.steps()?.get(&(session_id.to_string(), phase)).cloned())
    }

    async fn put_step(&self, session_id: &str, step: WorkflowStep) -> Result<(), StoreError> {
        self.insert_step(session_id, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::OutlineSubtask;
    use crate::store::{RunStatus, StepStatus};
    use chrono::Utc;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_session(SessionSnapshot::new("s1", "source"))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_apply_step_result_chapter_semantics() {
        let store = store();
        store
            .apply_step_result("s1", Phase::Chapter1, "one")
            .await
            .unwrap();
        store
            .apply_step_result("s1", Phase::Continuation, "two")
            .await
            .unwrap();
        store
            .apply_step_result("s1", Phase::Chapter1, "one, revised")
            .await
            .unwrap();
        store
            .apply_step_result("s1", Phase::Analysis, "## Premise")
            .await
            .unwrap();

        let snapshot = store.get_session_snapshot("s1").await.unwrap();
        assert_eq!(snapshot.chapters, vec!["one, revised", "two"]);
        assert_eq!(snapshot.output(Phase::Analysis), Some("## Premise"));
    }

    #[tokio::test]
    async fn test_update_workflow_patch() {
        let store = store();
        store
            .apply_step_result("s1", Phase::Continuation, "draft")
            .await
            .unwrap();
        store
            .update_workflow(
                "s1",
                WorkflowPatch {
                    outline_section: Some((OutlineSubtask::Shape, "arc".into())),
                    character_notes: vec!["- Lin: limps".into()],
                    replace_latest_chapter: Some("final".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let snapshot = store.get_session_snapshot("s1").await.unwrap();
        assert_eq!(snapshot.outline_sections[&OutlineSubtask::Shape], "arc");
        assert_eq!(snapshot.character_cards, "- Lin: limps");
        assert_eq!(snapshot.chapters, vec!["final"]);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = MemoryStore::new();
        let err = store.get_session_snapshot("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_run_meta_listing() {
        let store = store();
        store
            .insert_session(SessionSnapshot::new("s2", "other"))
            .unwrap();
        store
            .set_run_meta(
                "s1",
                RunMeta {
                    status: RunStatus::Running,
                    recoverable_phase: Some(Phase::Outline),
                    last_error: None,
                    last_run_id: Some("r1".into()),
                    updated_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let metas = store.list_run_meta().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].0, "s1");
    }

    #[tokio::test]
    async fn test_steps_roundtrip_in_phase_order() {
        let store = store();
        let mut step = WorkflowStep::new(Phase::Outline);
        step.status = StepStatus::Completed;
        store.put_step("s1", step).await.unwrap();
        store
            .put_step("s1", WorkflowStep::new(Phase::Analysis))
            .await
            .unwrap();

        let steps = store.export_steps("s1").unwrap();
        let phases: Vec<Phase> = steps.iter().map(|s| s.phase).collect();
        assert_eq!(phases, vec![Phase::Analysis, Phase::Outline]);
        assert!(store.get_step("s1", Phase::Breakdown).await.unwrap().is_none());
    }
}
