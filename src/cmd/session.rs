//! Session files: one session snapshot plus its workflow steps as JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use storyforge::store::{MemoryStore, SessionSnapshot, WorkflowStep};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFile {
    pub session: SessionSnapshot,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<WorkflowStep>,
}

impl SessionFile {
    /// Load a session file. A missing `session_id` falls back to the file stem.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        let mut file: SessionFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))?;
        if file.session.session_id.trim().is_empty() {
            file.session.session_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "session".to_string());
        }
        Ok(file)
    }

    /// Write through a temporary sibling so a crash never leaves half a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize session file")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write session file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace session file: {}", path.display()))?;
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn into_store(self) -> Result<MemoryStore> {
        let store = MemoryStore::new();
        let session_id = self.session.session_id.clone();
        store.insert_session(self.session)?;
        for step in self.steps {
            store.insert_step(&session_id, step)?;
        }
        Ok(store)
    }

    pub fn from_store(store: &MemoryStore, session_id: &str) -> Result<Self> {
        let session = store
            .export_session(session_id)?
            .with_context(|| format!("Session '{}' vanished from the store", session_id))?;
        let steps = store.export_steps(session_id)?;
        Ok(Self { session, steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge::Phase;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_keeps_steps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harbor.json");
        let mut file = SessionFile {
            session: SessionSnapshot::new("harbor", "Fog over the harbor."),
            steps: vec![WorkflowStep::new(Phase::Analysis)],
        };
        file.session.chapters.push("One.".into());
        file.save(&path).unwrap();

        let loaded = SessionFile::load(&path).unwrap();
        assert_eq!(loaded.session, file.session);
        assert_eq!(loaded.steps.len(), 1);
        assert!(!dir.path().join("harbor.json.tmp").exists());
    }

    #[test]
    fn test_missing_session_id_uses_file_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lighthouse.json");
        std::fs::write(&path, r#"{"session": {"source_text": "Beam."}}"#).unwrap();
        let file = SessionFile::load(&path).unwrap();
        assert_eq!(file.session_id(), "lighthouse");
        assert_eq!(file.session.source_text, "Beam.");
    }

    #[test]
    fn test_store_roundtrip() {
        let file = SessionFile {
            session: SessionSnapshot::new("s1", "text"),
            steps: vec![WorkflowStep::new(Phase::Outline)],
        };
        let store = file.clone().into_store().unwrap();
        let back = SessionFile::from_store(&store, "s1").unwrap();
        assert_eq!(back.session, file.session);
        assert_eq!(back.steps[0].phase, Phase::Outline);
    }
}
