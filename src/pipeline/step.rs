//! Workflow step bookkeeping for one run.

use std::time::Duration;

use chrono::Utc;

use crate::errors::{PipelineError, StoreError};
use crate::phase::Phase;
use crate::store::{StepStatus, StepStore, TruncationState, WorkflowStep};

/// Streaming content is flushed to the step store at most this often.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Owns the step of the running phase and writes it through to the store.
pub(crate) struct StepWriter<'a> {
    steps: &'a dyn StepStore,
    session_id: &'a str,
    step: WorkflowStep,
    /// The step as it was before this run started
    previous: WorkflowStep,
    /// Content of finished stages and rounds
    committed: String,
}

impl<'a> StepWriter<'a> {
    /// Mark the step `streaming`, clearing content, error and truncation.
    pub async fn begin(
        steps: &'a dyn StepStore,
        session_id: &'a str,
        phase: Phase,
    ) -> Result<StepWriter<'a>, StoreError> {
        let previous = steps
            .get_step(session_id, phase)
            .await?
            .unwrap_or_else(|| WorkflowStep::new(phase));
        let step = WorkflowStep {
            status: StepStatus::Streaming,
            content: String::new(),
            truncation: TruncationState::default(),
            error: None,
            updated_at: Utc::now(),
            ..previous.clone()
        };
        let writer = StepWriter {
            steps,
            session_id,
            step,
            previous,
            committed: String::new(),
        };
        writer.steps.put_step(session_id, writer.step.clone()).await?;
        Ok(writer)
    }

    pub fn previous(&self) -> &WorkflowStep {
        &self.previous
    }

    pub fn content(&self) -> &str {
        &self.step.content
    }

    pub fn truncation_mut(&mut self) -> &mut TruncationState {
        &mut self.step.truncation
    }

    /// Append finished text to the committed content.
    pub fn commit(&mut self, text: &str) {
        self.committed.push_str(text);
        self.step.content = self.committed.clone();
    }

    /// Replace all content, committed included.
    pub fn set_content(&mut self, content: String) {
        self.committed = content;
        self.step.content = self.committed.clone();
    }

    /// Write committed content followed by the in-flight `live` text.
    pub async fn flush_live(&mut self, live: &str) -> Result<(), StoreError> {
        self.step.content = format!("{}{}", self.committed, live);
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), StoreError> {
        self.step.updated_at = Utc::now();
        self.steps.put_step(self.session_id, self.step.clone()).await
    }

    pub async fn complete(mut self) -> Result<WorkflowStep, StoreError> {
        self.step.status = StepStatus::Completed;
        self.step.content = self.committed.clone();
        self.flush().await?;
        Ok(self.step)
    }

    /// Record a terminal failure; content written so far stays.
    pub async fn fail(mut self, err: &PipelineError) -> Result<(), StoreError> {
        self.step.status = StepStatus::Error;
        self.step.error = Some(err.to_string());
        self.step.content = self.committed.clone();
        self.flush().await
    }

    /// Return the step to `idle` after a cancellation, keeping partial content.
    pub async fn interrupt(mut self) -> Result<(), StoreError> {
        self.step.status = StepStatus::Idle;
        self.step.content = self.committed.clone();
        self.flush().await
    }
}
