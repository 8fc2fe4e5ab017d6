//! Session and workflow step persistence.
//!
//! The pipeline and scheduler only see the [`SessionStore`] and [`StepStore`]
//! traits; [`MemoryStore`] implements both for the binary and for tests.

mod memory;
mod model;

pub use memory::MemoryStore;
pub use model::{
    AutomationPolicy, RunMeta, RunStatus, SessionSnapshot, StepStatus, TruncationState,
    WorkflowPatch, WorkflowStep,
};

use async_trait::async_trait;

use crate::consistency::ConsistencyReport;
use crate::errors::StoreError;
use crate::phase::Phase;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session_snapshot(&self, session_id: &str) -> Result<SessionSnapshot, StoreError>;

    /// Store a phase's final output. `chapter1` sets chapter 1, `continuation`
    /// appends a chapter, other phases replace their phase output.
    async fn apply_step_result(
        &self,
        session_id: &str,
        phase: Phase,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn update_workflow(&self, session_id: &str, patch: WorkflowPatch)
    -> Result<(), StoreError>;

    async fn set_run_meta(&self, session_id: &str, meta: RunMeta) -> Result<(), StoreError>;

    async fn append_consistency_report(
        &self,
        session_id: &str,
        report: ConsistencyReport,
    ) -> Result<(), StoreError>;

    /// Run metadata of every session that has any.
    async fn list_run_meta(&self) -> Result<Vec<(String, RunMeta)>, StoreError>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn get_step(&self, session_id: &str, phase: Phase)
    -> Result<Option<WorkflowStep>, StoreError>;

    async fn put_step(&self, session_id: &str, step: WorkflowStep) -> Result<(), StoreError>;
}
