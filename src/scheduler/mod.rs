//! Run scheduler
//!
//! Admits, queues, dispatches and cancels runs under a global concurrency
//! bound with strict per-session single flight.
//!
//! - All state lives behind one `std::sync::Mutex` that is never held across
//!   an await; every launch is decided inside it
//! - Each run is an independent tokio task driven by the registered
//!   [`RunExecutor`]
//! - Status transitions are broadcast as [`SchedulerEvent`]s and mirrored
//!   into the session store by a single ordered writer task

mod state;

pub use state::{ActiveRunInfo, CANCELLED_BY_USER, RunTask, SessionRunState};

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::errors::{PipelineError, StoreError};
use crate::phase::Phase;
use crate::store::{RunMeta, RunStatus, SessionStore};
use state::{Launch, SchedulerState, Settlement};

const EVENT_CAPACITY: usize = 256;

pub const INTERRUPTED_BEFORE_COMPLETION: &str = "Interrupted before completion";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunSource {
    #[default]
    Manual,
    Auto,
}

/// What a chapter-producing or resumable run does with existing content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationPolicy {
    #[default]
    NextChapter,
    /// Continue the step's truncated content instead of starting over
    ResumeTruncated,
}

/// Arguments of [`RunScheduler::enqueue_run`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub session_id: String,
    pub step: Phase,
    pub source: RunSource,
    pub user_notes: Option<String>,
    pub continuation_policy: Option<ContinuationPolicy>,
    pub allow_while_running: bool,
}

impl EnqueueRequest {
    pub fn new(session_id: impl Into<String>, step: Phase) -> Self {
        Self {
            session_id: session_id.into(),
            step,
            source: RunSource::Manual,
            user_notes: None,
            continuation_policy: None,
            allow_while_running: false,
        }
    }

    pub fn source(mut self, source: RunSource) -> Self {
        self.source = source;
        self
    }

    pub fn user_notes(mut self, notes: impl Into<String>) -> Self {
        self.user_notes = Some(notes.into());
        self
    }

    pub fn continuation_policy(mut self, policy: ContinuationPolicy) -> Self {
        self.continuation_policy = Some(policy);
        self
    }

    pub fn allow_while_running(mut self) -> Self {
        self.allow_while_running = true;
        self
    }
}

/// Progress reported by a running executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub phase: Phase,
    /// Sub-stage such as `outline.shape` or `breakdown 11-20`
    pub stage: Option<String>,
    pub message: String,
    pub chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    StatusChanged(SessionRunState),
    Progress {
        run_id: String,
        session_id: String,
        progress: RunProgress,
    },
}

/// Sends progress events for one run.
#[derive(Clone)]
pub struct ProgressReporter {
    run_id: String,
    session_id: String,
    events: broadcast::Sender<SchedulerEvent>,
}

impl ProgressReporter {
    pub fn report(&self, progress: RunProgress) {
        // no subscribers is fine
        let _ = self.events.send(SchedulerEvent::Progress {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            progress,
        });
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            run_id: "test-run".to_string(),
            session_id: "test-session".to_string(),
            events,
        }
    }
}

/// Everything an executor receives for one run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub session_id: String,
    pub step: Phase,
    pub source: RunSource,
    pub user_notes: Option<String>,
    pub continuation_policy: Option<ContinuationPolicy>,
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

/// The unit of work the scheduler runs.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, ctx: RunContext) -> Result<(), PipelineError>;
}

enum MetaWrite {
    Write(String, RunMeta),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
    meta_tx: Option<mpsc::UnboundedSender<MetaWrite>>,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Broadcast and persist a transition. Called with the state lock held so
    /// the writer sees transitions in order.
    fn publish(&self, state: &SessionRunState) {
        tracing::debug!(
            session_id = %state.session_id,
            status = %state.status,
            run_id = state.run_id.as_deref().unwrap_or(""),
            "Session status changed"
        );
        let _ = self.events.send(SchedulerEvent::StatusChanged(state.clone()));
        if let Some(tx) = &self.meta_tx {
            let _ = tx.send(MetaWrite::Write(state.session_id.clone(), state.to_meta()));
        }
    }
}

/// Weak handle for executors that enqueue follow-up runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Weak<Inner>,
}

impl SchedulerHandle {
    /// Enqueue through the scheduler; `None` when it is gone or rejects the run.
    pub fn enqueue_run(&self, request: EnqueueRequest) -> Option<String> {
        let inner = self.inner.upgrade()?;
        RunScheduler::enqueue_inner(&inner, request)
    }

    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }
}

#[derive(Clone)]
pub struct RunScheduler {
    inner: Arc<Inner>,
}

impl RunScheduler {
    /// Create a scheduler. With `meta_store` set, run metadata is persisted by
    /// a writer task, so this must be called inside a tokio runtime.
    pub fn new(max_concurrent_runs: usize, meta_store: Option<Arc<dyn SessionStore>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let meta_tx = meta_store.map(spawn_meta_writer);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::new(max_concurrent_runs)),
                events,
                meta_tx,
                idle: Notify::new(),
            }),
        }
    }

    pub fn register_executor(&self, executor: Arc<dyn RunExecutor>) {
        let mut state = self.inner.lock();
        state.executor = Some(executor);
        Self::dispatch_locked(&self.inner, &mut state);
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Admit a run. Returns the run id, or `None` with nothing changed when no
    /// executor is registered, the session is running and
    /// `allow_while_running` is unset, or the session already has a queued run.
    pub fn enqueue_run(&self, request: EnqueueRequest) -> Option<String> {
        Self::enqueue_inner(&self.inner, request)
    }

    fn enqueue_inner(inner: &Arc<Inner>, request: EnqueueRequest) -> Option<String> {
        let session_id = request.session_id.clone();
        let step = request.step;
        let mut state = inner.lock();
        let Some((task, changed)) = state.admit(request, uuid::Uuid::new_v4().to_string()) else {
            tracing::debug!(session_id = %session_id, phase = %step, "Run rejected");
            return None;
        };
        tracing::info!(
            session_id = %task.session_id,
            run_id = %task.run_id,
            phase = %task.step,
            source = ?task.source,
            "Run queued"
        );
        if let Some(changed) = changed {
            inner.publish(&changed);
        }
        Self::dispatch_locked(inner, &mut state);
        Some(task.run_id)
    }

    /// Cancel the session's running and queued work. The session ends up
    /// `interrupted` with [`CANCELLED_BY_USER`].
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let mut state = self.inner.lock();
        let (changed, cancelled) = state.cancel(session_id);
        tracing::info!(session_id, cancelled, "Session cancelled");
        self.inner.publish(&changed);
        Self::dispatch_locked(&self.inner, &mut state);
        if state.is_idle() {
            self.inner.idle.notify_waiters();
        }
        cancelled
    }

    pub fn set_max_concurrent_runs(&self, n: usize) {
        let mut state = self.inner.lock();
        state.max_concurrent_runs = n.max(1);
        tracing::info!(max_concurrent_runs = state.max_concurrent_runs, "Concurrency limit changed");
        Self::dispatch_locked(&self.inner, &mut state);
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.inner.lock().max_concurrent_runs
    }

    pub fn session_state(&self, session_id: &str) -> SessionRunState {
        self.inner.lock().session(session_id)
    }

    pub fn active_runs(&self) -> Vec<ActiveRunInfo> {
        self.inner.lock().active_runs()
    }

    pub fn queued_runs(&self) -> Vec<RunTask> {
        self.inner.lock().queued_runs()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Resolve once no run is active or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Resolve once every metadata write issued so far has been applied.
    pub async fn flush_meta(&self) {
        let Some(tx) = &self.inner.meta_tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(MetaWrite::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Rewrite persisted in-flight run metadata left by a previous process as
    /// `interrupted`, and mirror it into the session table.
    pub async fn recover_interrupted(&self, store: &dyn SessionStore) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for (session_id, meta) in store.list_run_meta().await? {
            if !meta.status.is_in_flight() {
                continue;
            }
            let state = SessionRunState {
                session_id: session_id.clone(),
                status: RunStatus::Interrupted,
                active_step: meta.recoverable_phase,
                last_error: Some(INTERRUPTED_BEFORE_COMPLETION.to_string()),
                run_id: meta.last_run_id.clone(),
            };
            if !self.inner.lock().restore(state.clone()) {
                continue;
            }
            store
                .set_run_meta(
                    &session_id,
                    RunMeta {
                        status: RunStatus::Interrupted,
                        last_error: state.last_error.clone(),
                        updated_at: Utc::now(),
                        ..meta
                    },
                )
                .await?;
            let _ = self.inner.events.send(SchedulerEvent::StatusChanged(state));
            tracing::warn!(session_id = %session_id, "Recovered run interrupted before completion");
            recovered += 1;
        }
        Ok(recovered)
    }

    fn dispatch_locked(inner: &Arc<Inner>, state: &mut SchedulerState) {
        let Some(executor) = state.executor.clone() else {
            return;
        };
        while let Some(launch) = state.start_next() {
            inner.publish(&launch.state);
            Self::spawn_run(inner, Arc::clone(&executor), launch);
        }
    }

    fn spawn_run(inner: &Arc<Inner>, executor: Arc<dyn RunExecutor>, launch: Launch) {
        let Launch { task, cancel, .. } = launch;
        let ctx = RunContext {
            run_id: task.run_id.clone(),
            session_id: task.session_id.clone(),
            step: task.step,
            source: task.source,
            user_notes: task.user_notes,
            continuation_policy: task.continuation_policy,
            cancel: cancel.clone(),
            progress: ProgressReporter {
                run_id: task.run_id.clone(),
                session_id: task.session_id.clone(),
                events: inner.events.clone(),
            },
        };
        let inner = Arc::clone(inner);
        tracing::info!(
            session_id = %task.session_id,
            run_id = %task.run_id,
            phase = %task.step,
            "Run started"
        );

        tokio::spawn(async move {
            let result = AssertUnwindSafe(executor.execute(ctx)).catch_unwind().await;
            let outcome = match result {
                Ok(Ok(())) => Settlement::Succeeded,
                Ok(Err(err)) if cancel.is_cancelled() || err.is_cancellation() => {
                    Settlement::Interrupted
                }
                Ok(Err(err)) => Settlement::Failed(err.to_string()),
                Err(_) => Settlement::Failed("Run panicked".to_string()),
            };
            match &outcome {
                Settlement::Failed(message) => tracing::error!(
                    session_id = %task.session_id,
                    run_id = %task.run_id,
                    phase = %task.step,
                    error = %message,
                    "Run failed"
                ),
                _ => tracing::info!(
                    session_id = %task.session_id,
                    run_id = %task.run_id,
                    phase = %task.step,
                    outcome = ?outcome,
                    "Run finished"
                ),
            }

            let mut state = inner.lock();
            if let Some(changed) = state.settle(&task.session_id, &task.run_id, outcome) {
                inner.publish(&changed);
            }
            Self::dispatch_locked(&inner, &mut state);
            if state.is_idle() {
                inner.idle.notify_waiters();
            }
        });
    }
}

fn spawn_meta_writer(store: Arc<dyn SessionStore>) -> mpsc::UnboundedSender<MetaWrite> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            match write {
                MetaWrite::Write(session_id, meta) => {
                    if let Err(err) = store.set_run_meta(&session_id, meta).await {
                        tracing::warn!(session_id = %session_id, error = %err, "Failed to persist run metadata");
                    }
                }
                MetaWrite::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    tx
}
