//! Scheduler state machine.
//!
//! Pure bookkeeping for admission, dispatch, settlement and cancellation.
//! Every method runs under the scheduler's single lock and returns the
//! session state that changed so the caller can publish it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{ContinuationPolicy, EnqueueRequest, RunExecutor, RunSource};
use crate::phase::Phase;
use crate::store::{RunMeta, RunStatus};

pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// An admitted run waiting for a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    pub run_id: String,
    pub session_id: String,
    pub step: Phase,
    pub source: RunSource,
    pub user_notes: Option<String>,
    pub continuation_policy: Option<ContinuationPolicy>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct ActiveRun {
    pub run_id: String,
    pub step: Phase,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub cancelled_by_user: bool,
}

/// Read-only view of a running run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRunInfo {
    pub run_id: String,
    pub session_id: String,
    pub step: Phase,
    pub started_at: DateTime<Utc>,
}

/// Externally observable run state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRunState {
    pub session_id: String,
    pub status: RunStatus,
    pub active_step: Option<Phase>,
    pub last_error: Option<String>,
    pub run_id: Option<String>,
}

impl SessionRunState {
    pub fn idle(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: RunStatus::Idle,
            active_step: None,
            last_error: None,
            run_id: None,
        }
    }

    pub fn to_meta(&self) -> RunMeta {
        RunMeta {
            status: self.status,
            recoverable_phase: self.active_step,
            last_error: self.last_error.clone(),
            last_run_id: self.run_id.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settlement {
    Succeeded,
    Interrupted,
    Failed(String),
}

/// What the driver must do for a freshly started run.
pub(crate) struct Launch {
    pub task: RunTask,
    pub cancel: CancellationToken,
    pub state: SessionRunState,
}

pub(crate) struct SchedulerState {
    pub max_concurrent_runs: usize,
    pub executor: Option<Arc<dyn RunExecutor>>,
    queue: VecDeque<RunTask>,
    active: HashMap<String, ActiveRun>,
    sessions: HashMap<String, SessionRunState>,
}

impl SchedulerState {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            max_concurrent_runs: max_concurrent_runs.max(1),
            executor: None,
            queue: VecDeque::new(),
            active: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, session_id: &str) -> SessionRunState {
        self.sessions
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| SessionRunState::idle(session_id))
    }

    fn set_session(&mut self, state: SessionRunState) -> SessionRunState {
        self.sessions
            .insert(state.session_id.clone(), state.clone());
        state
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }

    pub fn active_runs(&self) -> Vec<ActiveRunInfo> {
        let mut runs: Vec<ActiveRunInfo> = self
            .active
            .iter()
            .map(|(session_id, run)| ActiveRunInfo {
                run_id: run.run_id.clone(),
                session_id: session_id.clone(),
                step: run.step,
                started_at: run.started_at,
            })
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    pub fn queued_runs(&self) -> Vec<RunTask> {
        self.queue.iter().cloned().collect()
    }

    /// Admit `request` as a queued task. `None` means rejected with no mutation.
    /// The returned state is `Some` when the visible status changed.
    pub fn admit(
        &mut self,
        request: EnqueueRequest,
        run_id: String,
    ) -> Option<(RunTask, Option<SessionRunState>)> {
        self.executor.as_ref()?;
        let running = self.is_active(&request.session_id);
        if running && !request.allow_while_running {
            return None;
        }
        if self.queue.iter().any(|t| t.session_id == request.session_id) {
            return None;
        }

        let task = RunTask {
            run_id,
            session_id: request.session_id,
            step: request.step,
            source: request.source,
            user_notes: request.user_notes,
            continuation_policy: request.continuation_policy,
            queued_at: Utc::now(),
        };
        self.queue.push_back(task.clone());

        // a chained task stays hidden behind the running one
        let changed = (!running).then(|| {
            self.set_session(SessionRunState {
                session_id: task.session_id.clone(),
                status: RunStatus::Queued,
                active_step: Some(task.step),
                last_error: None,
                run_id: Some(task.run_id.clone()),
            })
        });
        Some((task, changed))
    }

    /// Start the earliest queued task whose session has no active run, if a
    /// slot is free.
    pub fn start_next(&mut self) -> Option<Launch> {
        if self.active.len() >= self.max_concurrent_runs {
            return None;
        }
        let pos = self
            .queue
            .iter()
            .position(|t| !self.active.contains_key(&t.session_id))?;
        let task = self.queue.remove(pos)?;

        let cancel = CancellationToken::new();
        self.active.insert(
            task.session_id.clone(),
            ActiveRun {
                run_id: task.run_id.clone(),
                step: task.step,
                started_at: Utc::now(),
                cancel: cancel.clone(),
                cancelled_by_user: false,
            },
        );
        let state = self.set_session(SessionRunState {
            session_id: task.session_id.clone(),
            status: RunStatus::Running,
            active_step: Some(task.step),
            last_error: None,
            run_id: Some(task.run_id.clone()),
        });
        Some(Launch {
            task,
            cancel,
            state,
        })
    }

    /// Remove the finished run and record its terminal status. Returns `None`
    /// when `run_id` is not the session's active run.
    pub fn settle(
        &mut self,
        session_id: &str,
        run_id: &str,
        outcome: Settlement,
    ) -> Option<SessionRunState> {
        if self.active.get(session_id).map(|r| r.run_id.as_str()) != Some(run_id) {
            return None;
        }
        let run = self.active.remove(session_id)?;

        let outcome = if run.cancelled_by_user {
            Settlement::Interrupted
        } else {
            outcome
        };
        let state = match outcome {
            Settlement::Succeeded => SessionRunState {
                session_id: session_id.to_string(),
                status: RunStatus::Idle,
                active_step: None,
                last_error: None,
                run_id: Some(run.run_id),
            },
            Settlement::Interrupted => SessionRunState {
                session_id: session_id.to_string(),
                status: RunStatus::Interrupted,
                active_step: Some(run.step),
                last_error: Some(if run.cancelled_by_user {
                    CANCELLED_BY_USER.to_string()
                } else {
                    "Run was interrupted".to_string()
                }),
                run_id: Some(run.run_id),
            },
            Settlement::Failed(message) => SessionRunState {
                session_id: session_id.to_string(),
                status: RunStatus::Error,
                active_step: Some(run.step),
                last_error: Some(message),
                run_id: Some(run.run_id),
            },
        };
        Some(self.set_session(state))
    }

    /// Signal the active run and drop queued tasks for `session_id`.
    /// Returns the new state and whether anything was cancelled.
    pub fn cancel(&mut self, session_id: &str) -> (SessionRunState, bool) {
        let before = self.queue.len();
        let mut dropped_step = None;
        self.queue.retain(|t| {
            if t.session_id == session_id {
                dropped_step = Some(t.step);
                false
            } else {
                true
            }
        });
        let mut cancelled = self.queue.len() != before;

        let mut step = dropped_step;
        let mut run_id = self.sessions.get(session_id).and_then(|s| s.run_id.clone());
        if let Some(run) = self.active.get_mut(session_id) {
            run.cancelled_by_user = true;
            run.cancel.cancel();
            step = Some(run.step);
            run_id = Some(run.run_id.clone());
            cancelled = true;
        }

        let step = step.or_else(|| self.session(session_id).active_step);
        let state = self.set_session(SessionRunState {
            session_id: session_id.to_string(),
            status: RunStatus::Interrupted,
            active_step: step,
            last_error: Some(CANCELLED_BY_USER.to_string()),
            run_id,
        });
        (state, cancelled)
    }

    /// Mirror a recovered persisted state unless the session is live here.
    pub fn restore(&mut self, state: SessionRunState) -> bool {
        if self.is_active(&state.session_id)
            || self.queue.iter().any(|t| t.session_id == state.session_id)
        {
            return false;
        }
        self.set_session(state);
        true
    }
}
