//! Typed error hierarchy for the storyforge orchestrator.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `ProviderError`: streaming completion provider failures
//! - `StoreError`: session/step store failures
//! - `PipelineError`: per-run phase execution failures

use std::time::Duration;

use thiserror::Error;

use crate::compression::TaskId;
use crate::phase::Phase;

/// Errors from a completion provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Provider rate limit hit: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Prompt exceeds the model context window: {0}")]
    ContextOverflow(String),

    #[error("No data received from provider for {0:?}")]
    InactivityTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed provider stream: {0}")]
    Protocol(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient failures worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500 || *status == 408,
            Self::RateLimited { .. } | Self::InactivityTimeout(_) | Self::Transport(_) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Errors from the session and workflow step stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single run of the phase pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{phase} needs the compressed context but none is available; run compression first")]
    CompressionRequired { phase: Phase },

    #[error("{reminder}")]
    MissingSections {
        prompt_key: String,
        missing: Vec<String>,
        reminder: String,
    },

    #[error("{stage} failed after {completed} completed: {source}")]
    PartialProgress {
        stage: String,
        completed: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Compression task {task} failed: {source}")]
    CompressionTask {
        task: TaskId,
        #[source]
        source: ProviderError,
    },

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Failed to render prompt '{key}': {message}")]
    Template { key: String, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// True for every cancellation-shaped failure, however deeply wrapped.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Provider(err) => err.is_cancelled(),
            Self::CompressionTask { source, .. } => source.is_cancelled(),
            Self::PartialProgress { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_retryable_classification() {
        assert!(
            ProviderError::Http {
                status: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::Http {
                status: 401,
                message: "bad key".into()
            }
            .is_retryable()
        );
        assert!(ProviderError::InactivityTimeout(Duration::from_secs(5)).is_retryable());
        assert!(
            ProviderError::RateLimited {
                retry_after: None,
                message: "slow down".into()
            }
            .is_retryable()
        );
        assert!(!ProviderError::ContextOverflow("too long".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn cancellation_is_detected_through_wrappers() {
        let wrapped = PipelineError::PartialProgress {
            stage: "breakdown chunk 11-20".into(),
            completed: "meta".into(),
            source: Box::new(PipelineError::Provider(ProviderError::Cancelled)),
        };
        assert!(wrapped.is_cancellation());

        let task = PipelineError::CompressionTask {
            task: TaskId::StyleGuide,
            source: ProviderError::Cancelled,
        };
        assert!(task.is_cancellation());

        let real = PipelineError::Provider(ProviderError::Transport("reset".into()));
        assert!(!real.is_cancellation());
    }

    #[test]
    fn compression_required_mentions_phase_and_remedy() {
        let err = PipelineError::CompressionRequired {
            phase: Phase::Analysis,
        };
        let msg = err.to_string();
        assert!(msg.contains("analysis"));
        assert!(msg.contains("run compression first"));
    }

    #[test]
    fn store_error_converts_into_pipeline_error() {
        let err: PipelineError = StoreError::SessionNotFound("s1".into()).into();
        match &err {
            PipelineError::Store(StoreError::SessionNotFound(id)) => assert_eq!(id, "s1"),
            _ => panic!("Expected PipelineError::Store(SessionNotFound)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ProviderError::Cancelled);
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&PipelineError::Cancelled);
    }
}
