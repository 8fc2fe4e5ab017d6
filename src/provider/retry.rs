//! Drives one provider stream to completion.
//!
//! [`generate`] wraps [`CompletionProvider::stream`] with an inactivity
//! timeout on every chunk, exponential backoff for retryable failures, a
//! one-shot `max_tokens` downgrade on context overflow and cancellation at
//! every await point.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{CompletionProvider, FinishReason, GenerationRequest, StreamChunk};
use crate::errors::ProviderError;

/// `max_tokens` used for a downgrade when the request had none set.
const DOWNGRADE_FALLBACK_MAX_TOKENS: u32 = 2048;

/// Retry and timeout settings for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Abort a stream after this long without a chunk.
    pub inactivity_timeout_secs: u64,
    /// Floor for the context-overflow downgrade.
    pub min_max_tokens: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            inactivity_timeout_secs: 90,
            min_max_tokens: 256,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs.max(1))
    }
}

/// Text notifications emitted while a call streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextEvent<'a> {
    Delta(&'a str),
    /// A retry is starting; text accumulated so far must be discarded.
    Restart,
}

/// Observer for retries, failures and completion of one call.
pub trait GenerationHooks: Send + Sync {
    fn on_retry(&self, _attempt: u32, _delay: Duration, _error: &ProviderError) {}
    fn on_error(&self, _error: &ProviderError) {}
    fn on_finish(&self, _reason: &FinishReason) {}
}

pub struct NoHooks;

impl GenerationHooks for NoHooks {}

/// Result of a completed call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub finish_reason: FinishReason,
    /// Number of stream attempts, including the successful one.
    pub attempts: u32,
    /// Set when a context overflow forced a smaller `max_tokens`.
    pub downgraded_max_tokens: Option<u32>,
}

/// Halve `current` down to `floor`. `None` when no smaller value is possible.
pub fn downgrade_max_tokens(current: Option<u32>, floor: u32) -> Option<u32> {
    match current {
        Some(current) => {
            let next = (current / 2).max(floor);
            (next < current).then_some(next)
        }
        None => Some(DOWNGRADE_FALLBACK_MAX_TOKENS.max(floor)),
    }
}

/// Stream `request` to completion.
///
/// Text increments are passed to `on_text` as they arrive. On a retry
/// `on_text` receives [`TextEvent::Restart`] before the new attempt's text.
pub async fn generate(
    provider: &dyn CompletionProvider,
    mut request: GenerationRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    hooks: &dyn GenerationHooks,
    on_text: &mut (dyn FnMut(TextEvent<'_>) + Send),
) -> Result<Generation, ProviderError> {
    let timeout = policy.inactivity_timeout();
    let mut retries = 0u32;
    let mut attempts = 0u32;
    let mut downgraded = None;

    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        attempts += 1;

        let err = match stream_once(provider, &request, timeout, cancel, on_text).await {
            Ok((text, finish_reason)) => {
                hooks.on_finish(&finish_reason);
                return Ok(Generation {
                    text,
                    finish_reason,
                    attempts,
                    downgraded_max_tokens: downgraded,
                });
            }
            Err(err) => err,
        };

        match err {
            ProviderError::Cancelled => return Err(ProviderError::Cancelled),
            ProviderError::ContextOverflow(_) if downgraded.is_none() => {
                let Some(next) =
                    downgrade_max_tokens(request.params.max_tokens, policy.min_max_tokens)
                else {
                    hooks.on_error(&err);
                    return Err(err);
                };
                tracing::warn!(
                    model = %request.model,
                    max_tokens = next,
                    "Context overflow, retrying with a smaller max_tokens"
                );
                hooks.on_retry(attempts, Duration::ZERO, &err);
                request.params.max_tokens = Some(next);
                downgraded = Some(next);
                on_text(TextEvent::Restart);
            }
            err if err.is_retryable() && retries < policy.max_retries => {
                let delay = match &err {
                    ProviderError::RateLimited {
                        retry_after: Some(after),
                        ..
                    } => (*after).min(Duration::from_millis(policy.max_backoff_ms)),
                    _ => policy.backoff(retries),
                };
                retries += 1;
                tracing::warn!(
                    model = %request.model,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Provider call failed, retrying"
                );
                hooks.on_retry(retries, delay, &err);
                on_text(TextEvent::Restart);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            err => {
                hooks.on_error(&err);
                return Err(err);
            }
        }
    }
}

async fn stream_once(
    provider: &dyn CompletionProvider,
    request: &GenerationRequest,
    timeout: Duration,
    cancel: &CancellationToken,
    on_text: &mut (dyn FnMut(TextEvent<'_>) + Send),
) -> Result<(String, FinishReason), ProviderError> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        opened = tokio::time::timeout(timeout, provider.stream(request, cancel.clone())) => {
            opened.map_err(|_| ProviderError::InactivityTimeout(timeout))??
        }
    };

    let mut text = String::new();
    let mut finish = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            next = tokio::time::timeout(timeout, stream.next()) => next,
        };
        match next {
            Err(_) => return Err(ProviderError::InactivityTimeout(timeout)),
            Ok(None) => break,
            Ok(Some(Err(err))) => return Err(err),
            Ok(Some(Ok(StreamChunk::Text(delta)))) => {
                if !delta.is_empty() {
                    text.push_str(&delta);
                    on_text(TextEvent::Delta(&delta));
                }
            }
            Ok(Some(Ok(StreamChunk::Finish(reason)))) => {
                // first finish wins
                if finish.is_none() {
                    finish = Some(reason);
                }
            }
        }
    }

    match finish.unwrap_or(FinishReason::Stop) {
        FinishReason::Cancelled => Err(ProviderError::Cancelled),
        reason => Ok((text, reason)),
    }
}
