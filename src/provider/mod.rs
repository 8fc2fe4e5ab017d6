//! Streaming completion providers.
//!
//! A provider turns a [`GenerationRequest`] into a stream of [`StreamChunk`]s:
//! text increments followed by one finish reason. [`generate`] drives a stream
//! to completion with inactivity timeouts, retries and cancellation.

mod openai;
mod retry;

pub use openai::{OpenAiCompatProvider, classify_http_error, parse_sse_payload};
pub use retry::{
    Generation, GenerationHooks, NoHooks, RetryPolicy, TextEvent, downgrade_max_tokens, generate,
};

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;

/// Why a provider call stopped producing text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Output-length cutoff; the text is truncated.
    Length,
    ContentFilter,
    Cancelled,
    Other(String),
}

impl FinishReason {
    /// Map a provider's wire value onto a finish reason.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" | "eos" => Self::Stop,
            "length" | "max_tokens" | "max_output_tokens" => Self::Length,
            "content_filter" | "safety" => Self::ContentFilter,
            "cancelled" | "canceled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_length(&self) -> bool {
        matches!(self, Self::Length)
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// One increment of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    Finish(FinishReason),
}

/// Credentials for one provider call.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    /// Overrides the provider's default endpoint
    pub base_url: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Resolved generation configuration for one phase.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: String,
    pub credentials: Credentials,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
}

impl GenerationConfig {
    /// Build a request for `prompt` with this configuration.
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            model: self.model.clone(),
            credentials: self.credentials.clone(),
            system_prompt: self.system_prompt.clone(),
            params: self.params.clone(),
        }
    }
}

/// A single provider call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub credentials: Credentials,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// A streaming completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Open a stream for `request`. Implementations must stop producing
    /// chunks once `cancel` fires.
    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError>;
}

/// Provider lookup by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CompletionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn CompletionProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider used by tests across the crate.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted provider response.
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Stream the pieces then finish with the reason.
        Reply(Vec<String>, FinishReason),
        /// Fail to open the stream.
        Fail(ScriptError),
        /// Stream the pieces then fail mid-stream.
        FailAfter(Vec<String>, ScriptError),
        /// Stream the first piece then stall forever.
        Stall(String),
        /// Wait, then reply.
        Delayed(Duration, Vec<String>, FinishReason),
    }

    #[derive(Debug, Clone)]
    pub enum ScriptError {
        Transport,
        Http(u16),
        Overflow,
    }

    impl ScriptError {
        fn to_error(&self) -> ProviderError {
            match self {
                ScriptError::Transport => ProviderError::Transport("connection reset".into()),
                ScriptError::Http(status) => ProviderError::Http {
                    status: *status,
                    message: "scripted".into(),
                },
                ScriptError::Overflow => ProviderError::ContextOverflow("too long".into()),
            }
        }
    }

    pub fn reply(text: &str) -> Script {
        Script::Reply(vec![text.to_string()], FinishReason::Stop)
    }

    pub fn reply_with(text: &str, reason: FinishReason) -> Script {
        Script::Reply(vec![text.to_string()], reason)
    }

    /// Provider that pops one script per call and records every request.
    pub struct ScriptedProvider {
        id: String,
        scripts: Mutex<VecDeque<Script>>,
        /// Prompts containing the needle pop from the routed queue instead.
        routes: Vec<(String, Mutex<VecDeque<Script>>)>,
        fallback: Option<Script>,
        pub requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                id: "scripted".to_string(),
                scripts: Mutex::new(scripts.into()),
                routes: Vec::new(),
                fallback: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Answer prompts containing `needle` from `scripts`.
        pub fn with_route(mut self, needle: &str, scripts: Vec<Script>) -> Self {
            self.routes
                .push((needle.to_string(), Mutex::new(scripts.into())));
            self
        }

        /// Use `script` once the queue is drained.
        pub fn with_fallback(mut self, script: Script) -> Self {
            self.fallback = Some(script);
            self
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn prompts(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.prompt.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn stream(
            &self,
            request: &GenerationRequest,
            cancel: CancellationToken,
        ) -> Result<ChunkStream, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            let queue = self
                .routes
                .iter()
                .find(|(needle, _)| request.prompt.contains(needle.as_str()))
                .map(|(_, queue)| queue)
                .unwrap_or(&self.scripts);
            let script = queue
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.fallback.clone())
                .unwrap_or_else(|| reply(""));

            let stream = async_stream::stream! {
                match script {
                    Script::Reply(pieces, reason) => {
                        for piece in pieces {
                            tokio::task::yield_now().await;
                            yield Ok(StreamChunk::Text(piece));
                        }
                        yield Ok(StreamChunk::Finish(reason));
                    }
                    Script::Fail(err) => {
                        yield Err(err.to_error());
                    }
                    Script::FailAfter(pieces, err) => {
                        for piece in pieces {
                            yield Ok(StreamChunk::Text(piece));
                        }
                        yield Err(err.to_error());
                    }
                    Script::Stall(first) => {
                        yield Ok(StreamChunk::Text(first));
                        cancel.cancelled().await;
                        yield Ok(StreamChunk::Finish(FinishReason::Cancelled));
                    }
                    Script::Delayed(delay, pieces, reason) => {
                        let cancelled = tokio::select! {
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            yield Ok(StreamChunk::Finish(FinishReason::Cancelled));
                        } else {
                            for piece in pieces {
                                yield Ok(StreamChunk::Text(piece));
                            }
                            yield Ok(StreamChunk::Finish(reason));
                        }
                    }
                }
            };
            Ok(Box::pin(stream))
        }
    }
}
