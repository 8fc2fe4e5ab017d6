//! OpenAI-compatible chat completions over server-sent events.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{ChunkStream, CompletionProvider, FinishReason, GenerationRequest, StreamChunk};
use crate::errors::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Longest provider error body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, request: &GenerationRequest) -> String {
        let base = request
            .credentials
            .base_url
            .as_deref()
            .unwrap_or(&self.base_url)
            .trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    fn body(request: &GenerationRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = request.params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.params.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = request.params.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderError> {
        let url = self.endpoint(request);
        let mut builder = self.client.post(&url).json(&Self::body(request));
        if let Some(key) = request.credentials.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(provider = %self.id, model = %request.model, %url, "Opening completion stream");
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            resp = builder.send() => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), retry_after, &text));
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = bytes.next() => Some(next),
                };
                let Some(next) = next else {
                    yield StreamChunk::Finish(FinishReason::Cancelled);
                    break;
                };
                let Some(chunk) = next else {
                    for item in drain_frames(&mut buffer, true)? {
                        yield item;
                    }
                    break;
                };
                let chunk = chunk.map_err(ProviderError::from)?;
                buffer.extend(chunk.iter().filter(|b| **b != b'\r'));
                for item in drain_frames(&mut buffer, false)? {
                    yield item;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Decode every complete frame in `buffer`. At end of stream the remainder
/// counts as a final frame even without its blank line.
fn drain_frames(buffer: &mut Vec<u8>, at_end: bool) -> Result<Vec<StreamChunk>, ProviderError> {
    let mut out = Vec::new();
    loop {
        let frame: Vec<u8> = match find_frame_end(buffer) {
            Some(pos) => buffer.drain(..pos + 2).collect(),
            None if at_end && !buffer.is_empty() => std::mem::take(buffer),
            None => return Ok(out),
        };
        let frame = String::from_utf8_lossy(&frame);
        for line in frame.lines() {
            let Some(payload) = line.strip_prefix("data:") else { continue };
            out.extend(parse_sse_payload(payload.trim())?);
        }
    }
}

/// Decode one SSE `data:` payload into stream chunks.
pub fn parse_sse_payload(payload: &str) -> Result<Vec<StreamChunk>, ProviderError> {
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ProviderError::Protocol(format!("invalid JSON frame: {}", e)))?;

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error")
            .to_string();
        return Err(if is_context_overflow(&message) {
            ProviderError::ContextOverflow(message)
        } else {
            ProviderError::Protocol(message)
        });
    }

    let mut out = Vec::new();
    let choices = value
        .get("choices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for choice in choices {
        if let Some(text) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            out.push(StreamChunk::Text(text.to_string()));
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            out.push(StreamChunk::Finish(FinishReason::parse(reason)));
        }
    }
    Ok(out)
}

/// Map a non-success HTTP response onto a provider error.
pub fn classify_http_error(status: u16, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let message = extract_error_message(body);
    match status {
        429 => ProviderError::RateLimited {
            retry_after,
            message,
        },
        400 | 413 if is_context_overflow(&message) => ProviderError::ContextOverflow(message),
        _ => ProviderError::Http { status, message },
    }
}

fn extract_error_message(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    message.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

fn is_context_overflow(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "context_length_exceeded",
        "context length",
        "maximum context",
        "context window",
        "too many tokens",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Credentials, GenerationParams};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "Tell a story".to_string(),
            model: "gpt-4o-mini".to_string(),
            credentials: Credentials::default(),
            system_prompt: Some("You are a novelist.".to_string()),
            params: GenerationParams {
                temperature: Some(0.8),
                top_p: None,
                max_tokens: Some(1200),
            },
        }
    }

    #[test]
    fn test_body_includes_only_set_params() {
        let body = OpenAiCompatProvider::body(&request());
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["max_tokens"], json!(1200));
        assert!(body.get("top_p").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Tell a story");
    }

    #[test]
    fn test_endpoint_prefers_request_base_url() {
        let provider = OpenAiCompatProvider::new("openai", None);
        let mut req = request();
        assert_eq!(
            provider.endpoint(&req),
            "https://api.openai.com/v1/chat/completions"
        );
        req.credentials.base_url = Some("http://localhost:8080/v1/".to_string());
        assert_eq!(
            provider.endpoint(&req),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_sse_payload_text_and_finish() {
        let chunks = parse_sse_payload(
            r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunks, vec![StreamChunk::Text("Hello".to_string())]);

        let chunks =
            parse_sse_payload(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#).unwrap();
        assert_eq!(chunks, vec![StreamChunk::Finish(FinishReason::Length)]);

        assert!(parse_sse_payload("[DONE]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_sse_payload_errors() {
        let err = parse_sse_payload(r#"{"error":{"message":"maximum context length is 8192"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::ContextOverflow(_)));

        let err = parse_sse_payload("not json").unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
    }

    #[test]
    fn test_classify_http_error() {
        let err = classify_http_error(429, Some(Duration::from_secs(7)), "slow down");
        assert!(matches!(
            err,
            ProviderError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(7)
        ));

        let err = classify_http_error(
            400,
            None,
            r#"{"error":{"message":"This model's maximum context length is 4096 tokens"}}"#,
        );
        assert!(matches!(err, ProviderError::ContextOverflow(_)));

        let err = classify_http_error(400, None, "bad request");
        assert!(matches!(err, ProviderError::Http { status: 400, .. }));
    }

    #[test]
    fn test_frame_end_detection() {
        assert_eq!(find_frame_end(b"data: x\n\ndata: y"), Some(7));
        assert_eq!(find_frame_end(b"data: x\n"), None);
    }

    #[test]
    fn test_drain_frames_keeps_partial_frame_until_end() {
        let mut buffer = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Fog\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}",
        )
        .as_bytes()
        .to_vec();

        let chunks = drain_frames(&mut buffer, false).unwrap();
        assert_eq!(chunks, vec![StreamChunk::Text("Fog".to_string())]);
        assert!(!buffer.is_empty());

        let chunks = drain_frames(&mut buffer, true).unwrap();
        assert_eq!(chunks, vec![StreamChunk::Finish(FinishReason::Stop)]);
        assert!(buffer.is_empty());
        assert!(drain_frames(&mut buffer, true).unwrap().is_empty());
    }
}
