#![deny(missing_docs)]
//! The LLM Adapter contract: the wire-neutral request/response types every
//! concrete provider converts to and from, and the [`Adapter`] trait
//! completions are run against.
//!
//! `Adapter` uses RPITIT (return-position `impl Trait` in traits) and is
//! intentionally **not** object-safe — the Orchestrator is generic over
//! `A: Adapter`, the same way the object-safe boundary in the corpus this
//! engine is built from sits one layer above its own provider trait.

use rce_core::ToolCall;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Errors from an Adapter's underlying LLM backend.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP or network request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The backend rate-limited the request.
    #[error("rate limited")]
    RateLimited,

    /// Authentication/authorization failed.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// The backend's response could not be parsed into a [`CompletionResponse`].
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A streaming completion was requested with tools attached.
    ///
    /// Streaming is only defined for tool-free completions: once the model
    /// may emit a tool call, the caller needs the whole structured response
    /// before it can act, which defeats incremental delivery.
    #[error("streaming is not supported for completions with tools attached")]
    StreamingRequiresNoTools,

    /// This adapter does not implement streaming at all.
    #[error("this adapter does not support streaming")]
    StreamingUnsupported,

    /// Catch-all for errors from lower layers.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl AdapterError {
    /// Whether retrying the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::RateLimited | AdapterError::RequestFailed(_))
    }
}

/// JSON Schema description of a tool, as sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: serde_json::Value,
}

/// A request to complete a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier (`None` = adapter default).
    pub model: Option<String>,
    /// Conversation so far.
    pub messages: Vec<rce_core::Message>,
    /// Tools the model may call.
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    /// Maximum output tokens.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// System prompt.
    pub system: Option<String>,
    /// If set, the backend is asked to constrain its output to this shape;
    /// the parsed result is attached to the response's `parsed` field.
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Backend-specific passthrough config.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// A request for JSON-schema-constrained structured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    /// Name identifying the shape (surfaced to the backend where it needs one,
    /// e.g. as the name of a forced tool call).
    pub name: String,
    /// JSON Schema the response must conform to.
    pub schema: serde_json::Value,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced a final response.
    EndTurn,
    /// The model wants to invoke one or more tools.
    ToolUse,
    /// Generation stopped because `max_tokens` was hit.
    MaxTokens,
    /// Content was filtered by the backend's safety system.
    ContentFilter,
}

/// Token usage from a single completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
}

/// A completed response from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The assistant's text, if any was produced alongside or instead of tool calls.
    pub text: Option<String>,
    /// Tool calls the model requested, in the order the model emitted them.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token usage for this call.
    pub usage: TokenUsage,
    /// The model that actually served the request.
    pub model: String,
    /// Estimated cost of this call, if the adapter can compute one.
    pub cost: Option<Decimal>,
    /// The parsed structured output, present when the request carried a
    /// `response_format` and the backend's output conformed to it.
    #[serde(default)]
    pub parsed: Option<serde_json::Value>,
}

/// LLM backend interface.
///
/// Each concrete backend (Anthropic, a mock for tests, others) implements
/// this trait. Backend-native features (prompt caching, extended thinking)
/// are handled inside the implementation via `CompletionRequest::extra`.
pub trait Adapter: Send + Sync {
    /// Send a completion request to the backend.
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, AdapterError>> + Send;

    /// Stream a completion, invoking `on_chunk` with each text fragment as it
    /// arrives. Only defined for tool-free requests; callers must check
    /// `request.tools.is_empty()` themselves or accept
    /// [`AdapterError::StreamingRequiresNoTools`].
    ///
    /// The default implementation reports that streaming isn't supported;
    /// adapters opt in by overriding it.
    fn stream_complete(
        &self,
        request: CompletionRequest,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> impl Future<Output = Result<CompletionResponse, AdapterError>> + Send {
        let _ = on_chunk;
        async move {
            if !request.tools.is_empty() {
                return Err(AdapterError::StreamingRequiresNoTools);
            }
            Err(AdapterError::StreamingUnsupported)
        }
    }
}

/// A scripted, in-memory [`Adapter`] for tests and examples.
///
/// Returns a fixed sequence of responses, one per call, cycling back to the
/// first once exhausted — enough to drive deterministic Agent Runner and
/// Orchestrator tests without a network dependency.
pub struct MockAdapter {
    responses: std::sync::Mutex<Vec<CompletionResponse>>,
    call_count: std::sync::atomic::AtomicUsize,
}

impl MockAdapter {
    /// Build a mock that returns `responses` in order, then repeats the last one.
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of times `complete` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Adapter for MockAdapter {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, AdapterError> {
        let index = self.call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(AdapterError::InvalidResponse("no scripted responses configured".into()));
        }
        Ok(responses[index.min(responses.len() - 1)].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: Some(text.to_string()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
            model: "mock-1".to_string(),
            cost: Some(Decimal::ZERO),
            parsed: None,
        }
    }

    #[tokio::test]
    async fn mock_adapter_returns_scripted_responses_in_order() {
        let adapter = MockAdapter::new(vec![text_response("first"), text_response("second")]);
        let request = CompletionRequest {
            model: None,
            messages: vec![],
            tools: vec![],
            max_tokens: None,
            temperature: None,
            system: None,
            response_format: None,
            extra: serde_json::Value::Null,
        };

        let first = adapter.complete(request.clone()).await.unwrap();
        let second = adapter.complete(request).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("first"));
        assert_eq!(second.text.as_deref(), Some("second"));
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_adapter_repeats_last_response_once_exhausted() {
        let adapter = MockAdapter::new(vec![text_response("only")]);
        let request = CompletionRequest {
            model: None,
            messages: vec![],
            tools: vec![],
            max_tokens: None,
            temperature: None,
            system: None,
            response_format: None,
            extra: serde_json::Value::Null,
        };

        adapter.complete(request.clone()).await.unwrap();
        let second = adapter.complete(request).await.unwrap();
        assert_eq!(second.text.as_deref(), Some("only"));
    }

    #[tokio::test]
    async fn default_stream_complete_rejects_requests_with_tools() {
        let adapter = MockAdapter::new(vec![text_response("x")]);
        let request = CompletionRequest {
            model: None,
            messages: vec![],
            tools: vec![ToolSchema {
                name: "t".into(),
                description: "d".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            max_tokens: None,
            temperature: None,
            system: None,
            response_format: None,
            extra: serde_json::Value::Null,
        };
        let mut sink = |_chunk: &str| {};
        let err = adapter.stream_complete(request, &mut sink).await.unwrap_err();
        assert!(matches!(err, AdapterError::StreamingRequiresNoTools));
    }

    #[test]
    fn adapter_error_retryable() {
        assert!(AdapterError::RateLimited.is_retryable());
        assert!(!AdapterError::AuthFailed("bad key".into()).is_retryable());
    }
}
