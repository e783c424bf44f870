#![deny(missing_docs)]
//! The Trajectory Recorder: an append-only audit trail of every completion
//! in a recursion tree.
//!
//! One [`TrajectoryEvent`] is recorded per Orchestrator iteration, whether it
//! belongs to the root completion or a `sub_complete`/`batch_complete`
//! descendant. [`TrajectorySink`] is the append-only write boundary;
//! [`InMemorySink`] and [`FileSink`] are the two implementations this engine
//! ships: an in-process ring for tests and short-lived runs, and a
//! newline-delimited JSON file for durable, append-only persistence.

use async_trait::async_trait;
use rce_core::{CallId, ToolCall, ToolResult, TrajectoryId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Errors from writing to a trajectory sink.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// The underlying sink failed to persist the event.
    #[error("failed to write trajectory event: {0}")]
    WriteFailed(String),

    /// The event could not be serialized.
    #[error("failed to serialize trajectory event: {0}")]
    Serialization(String),
}

/// Which sub-completion tool produced this event, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubCallType {
    /// Produced by a single `sub_complete` invocation.
    SubComplete,
    /// Produced by one member of a `batch_complete` fan-out.
    BatchComplete,
}

/// One recorded step of a completion: the prompt that went in, everything
/// that came out, and enough bookkeeping to reconstruct the recursion tree
/// after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    /// The root completion this event belongs to.
    pub trajectory_id: TrajectoryId,
    /// This event's own call id.
    pub call_id: CallId,
    /// The call id of the completion that spawned this one, if any.
    pub parent_call_id: Option<CallId>,
    /// Recursion depth at which this event occurred.
    pub depth: u32,
    /// The prompt (or messages snapshot, rendered to text) sent to the Adapter.
    pub prompt: String,
    /// The assistant's text response, if any.
    pub response_text: Option<String>,
    /// Tool calls the model requested this step.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Results returned for this step's tool calls.
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    /// Raw interpreter outputs produced this step, if the interpreter ran.
    #[serde(default)]
    pub interpreter_results: Vec<serde_json::Value>,
    /// Input tokens consumed by this step's Adapter call.
    pub input_tokens: u64,
    /// Output tokens produced by this step's Adapter call.
    pub output_tokens: u64,
    /// Wall-clock duration of this step, in milliseconds.
    pub duration_ms: u64,
    /// When this step occurred.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// An error string if this step failed.
    pub error: Option<String>,
    /// Estimated cost of this step.
    pub estimated_cost: Decimal,
    /// Which sub-completion tool produced this event, if not the root loop.
    pub sub_call_type: Option<SubCallType>,
}

/// An append-only destination for trajectory events.
///
/// Implementations must never reorder or drop an event that `record`
/// returned `Ok` for; the whole point of the recorder is a trustworthy
/// after-the-fact account of what a completion tree actually did.
#[async_trait]
pub trait TrajectorySink: Send + Sync {
    /// Append one event.
    async fn record(&self, event: TrajectoryEvent) -> Result<(), TrajectoryError>;
}

/// An in-process, `Vec`-backed sink. The default — durable only for the
/// lifetime of the process, but zero-setup and trivial to inspect in tests.
#[derive(Default)]
pub struct InMemorySink {
    events: Mutex<Vec<TrajectoryEvent>>,
}

impl InMemorySink {
    /// Build an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot all events recorded so far, in recording order.
    pub async fn events(&self) -> Vec<TrajectoryEvent> {
        self.events.lock().await.clone()
    }

    /// Number of events recorded so far.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether no events have been recorded.
    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl TrajectorySink for InMemorySink {
    async fn record(&self, event: TrajectoryEvent) -> Result<(), TrajectoryError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// A sink that appends one newline-delimited JSON object per event to a file.
///
/// Writes are serialized behind an internal lock so concurrent recursion
/// branches never interleave partial lines.
pub struct FileSink {
    file: Mutex<tokio::fs::File>,
}

impl FileSink {
    /// Open (creating if needed) the file at `path` for append-only writes.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, TrajectoryError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| TrajectoryError::WriteFailed(e.to_string()))?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl TrajectorySink for FileSink {
    async fn record(&self, event: TrajectoryEvent) -> Result<(), TrajectoryError> {
        let mut line = serde_json::to_string(&event).map_err(|e| TrajectoryError::Serialization(e.to_string()))?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TrajectoryError::WriteFailed(e.to_string()))?;
        file.flush().await.map_err(|e| TrajectoryError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}
