//! The conversation data model: [`Message`], [`ContentBlock`], [`ToolCall`], [`ToolResult`].
//!
//! These are the engine's internal lingua franca — not a specific provider's
//! wire format. The LLM Adapter boundary converts to/from these.

use serde::{Deserialize, Serialize};

/// Role of a message's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User-authored content.
    User,
    /// Assistant (model) output.
    Assistant,
    /// A tool's result, owned by a prior assistant `ToolCall`.
    Tool,
}

/// A single typed content block within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image referenced by URL.
    ImageUrl {
        /// The image URL.
        url: String,
    },
    /// Inline audio content, base64-encoded.
    Audio {
        /// Base64-encoded audio bytes.
        data: String,
        /// MIME type, e.g. `audio/wav`.
        media_type: String,
    },
}

/// The body of a message: either plain text or an ordered sequence of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text shorthand.
    Text(String),
    /// An ordered sequence of typed content blocks.
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Construct a text-only content body.
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    /// Render as a flat string, concatenating block text (images/audio become placeholders).
    pub fn as_flat_text(&self) -> String {
        match self {
            Content::Text(t) => t.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ImageUrl { url } => format!("[image: {url}]"),
                    ContentBlock::Audio { media_type, .. } => format!("[audio: {media_type}]"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A tool invocation requested by the assistant within one turn.
///
/// `id` is stable and unique within a single turn — it links this call to
/// the eventual [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id for this call, scoped to the turn that produced it.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Structured (JSON-shaped) arguments.
    pub arguments: serde_json::Value,
}

/// The result of executing one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The `ToolCall.id` this result answers.
    pub tool_call_id: String,
    /// The result content, rendered as a string for the model.
    pub content: String,
    /// Whether the tool execution errored.
    pub is_error: bool,
}

impl ToolResult {
    /// Build a successful result.
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Build an error result.
    pub fn err(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The author's role.
    pub role: Role,
    /// The message body.
    pub content: Content,
    /// Tool calls requested by this message (assistant messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The `ToolCall.id` this message answers (role = tool only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Build a plain system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: Content::text(text), tool_calls: None, tool_call_id: None }
    }

    /// Build a plain user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: Content::text(text), tool_calls: None, tool_call_id: None }
    }

    /// Build an assistant message, optionally carrying tool calls.
    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::text(text),
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            tool_call_id: None,
        }
    }

    /// Build a tool-result message.
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: Content::text(result.content.clone()),
            tool_calls: None,
            tool_call_id: Some(result.tool_call_id.clone()),
        }
    }
}
