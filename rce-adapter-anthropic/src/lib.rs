#![deny(missing_docs)]
//! Anthropic Messages API implementation of [`rce_adapter::Adapter`].

mod types;

use rce_adapter::{Adapter, AdapterError, CompletionRequest, CompletionResponse, ResponseFormat, StopReason, TokenUsage, ToolSchema};
use rce_core::{Content, ContentBlock, Message, Role, ToolCall, ToolResult};
use rust_decimal::Decimal;
use types::*;

/// Anthropic API adapter.
pub struct AnthropicAdapter {
    api_key: String,
    client: reqwest::Client,
    api_url: String,
    api_version: String,
}

impl AnthropicAdapter {
    /// Create an adapter against the production Anthropic endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            api_url: "https://api.anthropic.com/v1/messages".into(),
            api_version: "2023-06-01".into(),
        }
    }

    /// Override the API URL (for testing or self-hosted proxies).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn build_request(&self, request: &CompletionRequest) -> AnthropicRequest {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| "claude-haiku-4-5-20251001".into());
        let max_tokens = request.max_tokens.unwrap_or(4096);

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(message_to_anthropic)
            .collect();

        let mut tools: Vec<AnthropicTool> = request
            .tools
            .iter()
            .map(|t: &ToolSchema| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        // JSON mode is modeled as a tool the model is forced to call: Anthropic
        // has no native `response_format`, so the structured-output schema
        // rides along as an ordinary tool definition with tool_choice pinned to it.
        let tool_choice = request.response_format.as_ref().map(|format| {
            tools.push(AnthropicTool {
                name: format.name.clone(),
                description: "Structured output matching the requested schema.".to_string(),
                input_schema: format.schema.clone(),
            });
            AnthropicToolChoice::Tool { name: format.name.clone() }
        });

        AnthropicRequest {
            model,
            max_tokens,
            messages,
            system: request.system.clone(),
            tools,
            tool_choice,
        }
    }

    fn parse_response(&self, response: AnthropicResponse, response_format: Option<&ResponseFormat>) -> CompletionResponse {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut parsed = None;

        for block in &response.content {
            match block {
                AnthropicContentBlock::Text { text } => text_parts.push(text.clone()),
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    if response_format.is_some_and(|format| &format.name == name) {
                        parsed = Some(input.clone());
                        continue;
                    }
                    tool_calls.push(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    });
                }
                AnthropicContentBlock::ToolResult { .. } => {
                    // The model never emits tool_result blocks itself; only
                    // present here because the block enum is shared with requests.
                }
            }
        }

        let stop_reason = match response.stop_reason.as_str() {
            "end_turn" => StopReason::EndTurn,
            "tool_use" if tool_calls.is_empty() && parsed.is_some() => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        let usage = TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        };

        // Haiku pricing as of the engine's last price refresh:
        // $0.25/MTok input, $1.25/MTok output.
        let input_cost = Decimal::from(response.usage.input_tokens) * Decimal::new(25, 8);
        let output_cost = Decimal::from(response.usage.output_tokens) * Decimal::new(125, 8);

        CompletionResponse {
            text: if text_parts.is_empty() { None } else { Some(text_parts.join("")) },
            tool_calls,
            stop_reason,
            usage,
            model: response.model,
            cost: Some(input_cost + output_cost),
            parsed,
        }
    }
}

impl Adapter for AnthropicAdapter {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AdapterError> {
        let api_request = self.build_request(&request);
        let http_response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| AdapterError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = http_response.text().await.unwrap_or_default();
            return Err(AdapterError::AuthFailed(body));
        }
        if !status.is_success() {
            let body = http_response.text().await.unwrap_or_default();
            return Err(AdapterError::RequestFailed(format!("HTTP {status}: {body}")));
        }

        let api_response: AnthropicResponse = http_response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;

        Ok(self.parse_response(api_response, request.response_format.as_ref()))
    }
}

fn message_to_anthropic(message: &Message) -> AnthropicMessage {
    if message.role == Role::Tool {
        let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
        let (content, is_error) = match &message.content {
            Content::Text(text) => (text.clone(), false),
            Content::Blocks(blocks) => (flatten_text(blocks), false),
        };
        return AnthropicMessage {
            role: "user".to_string(),
            content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }]),
        };
    }

    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System | Role::Tool => unreachable!("filtered or handled above"),
    };

    let mut blocks = match &message.content {
        Content::Text(text) if message.tool_calls.is_none() => {
            return AnthropicMessage {
                role: role.to_string(),
                content: AnthropicContent::Text(text.clone()),
            };
        }
        Content::Text(text) => vec![AnthropicContentBlock::Text { text: text.clone() }],
        Content::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(AnthropicContentBlock::Text { text: text.clone() }),
                _ => None,
            })
            .collect(),
    };

    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            blocks.push(AnthropicContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });
        }
    }

    AnthropicMessage {
        role: role.to_string(),
        content: AnthropicContent::Blocks(blocks),
    }
}

fn flatten_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}
