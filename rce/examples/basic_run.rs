//! Wires up an [`Engine`] around a scripted [`MockAdapter`] and runs one
//! agent task to completion, logging the recursion via `tracing`.
//!
//! ```text
//! cargo run --example basic_run --features agent
//! ```

use rce::prelude::*;
use rce_adapter::{CompletionResponse, StopReason, TokenUsage};
use rce_core::SessionId;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let adapter = MockAdapter::new(vec![CompletionResponse {
        text: Some("42 is the answer".to_string()),
        tool_calls: vec![],
        stop_reason: StopReason::EndTurn,
        usage: TokenUsage { input_tokens: 120, output_tokens: 40 },
        model: "mock".to_string(),
        cost: None,
        parsed: None,
    }]);

    let engine = Engine::builder(adapter)
        .with_agent_config(AgentConfig::new(
            5,
            3,
            20_000,
            rust_decimal::Decimal::new(100, 2),
            60,
            10,
            false,
            2_000,
            true,
        ))
        .build();

    let sweeper = engine.spawn_session_sweeper(Duration::from_secs(300));

    let cancellation = CancellationToken::new();
    let result = engine
        .run("What is the answer to life, the universe, and everything?", Some(&SessionId::new("demo")), &cancellation)
        .await;

    tracing::info!(answer = %result.answer, terminal_type = ?result.terminal_type, "run complete");

    sweeper.abort();
}
