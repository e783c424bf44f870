#![deny(missing_docs)]
//! The Orchestrator: the recursive completion loop, plus the `sub_complete`/
//! `batch_complete` tools that let one completion spawn budget-limited
//! children of itself.
//!
//! One call to [`Orchestrator::complete`] runs until the model stops asking
//! for tools (`StopReason::EndTurn`) or a budget/provider failure ends the
//! turn early. Every iteration is recorded as one [`TrajectoryEvent`]
//! regardless of whether it belongs to the root completion or a
//! `sub_complete` descendant.

mod context;
mod sub_complete;

pub use context::{ContextStrategy, SlidingWindow};
pub use sub_complete::{BatchCompleteTool, SharedLedger, SubCompleteTool};

use rce_adapter::{Adapter, AdapterError, CompletionRequest, ResponseFormat, StopReason, ToolSchema};
use rce_core::{BudgetViolation, CallId, Message, ToolResult, TrajectoryId};
use rce_tool::{EffectiveTools, ToolDyn, ToolRegistry};
use rce_trajectory::{SubCallType, TrajectoryEvent, TrajectorySink};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors from running a completion loop.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A budget check failed before the next step could run.
    #[error("budget exceeded: {0}")]
    Budget(BudgetViolation),

    /// The Adapter call itself failed.
    #[error("adapter call failed: {0}")]
    Adapter(#[from] AdapterError),

    /// Generation stopped because `max_tokens` was hit before a natural end turn.
    #[error("the model's response was truncated by max_tokens")]
    Truncated,

    /// The backend's safety system filtered the response.
    #[error("the model's response was filtered")]
    ContentFiltered,

    /// A spawned tool-dispatch task panicked or was cancelled.
    #[error("tool dispatch task failed: {0}")]
    ToolTaskFailed(String),
}

/// Construction-time policy for the Orchestrator's recursion and dispatch behavior.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum combined `sub_complete`/`batch_complete` invocations accepted
    /// in a single turn; the rest fail fast with a turn-limit error result
    /// instead of ever reaching the provider.
    pub max_sub_calls_per_turn: u32,
    /// Fraction of the parent's remaining budget a derived sub-ledger may inherit.
    pub sub_completion_inheritance_factor: f64,
    /// Upper bound on tool calls dispatched concurrently within one turn.
    pub max_parallel_tool_calls: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sub_calls_per_turn: 5,
            sub_completion_inheritance_factor: 0.5,
            max_parallel_tool_calls: 8,
        }
    }
}

/// The result of a completed (not necessarily root) completion loop.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// The assistant's final text.
    pub text: String,
    /// Number of Adapter round-trips the loop took to get there.
    pub iterations: u32,
    /// The final iteration's parsed structured output, if `response_format`
    /// was set and the backend's answer conformed to it.
    pub parsed: Option<serde_json::Value>,
}

/// Runs the recursive completion loop against one Adapter and one long-lived
/// tool registry.
///
/// Generic over `A: Adapter` rather than storing `dyn Adapter`, since
/// `Adapter` uses RPITIT and is not object-safe.
pub struct Orchestrator<A: Adapter> {
    adapter: A,
    tools: ToolRegistry,
    trajectory: Arc<dyn TrajectorySink>,
    config: OrchestratorConfig,
    context: Option<(Arc<dyn ContextStrategy>, usize)>,
}

impl<A: Adapter + 'static> Orchestrator<A> {
    /// Build an orchestrator over a concrete Adapter and a tool registry.
    pub fn new(
        adapter: A,
        tools: ToolRegistry,
        trajectory: Arc<dyn TrajectorySink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { adapter, tools, trajectory, config, context: None }
    }

    /// Compact the message list with `strategy` whenever its token estimate
    /// exceeds `token_limit`, checked once per iteration before the Adapter
    /// call. Off by default — a long-running completion relies on its token
    /// budget alone until this is configured.
    pub fn with_context_compaction(mut self, strategy: Arc<dyn ContextStrategy>, token_limit: usize) -> Self {
        self.context = Some((strategy, token_limit));
        self
    }

    /// The long-lived tool registry backing this orchestrator.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run the recursive completion loop until the model produces a final
    /// answer or the turn ends early.
    ///
    /// `static_extras` are tools injected for every iteration of this call
    /// (e.g. terminal tools supplied by an Agent Runner); `sub_complete`/
    /// `batch_complete` are added automatically each iteration, bound to the
    /// current call as their parent. `parent_call_id`/`sub_call_type` are
    /// `None` for a root completion and set by `sub_complete`/
    /// `batch_complete` when re-entering this loop for a descendant.
    pub async fn complete(
        self: &Arc<Self>,
        messages: Vec<Message>,
        system: Option<String>,
        static_extras: Vec<Arc<dyn ToolDyn>>,
        ledger: SharedLedger,
        trajectory_id: TrajectoryId,
        parent_call_id: Option<CallId>,
        sub_call_type: Option<SubCallType>,
    ) -> Result<CompletionOutcome, OrchestratorError> {
        self.complete_with_format(messages, system, static_extras, ledger, trajectory_id, parent_call_id, sub_call_type, None)
            .await
    }

    /// Same as [`complete`](Self::complete), additionally requesting
    /// JSON-schema-constrained output; the Adapter's parsed result (if any)
    /// is attached to the returned [`CompletionOutcome::parsed`].
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_with_format(
        self: &Arc<Self>,
        mut messages: Vec<Message>,
        system: Option<String>,
        static_extras: Vec<Arc<dyn ToolDyn>>,
        ledger: SharedLedger,
        trajectory_id: TrajectoryId,
        parent_call_id: Option<CallId>,
        sub_call_type: Option<SubCallType>,
        response_format: Option<ResponseFormat>,
    ) -> Result<CompletionOutcome, OrchestratorError> {
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            {
                let locked = ledger.lock().await;
                locked.check().map_err(OrchestratorError::Budget)?;
            }
            let call_id = CallId::new();
            let depth = ledger.lock().await.depth();

            let mut extras = static_extras.clone();
            extras.push(Arc::new(SubCompleteTool::new(
                Arc::clone(self),
                Arc::clone(&ledger),
                trajectory_id,
                call_id,
                self.config.sub_completion_inheritance_factor,
            )));
            extras.push(Arc::new(BatchCompleteTool::new(
                Arc::clone(self),
                Arc::clone(&ledger),
                trajectory_id,
                call_id,
                self.config.sub_completion_inheritance_factor,
                self.config.max_sub_calls_per_turn,
            )));
            let effective = EffectiveTools::new(&self.tools, extras);

            if let Some((strategy, token_limit)) = &self.context {
                if strategy.should_compact(&messages, *token_limit) {
                    messages = strategy.compact(std::mem::take(&mut messages));
                }
            }

            let tool_schemas: Vec<ToolSchema> = effective
                .list()
                .iter()
                .map(|t| ToolSchema {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    input_schema: t.input_schema(),
                })
                .collect();

            let prompt_snapshot = messages.last().map(|m| m.content.as_flat_text()).unwrap_or_default();
            let request = CompletionRequest {
                model: None,
                messages: messages.clone(),
                tools: tool_schemas,
                max_tokens: None,
                temperature: None,
                system: system.clone(),
                response_format: response_format.clone(),
                extra: serde_json::Value::Null,
            };

            let started = Instant::now();
            let response = self.adapter.complete(request).await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            {
                let mut locked = ledger.lock().await;
                locked.charge(response.usage.input_tokens, response.usage.output_tokens, response.cost.unwrap_or_default());
            }

            let mut event = TrajectoryEvent {
                trajectory_id,
                call_id,
                parent_call_id,
                depth,
                prompt: prompt_snapshot,
                response_text: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
                tool_results: vec![],
                interpreter_results: vec![],
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                duration_ms,
                timestamp: chrono::Utc::now(),
                error: None,
                estimated_cost: response.cost.unwrap_or_default(),
                sub_call_type,
            };

            match response.stop_reason {
                StopReason::MaxTokens => {
                    event.error = Some("max_tokens".to_string());
                    let _ = self.trajectory.record(event).await;
                    return Err(OrchestratorError::Truncated);
                }
                StopReason::ContentFilter => {
                    event.error = Some("content_filter".to_string());
                    let _ = self.trajectory.record(event).await;
                    return Err(OrchestratorError::ContentFiltered);
                }
                StopReason::EndTurn => {
                    let parsed = response.parsed.clone();
                    let _ = self.trajectory.record(event).await;
                    return Ok(CompletionOutcome { text: response.text.unwrap_or_default(), iterations, parsed });
                }
                StopReason::ToolUse => {
                    messages.push(Message::assistant(response.text.clone().unwrap_or_default(), response.tool_calls.clone()));

                    let results = self
                        .dispatch_tool_calls(&effective, &response.tool_calls)
                        .await?;
                    event.tool_results = results.clone();
                    let _ = self.trajectory.record(event).await;

                    for result in results {
                        messages.push(Message::tool_result(&result));
                        ledger.lock().await.charge_tool_call();
                    }
                }
            }
        }
    }

    /// Dispatch one turn's tool calls concurrently, preserving the model's
    /// original call order in the returned results regardless of which
    /// future actually resolves first.
    async fn dispatch_tool_calls(
        &self,
        effective: &EffectiveTools<'_>,
        calls: &[rce_core::ToolCall],
    ) -> Result<Vec<ToolResult>, OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_tool_calls.max(1)));
        let mut sub_calls_remaining = self.config.max_sub_calls_per_turn;
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls {
            let is_sub_call = call.name == "sub_complete" || call.name == "batch_complete";
            if is_sub_call {
                if sub_calls_remaining == 0 {
                    let id = call.id.clone();
                    handles.push(tokio::spawn(async move {
                        ToolResult::err(id, "sub-call turn limit exceeded")
                    }));
                    continue;
                }
                sub_calls_remaining -= 1;
            }

            let tool = effective.resolve(&call.name).cloned();
            let name = call.name.clone();
            let id = call.id.clone();
            let arguments = call.arguments.clone();
            let sem = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore is never closed");
                match tool {
                    Some(tool) => match rce_tool::validate_arguments(tool.name(), &tool.input_schema(), &arguments) {
                        Ok(()) => match tool.call(arguments).await {
                            Ok(value) => ToolResult::ok(id, value.to_string()),
                            Err(e) => ToolResult::err(id, e.to_string()),
                        },
                        Err(e) => ToolResult::err(id, e.to_string()),
                    },
                    None => ToolResult::err(id, format!("tool not found: {name}")),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|e| OrchestratorError::ToolTaskFailed(e.to_string()))?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rce_adapter::{CompletionResponse, MockAdapter, TokenUsage};
    use rce_budget::{BudgetLedger, BudgetOptions};
    use rce_tool::ToolError;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn end_turn(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: Some(text.to_string()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
            model: "mock-1".into(),
            cost: Some(Decimal::ZERO),
            parsed: None,
        }
    }

    fn tool_use(name: &str, args: serde_json::Value) -> CompletionResponse {
        CompletionResponse {
            text: Some(String::new()),
            tool_calls: vec![rce_core::ToolCall { id: "call_1".into(), name: name.into(), arguments: args }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
            model: "mock-1".into(),
            cost: Some(Decimal::ZERO),
            parsed: None,
        }
    }

    struct EchoTool;
    impl ToolDyn for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn call(&self, arguments: serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>> {
            Box::pin(async move { Ok(arguments) })
        }
    }

    fn fresh_ledger() -> SharedLedger {
        Arc::new(Mutex::new(BudgetLedger::new(BudgetOptions {
            max_depth: 5,
            token_budget: 100_000,
            cost_budget: Decimal::new(1000, 2),
            tool_budget: 100,
            timeout: Duration::from_secs(60),
        })))
    }

    #[tokio::test]
    async fn end_turn_returns_immediately() {
        let adapter = MockAdapter::new(vec![end_turn("done")]);
        let orch = Arc::new(Orchestrator::new(adapter, ToolRegistry::new(), Arc::new(rce_trajectory::InMemorySink::new()), OrchestratorConfig::default()));

        let outcome = orch
            .complete(vec![Message::user("hi")], None, vec![], fresh_ledger(), TrajectoryId::new(), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn tool_use_then_end_turn_takes_two_iterations() {
        let adapter = MockAdapter::new(vec![tool_use("echo", json!({"x": 1})), end_turn("final")]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let orch = Arc::new(Orchestrator::new(adapter, registry, Arc::new(rce_trajectory::InMemorySink::new()), OrchestratorConfig::default()));

        let outcome = orch
            .complete(vec![Message::user("hi")], None, vec![], fresh_ledger(), TrajectoryId::new(), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.text, "final");
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn unknown_tool_call_produces_an_error_result_not_a_hard_failure() {
        let adapter = MockAdapter::new(vec![tool_use("nonexistent", json!({})), end_turn("recovered")]);
        let orch = Arc::new(Orchestrator::new(adapter, ToolRegistry::new(), Arc::new(rce_trajectory::InMemorySink::new()), OrchestratorConfig::default()));

        let outcome = orch
            .complete(vec![Message::user("hi")], None, vec![], fresh_ledger(), TrajectoryId::new(), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.text, "recovered");
    }

    #[tokio::test]
    async fn exhausted_budget_aborts_before_the_next_adapter_call() {
        let adapter = MockAdapter::new(vec![tool_use("echo", json!({})), end_turn("should not reach here")]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let orch = Arc::new(Orchestrator::new(adapter, registry, Arc::new(rce_trajectory::InMemorySink::new()), OrchestratorConfig::default()));

        let ledger = Arc::new(Mutex::new(BudgetLedger::new(BudgetOptions {
            max_depth: 5,
            token_budget: 15,
            cost_budget: Decimal::new(1000, 2),
            tool_budget: 100,
            timeout: Duration::from_secs(60),
        })));

        let err = orch
            .complete(vec![Message::user("hi")], None, vec![], ledger, TrajectoryId::new(), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Budget(BudgetViolation::TokenExhausted { .. })));
    }

    #[tokio::test]
    async fn two_600_token_completions_exhaust_a_1000_token_budget_on_the_third_check() {
        let heavy_tool_use = CompletionResponse {
            text: Some(String::new()),
            tool_calls: vec![rce_core::ToolCall { id: "call_1".into(), name: "echo".into(), arguments: json!({}) }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage { input_tokens: 400, output_tokens: 200 },
            model: "mock-1".into(),
            cost: Some(Decimal::ZERO),
            parsed: None,
        };
        let adapter = MockAdapter::new(vec![heavy_tool_use.clone(), heavy_tool_use, end_turn("should not reach here")]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let sink = Arc::new(rce_trajectory::InMemorySink::new());
        let orch = Arc::new(Orchestrator::new(adapter, registry, sink.clone(), OrchestratorConfig::default()));

        let ledger = Arc::new(Mutex::new(BudgetLedger::new(BudgetOptions {
            max_depth: 5,
            token_budget: 1000,
            cost_budget: Decimal::new(1000, 2),
            tool_budget: 100,
            timeout: Duration::from_secs(60),
        })));

        let err = orch
            .complete(vec![Message::user("hi")], None, vec![], ledger.clone(), TrajectoryId::new(), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Budget(BudgetViolation::TokenExhausted { .. })));
        assert_eq!(ledger.lock().await.consumed_tokens(), 1200);
        assert_eq!(sink.len().await, 2);
    }

    #[tokio::test]
    async fn parallel_dispatch_preserves_original_call_order_regardless_of_completion_order() {
        struct SleepyTool {
            name: &'static str,
            millis: u64,
        }
        impl ToolDyn for SleepyTool {
            fn name(&self) -> &str {
                self.name
            }
            fn description(&self) -> &str {
                "sleeps then echoes its name"
            }
            fn input_schema(&self) -> serde_json::Value {
                json!({"type": "object"})
            }
            fn call(&self, _arguments: serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>> {
                let name = self.name;
                let millis = self.millis;
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(json!({ "name": name }))
                })
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SleepyTool { name: "slow", millis: 100 })).unwrap();
        registry.register(Arc::new(SleepyTool { name: "fast", millis: 20 })).unwrap();
        registry.register(Arc::new(SleepyTool { name: "slowest", millis: 150 })).unwrap();

        let three_calls = CompletionResponse {
            text: Some(String::new()),
            tool_calls: vec![
                rce_core::ToolCall { id: "1".into(), name: "slow".into(), arguments: json!({}) },
                rce_core::ToolCall { id: "2".into(), name: "fast".into(), arguments: json!({}) },
                rce_core::ToolCall { id: "3".into(), name: "slowest".into(), arguments: json!({}) },
            ],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
            model: "mock-1".into(),
            cost: Some(Decimal::ZERO),
            parsed: None,
        };
        let adapter = MockAdapter::new(vec![three_calls, end_turn("final")]);
        let sink = Arc::new(rce_trajectory::InMemorySink::new());
        let orch = Arc::new(Orchestrator::new(adapter, registry, sink.clone(), OrchestratorConfig::default()));

        let start = std::time::Instant::now();
        orch.complete(vec![Message::user("hi")], None, vec![], fresh_ledger(), TrajectoryId::new(), None, None)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        // Dispatched concurrently under a semaphore, so wall time tracks the
        // slowest call (~150ms), not the sum of all three (~270ms).
        assert!(elapsed < Duration::from_millis(250), "elapsed {elapsed:?} suggests sequential dispatch");

        // Regardless of completion order (fast finishes first, slowest last),
        // the recorded tool_results stay in the original call order.
        let events = sink.events().await;
        let dispatch_event = events
            .iter()
            .find(|event| event.tool_results.len() == 3)
            .expect("one recorded event should carry all three tool results");
        let ids: Vec<&str> = dispatch_event.tool_results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn trajectory_records_one_event_per_iteration() {
        let adapter = MockAdapter::new(vec![tool_use("echo", json!({})), end_turn("final")]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let sink = Arc::new(rce_trajectory::InMemorySink::new());
        let orch = Arc::new(Orchestrator::new(adapter, registry, sink.clone(), OrchestratorConfig::default()));

        orch.complete(vec![Message::user("hi")], None, vec![], fresh_ledger(), TrajectoryId::new(), None, None)
            .await
            .unwrap();

        assert_eq!(sink.len().await, 2);
    }

    #[tokio::test]
    async fn context_compaction_does_not_break_a_multi_turn_completion() {
        let adapter = MockAdapter::new(vec![
            tool_use("echo", json!({"x": 1})),
            tool_use("echo", json!({"x": 2})),
            tool_use("echo", json!({"x": 3})),
            end_turn("final"),
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let orch = Arc::new(
            Orchestrator::new(adapter, registry, Arc::new(rce_trajectory::InMemorySink::new()), OrchestratorConfig::default())
                // A tiny limit forces compaction on every iteration after the first.
                .with_context_compaction(Arc::new(crate::context::SlidingWindow::new()), 1),
        );

        let long_task = "x".repeat(2000);
        let outcome = orch
            .complete(vec![Message::user(long_task)], None, vec![], fresh_ledger(), TrajectoryId::new(), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.text, "final");
        assert_eq!(outcome.iterations, 4);
    }
}
