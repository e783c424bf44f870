//! The `sub_complete`/`batch_complete` tools: the engine's own
//! recursion primitive, implemented as ordinary [`ToolDyn`] registrants
//! rather than orchestrator special cases.

use crate::Orchestrator;
use rce_adapter::Adapter;
use rce_budget::BudgetLedger;
use rce_core::{CallId, Message, TrajectoryId};
use rce_tool::{ToolDyn, ToolError};
use rce_trajectory::SubCallType;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// A budget ledger shared across the tasks of one completion turn.
///
/// `BudgetLedger` is otherwise thread-confined; wrapping it here is what lets
/// `sub_complete`/`batch_complete` — themselves dispatched as ordinary tool
/// calls, possibly alongside others, under [`tokio::spawn`] — read and charge
/// against it safely.
pub type SharedLedger = Arc<Mutex<BudgetLedger>>;

const SENTINEL_MAX_DEPTH: &str = "Maximum recursion depth reached; summarize with available context";

/// Name of the documentation-retrieval tool `sub_complete` consults when a
/// caller supplies `context_query` — the same name the Agent Runner's own
/// auto-context lookup uses. Treated as an ordinary registered tool: if
/// nothing by this name is registered, `context_query` is a no-op.
const CONTEXT_RETRIEVAL_TOOL: &str = "context_query";

async fn derive_and_check(parent: &SharedLedger, requested_tokens: u64, inheritance_factor: f64) -> Result<BudgetLedger, Value> {
    let sub = {
        let locked = parent.lock().await;
        locked.derive_sub_ledger(requested_tokens, inheritance_factor)
    };
    if let Err(violation) = sub.check() {
        if violation.kind() == "depth_exceeded" {
            return Err(json!({ "result": SENTINEL_MAX_DEPTH, "terminated": true }));
        }
        return Err(json!({ "result": format!("sub-completion budget rejected: {violation}"), "terminated": true }));
    }
    Ok(sub)
}

/// Delegates a single focused sub-task to a fresh, budget-limited completion.
pub struct SubCompleteTool<A: Adapter + 'static> {
    orchestrator: Arc<Orchestrator<A>>,
    parent_ledger: SharedLedger,
    trajectory_id: TrajectoryId,
    parent_call_id: CallId,
    inheritance_factor: f64,
}

impl<A: Adapter + 'static> SubCompleteTool<A> {
    /// Build a `sub_complete` tool bound to the turn that may invoke it.
    pub fn new(
        orchestrator: Arc<Orchestrator<A>>,
        parent_ledger: SharedLedger,
        trajectory_id: TrajectoryId,
        parent_call_id: CallId,
        inheritance_factor: f64,
    ) -> Self {
        Self { orchestrator, parent_ledger, trajectory_id, parent_call_id, inheritance_factor }
    }
}

impl<A: Adapter + 'static> ToolDyn for SubCompleteTool<A> {
    fn name(&self) -> &str {
        "sub_complete"
    }

    fn description(&self) -> &str {
        "Delegate a focused sub-task to a fresh, budget-limited sub-completion and return its answer."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "The sub-task to complete." },
                "max_tokens": { "type": "integer", "minimum": 1, "description": "Requested token cap; clamped to the parent's remaining share." },
                "system": { "type": "string", "description": "Optional system prompt for the sub-completion." },
                "context_query": { "type": "string", "description": "If set and a documentation-retrieval tool is registered, it is invoked first and its output is prepended to the sub-call's system prompt." }
            },
            "required": ["prompt"],
        })
    }

    fn call(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let prompt = input
                .get("prompt")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::ExecutionFailed("sub_complete requires a \"prompt\" string".into()))?
                .to_string();
            let requested_tokens = input.get("max_tokens").and_then(Value::as_u64).unwrap_or(4_000);
            let mut system = input.get("system").and_then(Value::as_str).map(str::to_string);

            if let Some(query) = input.get("context_query").and_then(Value::as_str) {
                if let Some(tool) = self.orchestrator.tools().get(CONTEXT_RETRIEVAL_TOOL) {
                    let retrieved = tool
                        .call(json!({ "query": query }))
                        .await
                        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
                    let retrieved_text = retrieved.as_str().map(str::to_string).unwrap_or_else(|| retrieved.to_string());
                    system = Some(match system {
                        Some(existing) => format!("{retrieved_text}\n\n{existing}"),
                        None => retrieved_text,
                    });
                }
            }

            let sub_ledger = match derive_and_check(&self.parent_ledger, requested_tokens, self.inheritance_factor).await {
                Ok(ledger) => ledger,
                Err(sentinel) => return Ok(sentinel),
            };
            let sub_ledger: SharedLedger = Arc::new(Mutex::new(sub_ledger));

            let outcome = self
                .orchestrator
                .complete(
                    vec![Message::user(prompt)],
                    system,
                    vec![],
                    Arc::clone(&sub_ledger),
                    self.trajectory_id,
                    Some(self.parent_call_id),
                    Some(SubCallType::SubComplete),
                )
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

            self.parent_ledger.lock().await.absorb(&*sub_ledger.lock().await);

            Ok(json!({ "result": outcome.text }))
        })
    }
}

/// Fans a batch of independent sub-tasks out in parallel, each with its own
/// derived budget, returning results in the original request order.
pub struct BatchCompleteTool<A: Adapter + 'static> {
    orchestrator: Arc<Orchestrator<A>>,
    parent_ledger: SharedLedger,
    trajectory_id: TrajectoryId,
    parent_call_id: CallId,
    inheritance_factor: f64,
    max_batch_size: u32,
}

impl<A: Adapter + 'static> BatchCompleteTool<A> {
    /// Build a `batch_complete` tool bound to the turn that may invoke it.
    pub fn new(
        orchestrator: Arc<Orchestrator<A>>,
        parent_ledger: SharedLedger,
        trajectory_id: TrajectoryId,
        parent_call_id: CallId,
        inheritance_factor: f64,
        max_batch_size: u32,
    ) -> Self {
        Self { orchestrator, parent_ledger, trajectory_id, parent_call_id, inheritance_factor, max_batch_size }
    }
}

impl<A: Adapter + 'static> ToolDyn for BatchCompleteTool<A> {
    fn name(&self) -> &str {
        "batch_complete"
    }

    fn description(&self) -> &str {
        "Run several independent sub-completions in parallel, each budget-limited, returning their answers in request order."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompts": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                },
                "max_tokens": { "type": "integer", "minimum": 1 },
                "max_parallel": { "type": "integer", "minimum": 1, "description": "Upper bound on sub-completions dispatched concurrently; defaults to the per-turn batch cap." },
                "total_budget": { "type": "integer", "minimum": 1, "description": "Total token budget split evenly across all prompts in the batch." }
            },
            "required": ["prompts"],
        })
    }

    fn call(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let prompts: Vec<String> = input
                .get("prompts")
                .and_then(Value::as_array)
                .ok_or_else(|| ToolError::ExecutionFailed("batch_complete requires a \"prompts\" array".into()))?
                .iter()
                .map(|p| p.as_str().unwrap_or_default().to_string())
                .collect();
            if prompts.len() as u32 > self.max_batch_size {
                return Ok(json!({
                    "result": format!("batch of {} exceeds the per-turn cap of {}", prompts.len(), self.max_batch_size),
                    "terminated": true,
                }));
            }
            let per_query_tokens = match input.get("total_budget").and_then(Value::as_u64) {
                Some(total) if !prompts.is_empty() => total / prompts.len() as u64,
                _ => input.get("max_tokens").and_then(Value::as_u64).unwrap_or(4_000),
            };
            let max_parallel = input
                .get("max_parallel")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(self.max_batch_size as usize)
                .max(1);
            let semaphore = Arc::new(Semaphore::new(max_parallel));

            // Ordered JoinHandle collection: push handles in request order,
            // await them in that same order, so results[i] answers prompts[i]
            // regardless of which sub-completion actually finishes first.
            let mut handles = Vec::with_capacity(prompts.len());
            for prompt in prompts {
                let sub_ledger = match derive_and_check(&self.parent_ledger, per_query_tokens, self.inheritance_factor).await {
                    Ok(ledger) => Arc::new(Mutex::new(ledger)),
                    Err(sentinel) => {
                        let sentinel_text = sentinel["result"].as_str().unwrap_or_default().to_string();
                        handles.push(tokio::spawn(async move { Ok(sentinel_text) }));
                        continue;
                    }
                };
                let orchestrator = Arc::clone(&self.orchestrator);
                let trajectory_id = self.trajectory_id;
                let parent_call_id = self.parent_call_id;
                let parent_ledger = Arc::clone(&self.parent_ledger);
                let sub_ledger_for_task = Arc::clone(&sub_ledger);
                let permit = Arc::clone(&semaphore);

                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore is never closed");
                    let outcome = orchestrator
                        .complete(
                            vec![Message::user(prompt)],
                            None,
                            vec![],
                            Arc::clone(&sub_ledger_for_task),
                            trajectory_id,
                            Some(parent_call_id),
                            Some(SubCallType::BatchComplete),
                        )
                        .await
                        .map_err(|e| e.to_string());

                    parent_ledger.lock().await.absorb(&*sub_ledger_for_task.lock().await);
                    outcome.map(|o| o.text)
                }));
            }

            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(Ok(text)) => results.push(json!(text)),
                    Ok(Err(detail)) => results.push(json!({ "error": detail })),
                    Err(join_error) => results.push(json!({ "error": join_error.to_string() })),
                }
            }

            Ok(json!({ "results": results }))
        })
    }
}
