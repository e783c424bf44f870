#![deny(missing_docs)]
//! The Agent Runner: an iteration-based outer loop over the Orchestrator.
//!
//! Where [`rce_orchestrator::Orchestrator::complete`] runs one recursive
//! completion to a natural end turn, [`AgentRunner::run`] wraps repeated
//! completions into a single task: it rebuilds the prompt each iteration
//! (task, progress, a bounded ring of previous-action summaries), injects the
//! `FINAL`/`FINAL_VAR` terminal tools fresh per iteration, and stops either
//! when the model calls one of them or when a guardrail (iteration count,
//! cost, tokens, cancellation) forces the loop to give up. When a
//! [`RunSession`] and an interpreter sandbox are both present, the
//! `interpreter` tool is injected the same way, so `FINAL_VAR` can read back
//! whatever it assigns.

mod interpreter_tool;
mod terminal;

pub use interpreter_tool::InterpreterTool;
pub use terminal::TerminalType;

use rce_adapter::Adapter;
use rce_budget::{BudgetLedger, BudgetOptions};
use rce_core::{Message, SessionId, TrajectoryId};
use rce_interpreter::InterpreterSandbox;
use rce_orchestrator::{Orchestrator, SharedLedger};
use rce_session::SessionHandle;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use terminal::{AgentState, FinalTool, FinalVarTool};
use tokio::sync::Mutex;

/// Construction-time policy for one Agent Runner. Every numeric cap is
/// silently clamped to its documented ceiling at construction — a caller
/// asking for `max_iterations: 500` gets 50, not a panic.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum outer iterations before forced termination (hard ceiling 50).
    pub max_iterations: u32,
    /// Recursion depth cap passed through to the budget ledger (hard ceiling 5).
    pub max_depth: u32,
    /// Combined input+output token budget for the whole run.
    pub token_budget: u64,
    /// Max estimated cost for the whole run (hard ceiling 10.00).
    pub cost_limit: Decimal,
    /// Wallclock timeout for the whole run, in seconds (hard ceiling 600).
    pub timeout_seconds: u64,
    /// Max tool-call invocations for the whole run.
    pub tool_budget: u32,
    /// Whether iteration 1 invokes a registered `context_query` tool and
    /// folds its result into the system prompt.
    pub auto_context: bool,
    /// Token budget reserved for auto-context retrieval.
    pub context_budget: u64,
    /// Whether this run's completions should be recorded to a trajectory sink.
    pub trajectory_log: bool,
}

impl AgentConfig {
    /// Build a config, silently clamping every field to its documented ceiling.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_iterations: u32,
        max_depth: u32,
        token_budget: u64,
        cost_limit: Decimal,
        timeout_seconds: u64,
        tool_budget: u32,
        auto_context: bool,
        context_budget: u64,
        trajectory_log: bool,
    ) -> Self {
        Self {
            max_iterations: max_iterations.min(50).max(1),
            max_depth: max_depth.min(5),
            token_budget,
            cost_limit: cost_limit.min(Decimal::new(1000, 2)),
            timeout_seconds: timeout_seconds.min(600),
            tool_budget,
            auto_context,
            context_budget,
            trajectory_log,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(10, 3, 100_000, Decimal::new(500, 2), 300, 50, false, 4_000, true)
    }
}

/// The outcome of one `AgentRunner::run` call.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// The agent's final answer text.
    pub answer: String,
    /// How the run ended.
    pub terminal_type: TerminalType,
    /// Whether the run ended by guardrail rather than the model calling a terminal tool.
    pub forced_termination: bool,
    /// Whether the run ended because `cancel()` was called.
    pub cancelled: bool,
    /// Number of outer iterations actually run.
    pub iterations_used: u32,
}

/// A cooperative cancellation flag, checked once per iteration boundary.
///
/// Cloning shares the same underlying flag; `cancel()` on any clone stops
/// the run at its next iteration boundary. In-flight tool handlers are never
/// forcibly aborted — they run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Build a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A live interpreter session bound to one `AgentRunner::run` call: the id
/// `FINAL_VAR` and the interpreter tool use to address session state, and
/// the handle both read and write against.
#[derive(Debug, Clone)]
pub struct RunSession {
    /// The session's id, as known to the `SessionManager` that owns it.
    pub id: SessionId,
    /// The shared, lock-serialized handle to its variable state.
    pub handle: SessionHandle,
}

/// Runs the iteration loop for one task over a given Orchestrator.
pub struct AgentRunner<A: Adapter + 'static> {
    orchestrator: Arc<Orchestrator<A>>,
    config: AgentConfig,
    interpreter: Option<Arc<InterpreterSandbox>>,
}

impl<A: Adapter + 'static> AgentRunner<A> {
    /// Build a runner over an existing Orchestrator.
    pub fn new(orchestrator: Arc<Orchestrator<A>>, config: AgentConfig) -> Self {
        Self { orchestrator, config, interpreter: None }
    }

    /// Make the `interpreter` tool available to every run that carries a
    /// `RunSession` (runs with no session skip it — there would be nowhere
    /// to persist an `assign_to` binding for `FINAL_VAR` to read back).
    pub fn with_interpreter(mut self, sandbox: Arc<InterpreterSandbox>) -> Self {
        self.interpreter = Some(sandbox);
        self
    }

    /// Run the agent loop for `task`, optionally against a live interpreter
    /// session so `FINAL_VAR` can read a computed variable out of it and the
    /// `interpreter` tool (if configured) can read and write its state.
    pub async fn run(&self, task: impl Into<String>, session: Option<RunSession>, cancellation: &CancellationToken) -> AgentResult {
        let task = task.into();
        let trajectory_id = TrajectoryId::new();
        let ledger: SharedLedger = Arc::new(Mutex::new(BudgetLedger::new(BudgetOptions {
            max_depth: self.config.max_depth,
            token_budget: self.config.token_budget,
            cost_budget: self.config.cost_limit,
            tool_budget: self.config.tool_budget,
            timeout: Duration::from_secs(self.config.timeout_seconds),
        })));

        let mut previous_actions: VecDeque<String> = VecDeque::with_capacity(5);
        let mut last_answer = String::new();
        let mut iteration = 0u32;

        loop {
            iteration += 1;

            if cancellation.is_cancelled() {
                return AgentResult {
                    answer: last_answer,
                    terminal_type: TerminalType::Forced,
                    forced_termination: true,
                    cancelled: true,
                    iterations_used: iteration - 1,
                };
            }

            let (consumed_tokens, consumed_cost) = {
                let locked = ledger.lock().await;
                (locked.consumed_tokens(), locked.consumed_cost())
            };
            if iteration > self.config.max_iterations
                || consumed_cost >= self.config.cost_limit
                || consumed_tokens >= self.config.token_budget
            {
                iteration -= 1;
                break;
            }

            let is_final_iteration = iteration == self.config.max_iterations;
            let remaining_tokens = self.config.token_budget.saturating_sub(consumed_tokens);
            let prompt = build_iteration_prompt(&task, iteration, self.config.max_iterations, &previous_actions, remaining_tokens, is_final_iteration);

            let mut system = None;
            if iteration == 1 && self.config.auto_context {
                if let Some(tool) = self.orchestrator.tools().get("context_query") {
                    if let Ok(value) = tool.call(serde_json::json!({ "query": task })).await {
                        system = Some(value.to_string());
                    }
                }
            }

            let state = Arc::new(Mutex::new(AgentState::default()));
            let final_tool = Arc::new(FinalTool::new(Arc::clone(&state)));
            let final_var_tool = Arc::new(FinalVarTool::new(Arc::clone(&state), session.as_ref().map(|s| s.handle.clone())));

            let mut extras: Vec<Arc<dyn rce_tool::ToolDyn>> = vec![final_tool, final_var_tool];
            if let (Some(sandbox), Some(run_session)) = (&self.interpreter, &session) {
                extras.push(Arc::new(interpreter_tool::InterpreterTool::new(
                    Arc::clone(sandbox),
                    run_session.id.clone(),
                    run_session.handle.clone(),
                )));
            }

            let outcome = self
                .orchestrator
                .complete(
                    vec![Message::user(prompt)],
                    system,
                    extras,
                    Arc::clone(&ledger),
                    trajectory_id,
                    None,
                    None,
                )
                .await;

            match outcome {
                Ok(completion) => {
                    last_answer = completion.text.clone();
                    push_bounded(&mut previous_actions, format!("iteration {iteration}: {}", summarize(&completion.text)));
                }
                Err(e) => {
                    push_bounded(&mut previous_actions, format!("iteration {iteration} failed: {e}"));
                }
            }

            let locked_state = state.lock().await;
            if locked_state.is_terminal {
                return AgentResult {
                    answer: locked_state.answer.clone().unwrap_or_else(|| last_answer.clone()),
                    terminal_type: locked_state.terminal_type.clone().unwrap_or(TerminalType::NaturalLanguage),
                    forced_termination: false,
                    cancelled: false,
                    iterations_used: iteration,
                };
            }
        }

        AgentResult {
            answer: last_answer,
            terminal_type: TerminalType::Forced,
            forced_termination: true,
            cancelled: false,
            iterations_used: iteration,
        }
    }
}

fn push_bounded(queue: &mut VecDeque<String>, entry: String) {
    if queue.len() >= 5 {
        queue.pop_front();
    }
    queue.push_back(entry);
}

fn summarize(text: &str) -> String {
    const MAX: usize = 160;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let boundary = floor_char_boundary(text, MAX);
        format!("{}...", &text[..boundary])
    }
}

/// The largest index `<= index` that lands on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn build_iteration_prompt(
    task: &str,
    iteration: u32,
    max_iterations: u32,
    previous_actions: &VecDeque<String>,
    remaining_tokens: u64,
    is_final_iteration: bool,
) -> String {
    let mut prompt = format!("Task: {task}\nIteration {iteration}/{max_iterations}\nRemaining token budget: {remaining_tokens}\n");
    if !previous_actions.is_empty() {
        prompt.push_str("Previous actions:\n");
        for action in previous_actions {
            prompt.push_str("- ");
            prompt.push_str(action);
            prompt.push('\n');
        }
    }
    if is_final_iteration {
        prompt.push_str("\nThis is the final permitted iteration. You must call FINAL or FINAL_VAR now.\n");
    }
    prompt
}
