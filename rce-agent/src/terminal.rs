//! The `FINAL`/`FINAL_VAR` terminal tools and the shared state they flip.

use rce_session::SessionHandle;
use rce_tool::{ToolDyn, ToolError};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a run's terminal answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalType {
    /// `FINAL(answer)` — the model's own prose answer.
    NaturalLanguage,
    /// `FINAL_VAR(name)` — the string form of an interpreter session variable.
    ComputedVariable,
    /// The run exhausted its guardrails without either terminal tool firing.
    Forced,
}

/// Shared across one Agent Runner iteration: whichever terminal tool is
/// injected sets this once the model invokes it, and the iteration loop
/// reads it back after the Orchestrator call returns.
#[derive(Debug, Default)]
pub struct AgentState {
    pub(crate) is_terminal: bool,
    pub(crate) answer: Option<String>,
    pub(crate) terminal_type: Option<TerminalType>,
}

/// `FINAL(answer)`: records the model's own answer and ends the run.
pub struct FinalTool {
    state: Arc<Mutex<AgentState>>,
}

impl FinalTool {
    /// Bind to the iteration's shared terminal state.
    pub fn new(state: Arc<Mutex<AgentState>>) -> Self {
        Self { state }
    }
}

impl ToolDyn for FinalTool {
    fn name(&self) -> &str {
        "FINAL"
    }

    fn description(&self) -> &str {
        "Call this with your final answer once the task is complete. Ends the run."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "answer": { "type": "string" } },
            "required": ["answer"],
        })
    }

    fn call(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let answer = input
                .get("answer")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::ExecutionFailed("FINAL requires an \"answer\" string".into()))?
                .to_string();

            let mut state = self.state.lock().await;
            state.is_terminal = true;
            state.answer = Some(answer);
            state.terminal_type = Some(TerminalType::NaturalLanguage);
            Ok(json!({ "acknowledged": true }))
        })
    }
}

/// `FINAL_VAR(variable_name)`: ends the run with the string form of a
/// variable read out of the run's interpreter session, if one is attached.
pub struct FinalVarTool {
    state: Arc<Mutex<AgentState>>,
    session: Option<SessionHandle>,
}

impl FinalVarTool {
    /// Bind to the iteration's shared terminal state and (optionally) a
    /// live interpreter session to read variables from.
    pub fn new(state: Arc<Mutex<AgentState>>, session: Option<SessionHandle>) -> Self {
        Self { state, session }
    }
}

impl ToolDyn for FinalVarTool {
    fn name(&self) -> &str {
        "FINAL_VAR"
    }

    fn description(&self) -> &str {
        "Call this with the name of an interpreter session variable to end the run with its value."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "variable_name": { "type": "string" } },
            "required": ["variable_name"],
        })
    }

    fn call(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let variable_name = input
                .get("variable_name")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::ExecutionFailed("FINAL_VAR requires a \"variable_name\" string".into()))?;

            let Some(session) = &self.session else {
                return Ok(json!({ "error": format!("no session attached; variable {variable_name} unavailable") }));
            };

            let value = {
                let locked = session.lock().await;
                locked.variables.get(variable_name).cloned()
            };

            let Some(value) = value else {
                // Absent variable: an error result, and is_terminal stays unset
                // so the agent loop keeps going rather than ending on a miss.
                return Ok(json!({ "error": format!("variable {variable_name} not found in session") }));
            };

            let rendered = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            let mut state = self.state.lock().await;
            state.is_terminal = true;
            state.answer = Some(rendered);
            state.terminal_type = Some(TerminalType::ComputedVariable);
            Ok(json!({ "acknowledged": true }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rce_core::SessionId;
    use rce_session::SessionManager;
    use std::time::Duration;

    #[tokio::test]
    async fn final_tool_sets_terminal_state() {
        let state = Arc::new(Mutex::new(AgentState::default()));
        let tool = FinalTool::new(Arc::clone(&state));

        tool.call(json!({ "answer": "the result" })).await.unwrap();

        let locked = state.lock().await;
        assert!(locked.is_terminal);
        assert_eq!(locked.answer.as_deref(), Some("the result"));
        assert_eq!(locked.terminal_type, Some(TerminalType::NaturalLanguage));
    }

    #[tokio::test]
    async fn final_var_tool_reads_a_present_variable() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let session = manager.get_or_create(&SessionId::new("s1")).await;
        session.lock().await.variables.insert("total".into(), json!(55));

        let state = Arc::new(Mutex::new(AgentState::default()));
        let tool = FinalVarTool::new(Arc::clone(&state), Some(session));

        tool.call(json!({ "variable_name": "total" })).await.unwrap();

        let locked = state.lock().await;
        assert!(locked.is_terminal);
        assert_eq!(locked.answer.as_deref(), Some("55"));
        assert_eq!(locked.terminal_type, Some(TerminalType::ComputedVariable));
    }

    #[tokio::test]
    async fn final_var_tool_does_not_terminate_on_missing_variable() {
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let session = manager.get_or_create(&SessionId::new("s2")).await;

        let state = Arc::new(Mutex::new(AgentState::default()));
        let tool = FinalVarTool::new(Arc::clone(&state), Some(session));

        let result = tool.call(json!({ "variable_name": "missing" })).await.unwrap();

        assert!(result.get("error").is_some());
        assert!(!state.lock().await.is_terminal);
    }

    #[tokio::test]
    async fn final_var_tool_without_a_session_reports_unavailable() {
        let state = Arc::new(Mutex::new(AgentState::default()));
        let tool = FinalVarTool::new(Arc::clone(&state), None);

        let result = tool.call(json!({ "variable_name": "anything" })).await.unwrap();

        assert!(result.get("error").is_some());
        assert!(!state.lock().await.is_terminal);
    }
}
