//! Bridges the Interpreter Sandbox into the tool-calling protocol, bound to
//! one agent run's session.

use rce_core::SessionId;
use rce_interpreter::ExecutionProfile;
use rce_session::SessionHandle;
use rce_tool::{ToolDyn, ToolError};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Exposes `InterpreterSandbox::execute` as an ordinary tool. Unlike
/// `FINAL`/`FINAL_VAR`, this doesn't flip any run-terminal state — it's a
/// regular capability the model can call as many times as its tool budget
/// allows.
///
/// Session variables are read as the script's context overrides before each
/// run; if the caller names an `assign_to` variable, the script's output is
/// written back into the session under that name, so a later `FINAL_VAR`
/// call can read it out.
pub struct InterpreterTool {
    sandbox: Arc<rce_interpreter::InterpreterSandbox>,
    session_id: SessionId,
    session: SessionHandle,
}

impl InterpreterTool {
    /// Bind to one run's interpreter sandbox and session.
    pub fn new(sandbox: Arc<rce_interpreter::InterpreterSandbox>, session_id: SessionId, session: SessionHandle) -> Self {
        Self { sandbox, session_id, session }
    }
}

impl ToolDyn for InterpreterTool {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn description(&self) -> &str {
        "Execute a short script against this run's session variables. Use for arithmetic, \
         data shaping, or scratch-work. Pass \"assign_to\" to persist the result under a \
         variable name that FINAL_VAR can read back later."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string" },
                "profile": { "type": "string", "enum": ["quick", "default", "analysis", "extended"] },
                "assign_to": { "type": "string" },
            },
            "required": ["code"],
        })
    }

    fn call(&self, input: Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + '_>> {
        Box::pin(async move {
            let code = input
                .get("code")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::ExecutionFailed("interpreter requires a \"code\" string".into()))?;
            let profile = match input.get("profile").and_then(Value::as_str) {
                Some("quick") => ExecutionProfile::Quick,
                Some("analysis") => ExecutionProfile::Analysis,
                Some("extended") => ExecutionProfile::Extended,
                _ => ExecutionProfile::Default,
            };
            let assign_to = input.get("assign_to").and_then(Value::as_str);

            let overrides = self.session.lock().await.variables.clone();
            let outcome = self.sandbox.execute(code, &self.session_id, profile, overrides).await;

            match outcome {
                Ok(result) => {
                    if let Some(name) = assign_to {
                        self.session.lock().await.variables.insert(name.to_string(), result.output.clone());
                    }
                    Ok(json!({
                        "output": result.output,
                        "stdout": result.stdout,
                        "duration_ms": result.duration_ms,
                    }))
                }
                Err(err) => Ok(json!({ "error": err.to_string() })),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rce_interpreter::InterpreterSandbox;
    use rce_session::SessionManager;
    use std::time::Duration;

    #[tokio::test]
    async fn executes_code_and_persists_the_result_under_assign_to() {
        let sandbox = Arc::new(InterpreterSandbox::new(vec![], 16));
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let session_id = SessionId::new("s1");
        let session = manager.get_or_create(&session_id).await;
        let tool = InterpreterTool::new(sandbox, session_id, session.clone());

        let result = tool
            .call(json!({ "code": "let total = 0; for i in 1..=100 { total += i; } total", "assign_to": "result" }))
            .await
            .unwrap();

        assert_eq!(result["output"], json!(5050));
        assert_eq!(session.lock().await.variables.get("result"), Some(&json!(5050)));
    }

    #[tokio::test]
    async fn security_violation_is_surfaced_as_an_error_field_not_a_tool_error() {
        let sandbox = Arc::new(InterpreterSandbox::new(vec!["math".to_string()], 16));
        let manager = SessionManager::new(4, Duration::from_secs(60));
        let session_id = SessionId::new("s2");
        let session = manager.get_or_create(&session_id).await;
        let tool = InterpreterTool::new(sandbox, session_id, session);

        let result = tool.call(json!({ "code": r#"import "os" as os; 1"# })).await.unwrap();
        assert!(result.get("error").unwrap().as_str().unwrap().contains("os"));
    }
}
