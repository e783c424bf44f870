#![deny(missing_docs)]
//! Tool Registry: the object-safe tool interface and its JSON-Schema-validating registry.
//!
//! Any tool source (local function, interpreter-backed, sub-completion) implements
//! [`ToolDyn`]. A [`ToolRegistry`] holds the long-lived set of tools available to an
//! Agent Runner or Orchestrator; [`EffectiveTools`] layers a per-call list of "extra"
//! tools (e.g. the terminal `FINAL`/`FINAL_VAR` tools, or `sub_complete`) on top of it,
//! with extras shadowing registry entries of the same name.

use jsonschema::Validator;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors from tool operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool was not found in the registry or the current extras list.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// A tool with this name is already registered.
    #[error("tool already registered: {0}")]
    AlreadyRegistered(String),

    /// The tool's own `input_schema()` is not a valid JSON Schema document.
    #[error("invalid schema for tool {name}: {detail}")]
    InvalidSchema {
        /// The tool whose schema failed to compile.
        name: String,
        /// The validator's error detail.
        detail: String,
    },

    /// Arguments failed validation against the tool's input schema.
    #[error("argument validation failed for tool {name}: {detail}")]
    ValidationFailed {
        /// The tool the call was aimed at.
        name: String,
        /// The first schema violation encountered.
        detail: String,
    },

    /// The tool's handler returned an error.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Catch-all for errors from lower layers.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Object-safe trait for tool implementations.
///
/// Tools are stored as `Arc<dyn ToolDyn>` so a single instance can be shared
/// across a long-lived registry and any number of per-call extras lists.
pub trait ToolDyn: Send + Sync {
    /// The tool's unique name.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema (draft 7) for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool. Called only after arguments pass schema validation.
    fn call(
        &self,
        arguments: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>;
}

/// The long-lived registry of tools available across calls.
///
/// Registration fails on name conflict rather than silently overwriting —
/// a duplicate name is almost always a wiring bug, and staying silent about
/// it would let one tool's definition shadow another's without anyone noticing.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Fails if a tool with the same name is already present.
    pub fn register(&mut self, tool: Arc<dyn ToolDyn>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool by name. Returns the removed tool, if present.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn ToolDyn>> {
        self.tools.remove(name)
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolDyn>> {
        self.tools.get(name)
    }

    /// List all registered tools.
    pub fn list(&self) -> impl Iterator<Item = &Arc<dyn ToolDyn>> {
        self.tools.values()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry holds no tools.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry plus a per-call list of extra tools that shadow it by name.
///
/// Built fresh for each agent iteration or orchestrator turn: the extras
/// (terminal tools, a caller-supplied one-off tool) never mutate the shared
/// registry, so concurrent callers never see each other's extras.
pub struct EffectiveTools<'a> {
    registry: &'a ToolRegistry,
    extras: Vec<Arc<dyn ToolDyn>>,
}

impl<'a> EffectiveTools<'a> {
    /// Combine a registry with a per-call list of extra tools.
    ///
    /// Extras are matched first: a tool in `extras` with the same name as one
    /// in `registry` takes precedence for [`resolve`](Self::resolve) and is
    /// de-duplicated out of [`list`](Self::list).
    pub fn new(registry: &'a ToolRegistry, extras: Vec<Arc<dyn ToolDyn>>) -> Self {
        Self { registry, extras }
    }

    /// Resolve a tool by name, preferring extras over the registry.
    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn ToolDyn>> {
        self.extras
            .iter()
            .find(|t| t.name() == name)
            .or_else(|| self.registry.get(name))
    }

    /// All tools visible for this call: extras plus non-shadowed registry entries.
    pub fn list(&self) -> Vec<&Arc<dyn ToolDyn>> {
        let shadowed: std::collections::HashSet<&str> =
            self.extras.iter().map(|t| t.name()).collect();
        self.extras
            .iter()
            .chain(self.registry.list().filter(|t| !shadowed.contains(t.name())))
            .collect()
    }

    /// Validate `arguments` against the resolved tool's schema, then call it.
    ///
    /// Returns [`ToolError::NotFound`] if no tool by that name is visible, and
    /// [`ToolError::ValidationFailed`] before the handler ever runs if the
    /// arguments don't satisfy the tool's declared schema.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .resolve(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        validate_arguments(tool.name(), &tool.input_schema(), &arguments)?;
        tool.call(arguments).await
    }
}

/// Compile a tool's declared schema and validate `arguments` against it.
///
/// A structural pass done once per call, ahead of handler dispatch, so a
/// malformed call never reaches (and never charges budget against) the
/// tool's own logic.
pub fn validate_arguments(
    tool_name: &str,
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), ToolError> {
    let validator = Validator::new(schema).map_err(|e| ToolError::InvalidSchema {
        name: tool_name.to_string(),
        detail: e.to_string(),
    })?;
    if let Err(e) = validator.validate(arguments) {
        return Err(ToolError::ValidationFailed {
            name: tool_name.to_string(),
            detail: e.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn tool_dyn_is_object_safe() {
        _assert_send_sync::<Arc<dyn ToolDyn>>();
    }

    struct EchoTool;

    impl ToolDyn for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "msg": { "type": "string" } },
                "required": ["msg"],
            })
        }
        fn call(
            &self,
            arguments: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>
        {
            Box::pin(async move { Ok(json!({ "echoed": arguments })) })
        }
    }

    struct OverrideEchoTool;

    impl ToolDyn for OverrideEchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "A per-call override of echo"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        fn call(
            &self,
            _arguments: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>
        {
            Box::pin(async move { Ok(json!({ "overridden": true })) })
        }
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let err = reg.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::AlreadyRegistered(name) if name == "echo"));
    }

    #[test]
    fn unregister_removes_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        assert!(reg.unregister("echo").is_some());
        assert!(reg.get("echo").is_none());
    }

    #[tokio::test]
    async fn dispatch_validates_before_calling() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let effective = EffectiveTools::new(&reg, vec![]);

        let err = effective.dispatch("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn dispatch_calls_on_valid_arguments() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let effective = EffectiveTools::new(&reg, vec![]);

        let result = effective
            .dispatch("echo", json!({ "msg": "hi" }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "echoed": { "msg": "hi" } }));
    }

    #[tokio::test]
    async fn dispatch_reports_not_found() {
        let reg = ToolRegistry::new();
        let effective = EffectiveTools::new(&reg, vec![]);
        let err = effective.dispatch("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn extras_shadow_registry_entries_of_the_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let effective = EffectiveTools::new(&reg, vec![Arc::new(OverrideEchoTool)]);

        let result = effective.dispatch("echo", json!({})).await.unwrap();
        assert_eq!(result, json!({ "overridden": true }));
    }

    #[test]
    fn list_deduplicates_shadowed_names() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let effective = EffectiveTools::new(&reg, vec![Arc::new(OverrideEchoTool)]);

        let names: Vec<&str> = effective.list().iter().map(|t| t.name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "echo").count(), 1);
    }

    #[test]
    fn invalid_schema_is_reported_without_panicking() {
        let err = validate_arguments("bad", &json!({ "type": "not-a-real-type" }), &json!({}))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidSchema { .. }));
    }
}
