#![deny(missing_docs)]
//! # rce — umbrella crate
//!
//! A single import surface for the Recursive Completion Engine. Re-exports
//! the protocol and implementation crates behind feature flags, plus a
//! `prelude` for the happy path and an [`Engine`] builder that wires them
//! together.

#[cfg(feature = "core")]
pub use rce_budget;
#[cfg(feature = "core")]
pub use rce_core;
#[cfg(feature = "core")]
pub use rce_tool;
#[cfg(feature = "core")]
pub use rce_trajectory;

#[cfg(feature = "interpreter")]
pub use rce_interpreter;
#[cfg(feature = "interpreter")]
pub use rce_session;

#[cfg(feature = "adapter")]
pub use rce_adapter;
#[cfg(feature = "adapter-anthropic")]
pub use rce_adapter_anthropic;

#[cfg(feature = "orchestrator")]
pub use rce_orchestrator;

#[cfg(feature = "agent")]
pub use rce_agent;

#[cfg(feature = "agent")]
mod engine;
#[cfg(feature = "agent")]
pub use engine::{Engine, EngineBuilder};

/// Happy-path imports for composing Recursive Completion Engine systems.
pub mod prelude {
    #[cfg(feature = "core")]
    pub use rce_budget::{BudgetLedger, BudgetOptions};
    #[cfg(feature = "core")]
    pub use rce_core::{CallId, Message, Role, SessionId, ToolCall, ToolResult, TrajectoryId};
    #[cfg(feature = "core")]
    pub use rce_tool::{EffectiveTools, ToolDyn, ToolError, ToolRegistry};
    #[cfg(feature = "core")]
    pub use rce_trajectory::{FileSink, InMemorySink, TrajectoryEvent, TrajectorySink};

    #[cfg(feature = "interpreter")]
    pub use rce_interpreter::{ExecutionProfile, InterpreterSandbox};
    #[cfg(feature = "interpreter")]
    pub use rce_session::{SessionHandle, SessionManager};

    #[cfg(feature = "adapter")]
    pub use rce_adapter::{Adapter, AdapterError, CompletionRequest, CompletionResponse, MockAdapter, ResponseFormat};
    #[cfg(feature = "adapter-anthropic")]
    pub use rce_adapter_anthropic::AnthropicAdapter;

    #[cfg(feature = "orchestrator")]
    pub use rce_orchestrator::{CompletionOutcome, ContextStrategy, Orchestrator, OrchestratorConfig, SlidingWindow};

    #[cfg(feature = "agent")]
    pub use crate::{Engine, EngineBuilder};
    #[cfg(feature = "agent")]
    pub use rce_agent::{AgentConfig, AgentResult, AgentRunner, CancellationToken, InterpreterTool, RunSession, TerminalType};
}
