//! [`Engine`]: a builder-style composition root wiring every crate into one
//! runnable system, assembling adapter, tools, and trajectory sink the way
//! a `Runtime` assembles operator + provider + state store.

use rce_adapter::Adapter;
use rce_agent::{AgentConfig, AgentResult, AgentRunner, CancellationToken, RunSession};
use rce_core::SessionId;
use rce_interpreter::InterpreterSandbox;
use rce_orchestrator::{ContextStrategy, Orchestrator, OrchestratorConfig};
use rce_session::SessionManager;
use rce_tool::{ToolDyn, ToolError, ToolRegistry};
use rce_trajectory::{InMemorySink, TrajectorySink};
use std::sync::Arc;
use std::time::Duration;

/// The assembled system: one Orchestrator, one session pool, one agent
/// configuration. Cheap to clone (everything inside is already `Arc`-backed).
pub struct Engine<A: Adapter + 'static> {
    orchestrator: Arc<Orchestrator<A>>,
    sessions: Arc<SessionManager>,
    agent_config: AgentConfig,
    interpreter: Option<Arc<InterpreterSandbox>>,
}

impl<A: Adapter + 'static> Engine<A> {
    /// Start building an engine around a concrete adapter.
    pub fn builder(adapter: A) -> EngineBuilder<A> {
        EngineBuilder::new(adapter)
    }

    /// The long-lived tool registry backing this engine's orchestrator.
    pub fn tools(&self) -> &ToolRegistry {
        self.orchestrator.tools()
    }

    /// The session pool backing this engine's `FINAL_VAR` resolution.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run one Agent Runner task to completion, optionally bound to a
    /// persistent interpreter session by id.
    pub async fn run(
        &self,
        task: impl Into<String>,
        session_id: Option<&SessionId>,
        cancellation: &CancellationToken,
    ) -> AgentResult {
        let session = match session_id {
            Some(id) => Some(RunSession { id: id.clone(), handle: self.sessions.get_or_create(id).await }),
            None => None,
        };
        let mut runner = AgentRunner::new(Arc::clone(&self.orchestrator), self.agent_config.clone());
        if let Some(sandbox) = &self.interpreter {
            runner = runner.with_interpreter(Arc::clone(sandbox));
        }
        runner.run(task, session, cancellation).await
    }

    /// Spawn a background task that sweeps expired sessions on a fixed
    /// cadence until the returned handle is dropped or aborted.
    pub fn spawn_session_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sessions.sweep().await;
            }
        })
    }
}

/// Builds an [`Engine`] from an adapter, a set of registered tools, a
/// trajectory sink, and the budget/agent configuration to run with.
pub struct EngineBuilder<A: Adapter + 'static> {
    adapter: A,
    tools: ToolRegistry,
    trajectory: Arc<dyn TrajectorySink>,
    orchestrator_config: OrchestratorConfig,
    agent_config: AgentConfig,
    session_capacity: usize,
    session_ttl: Duration,
    interpreter: Option<Arc<InterpreterSandbox>>,
    context: Option<(Arc<dyn ContextStrategy>, usize)>,
}

impl<A: Adapter + 'static> EngineBuilder<A> {
    /// Start from an adapter and sane defaults: an empty tool registry, an
    /// in-memory trajectory sink, and default budgets.
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            tools: ToolRegistry::new(),
            trajectory: Arc::new(InMemorySink::new()),
            orchestrator_config: OrchestratorConfig::default(),
            agent_config: AgentConfig::default(),
            session_capacity: 256,
            session_ttl: Duration::from_secs(3600),
            interpreter: None,
            context: None,
        }
    }

    /// Register a tool to be available on every completion this engine runs.
    pub fn with_tool(mut self, tool: Arc<dyn ToolDyn>) -> Result<Self, ToolError> {
        self.tools.register(tool)?;
        Ok(self)
    }

    /// Replace the trajectory sink (defaults to an in-memory ring).
    pub fn with_trajectory_sink(mut self, sink: Arc<dyn TrajectorySink>) -> Self {
        self.trajectory = sink;
        self
    }

    /// Override the recursive completion loop's orchestrator-level config.
    pub fn with_orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator_config = config;
        self
    }

    /// Override the Agent Runner's iteration-level config.
    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    /// Override the interpreter session pool's capacity and TTL.
    pub fn with_session_pool(mut self, capacity: usize, ttl: Duration) -> Self {
        self.session_capacity = capacity;
        self.session_ttl = ttl;
        self
    }

    /// Attach an interpreter sandbox, making the `interpreter` tool
    /// available to any run that also carries a session.
    pub fn with_interpreter(mut self, sandbox: InterpreterSandbox) -> Self {
        self.interpreter = Some(Arc::new(sandbox));
        self
    }

    /// Compact the message list once its estimated token count passes
    /// `token_limit`, so a long tool-heavy run doesn't overrun the adapter's
    /// context window before the token budget would otherwise catch it.
    pub fn with_context_compaction(mut self, strategy: Arc<dyn ContextStrategy>, token_limit: usize) -> Self {
        self.context = Some((strategy, token_limit));
        self
    }

    /// Assemble the engine.
    pub fn build(self) -> Engine<A> {
        let mut orchestrator = Orchestrator::new(self.adapter, self.tools, self.trajectory, self.orchestrator_config);
        if let Some((strategy, token_limit)) = self.context {
            orchestrator = orchestrator.with_context_compaction(strategy, token_limit);
        }
        Engine {
            orchestrator: Arc::new(orchestrator),
            sessions: Arc::new(SessionManager::new(self.session_capacity, self.session_ttl)),
            agent_config: self.agent_config,
            interpreter: self.interpreter,
        }
    }
}
