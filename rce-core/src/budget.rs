//! Shared budget vocabulary: violation kinds and the read-only [`BudgetState`] snapshot.
//!
//! The mutable ledger itself lives in `rce-budget`; this crate only owns the
//! vocabulary so the Orchestrator, Agent Runner, and Sub-Completion Tools can
//! all speak about a violation without depending on the ledger's internals.

use serde::{Deserialize, Serialize};

/// Why a budget check failed.
///
/// Each variant corresponds one-to-one to a row of the fail-kind table: the
/// breached counter plus its cap and current value, so the caller can report
/// exactly what was exceeded.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetViolation {
    /// Recursion depth would exceed `max_depth`.
    DepthExceeded {
        /// The configured maximum depth.
        max_depth: u32,
        /// The depth that was attempted.
        attempted: u32,
    },
    /// Combined input+output tokens would exceed `token_budget`.
    TokenExhausted {
        /// The configured token budget.
        budget: u64,
        /// Tokens already consumed.
        consumed: u64,
    },
    /// Estimated cost would exceed `cost_budget`.
    CostExhausted {
        /// The configured cost budget.
        budget: rust_decimal::Decimal,
        /// Cost already consumed.
        consumed: rust_decimal::Decimal,
    },
    /// Tool-call count would exceed `tool_budget`.
    ToolExhausted {
        /// The configured tool-call budget.
        budget: u32,
        /// Tool calls already made.
        consumed: u32,
    },
    /// The wallclock deadline has passed.
    DeadlineReached {
        /// The configured timeout in seconds.
        timeout_seconds: u64,
    },
}

impl BudgetViolation {
    /// A short machine-stable tag identifying which budget failed.
    pub fn kind(&self) -> &'static str {
        match self {
            BudgetViolation::DepthExceeded { .. } => "depth_exceeded",
            BudgetViolation::TokenExhausted { .. } => "token_exhausted",
            BudgetViolation::CostExhausted { .. } => "cost_exhausted",
            BudgetViolation::ToolExhausted { .. } => "tool_exhausted",
            BudgetViolation::DeadlineReached { .. } => "deadline_reached",
        }
    }
}

impl std::fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetViolation::DepthExceeded { max_depth, attempted } => {
                write!(f, "depth {attempted} would exceed max_depth {max_depth}")
            }
            BudgetViolation::TokenExhausted { budget, consumed } => {
                write!(f, "token budget {budget} exhausted ({consumed} consumed)")
            }
            BudgetViolation::CostExhausted { budget, consumed } => {
                write!(f, "cost budget {budget} exhausted ({consumed} consumed)")
            }
            BudgetViolation::ToolExhausted { budget, consumed } => {
                write!(f, "tool-call budget {budget} exhausted ({consumed} consumed)")
            }
            BudgetViolation::DeadlineReached { timeout_seconds } => {
                write!(f, "deadline reached (timeout_seconds={timeout_seconds})")
            }
        }
    }
}

/// Read-only snapshot of what remains in a [`crate::budget`]-owning ledger.
///
/// Consumed counters are monotone-nondecreasing; this struct holds the
/// *derived remaining* amounts, recomputed on each read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// Tokens remaining (combined input+output).
    pub remaining_tokens: u64,
    /// Cost remaining.
    pub remaining_cost: rust_decimal::Decimal,
    /// Tool calls remaining.
    pub remaining_tool_calls: u32,
    /// Milliseconds until the wallclock deadline (0 if already passed).
    pub remaining_wallclock_ms: u64,
    /// Depth remaining before `max_depth` is hit.
    pub remaining_depth: u32,
}
