#![deny(missing_docs)]
//! The per-completion Budget Ledger.
//!
//! A `BudgetLedger` is owned by exactly one Orchestrator invocation and is
//! touched only by that task — no locks, no `Arc`. When a sub-completion
//! runs, the parent derives a fresh ledger for it (see [`BudgetLedger::derive_sub_ledger`])
//! and charges the sub-ledger's final consumption back onto itself
//! ([`BudgetLedger::absorb`]) once the sub-call returns.

use rce_core::BudgetViolation;
use rust_decimal::Decimal;
use std::time::{Duration, Instant};

/// Construction options for a top-level [`BudgetLedger`].
///
/// Mirrors the "Configuration surface" table: every field here is a budget,
/// not a policy knob.
#[derive(Debug, Clone)]
pub struct BudgetOptions {
    /// Cap on recursion depth.
    pub max_depth: u32,
    /// Max combined input+output tokens.
    pub token_budget: u64,
    /// Max estimated cost.
    pub cost_budget: Decimal,
    /// Max tool-call invocations.
    pub tool_budget: u32,
    /// Wallclock deadline from ledger creation.
    pub timeout: Duration,
}

impl Default for BudgetOptions {
    fn default() -> Self {
        Self {
            max_depth: 5,
            token_budget: 100_000,
            cost_budget: Decimal::new(1000, 2), // $10.00
            tool_budget: 100,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Thread-confined accountant for one Orchestrator invocation (or sub-completion).
///
/// Consumed counters are monotone-nondecreasing; `remaining_*` values are
/// always derived from `budget - consumed`, never stored directly.
#[derive(Debug)]
pub struct BudgetLedger {
    depth: u32,
    max_depth: u32,
    token_budget: u64,
    consumed_tokens: u64,
    cost_budget: Decimal,
    consumed_cost: Decimal,
    tool_budget: u32,
    consumed_tool_calls: u32,
    deadline: Instant,
    timeout: Duration,
}

impl BudgetLedger {
    /// Create a root ledger (depth 0) from top-level options.
    pub fn new(options: BudgetOptions) -> Self {
        Self {
            depth: 0,
            max_depth: options.max_depth,
            token_budget: options.token_budget,
            consumed_tokens: 0,
            cost_budget: options.cost_budget,
            consumed_cost: Decimal::ZERO,
            tool_budget: options.tool_budget,
            consumed_tool_calls: 0,
            deadline: Instant::now() + options.timeout,
            timeout: options.timeout,
        }
    }

    /// Current recursion depth of the completion this ledger serves.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Record tokens and cost consumed by one Adapter call.
    pub fn charge(&mut self, input_tokens: u64, output_tokens: u64, cost: Decimal) {
        self.consumed_tokens = self.consumed_tokens.saturating_add(input_tokens + output_tokens);
        self.consumed_cost += cost;
    }

    /// Record one tool-call invocation.
    pub fn charge_tool_call(&mut self) {
        self.consumed_tool_calls = self.consumed_tool_calls.saturating_add(1);
    }

    /// Pre-call check: is this ledger still within all five budgets?
    ///
    /// Checks run *before* the next call, so a completion can still overshoot
    /// by the size of its own last call — the effective ceiling is
    /// `token_budget + last_call_overshoot`, not a hard cap.
    pub fn check(&self) -> Result<(), BudgetViolation> {
        if self.depth > self.max_depth {
            return Err(BudgetViolation::DepthExceeded {
                max_depth: self.max_depth,
                attempted: self.depth,
            });
        }
        if self.consumed_tokens >= self.token_budget {
            return Err(BudgetViolation::TokenExhausted {
                budget: self.token_budget,
                consumed: self.consumed_tokens,
            });
        }
        if self.consumed_cost >= self.cost_budget {
            return Err(BudgetViolation::CostExhausted {
                budget: self.cost_budget,
                consumed: self.consumed_cost,
            });
        }
        if self.consumed_tool_calls >= self.tool_budget {
            return Err(BudgetViolation::ToolExhausted {
                budget: self.tool_budget,
                consumed: self.consumed_tool_calls,
            });
        }
        if Instant::now() >= self.deadline {
            return Err(BudgetViolation::DeadlineReached {
                timeout_seconds: self.timeout.as_secs(),
            });
        }
        Ok(())
    }

    /// A read-only snapshot of remaining budget.
    pub fn state(&self) -> rce_core::BudgetState {
        rce_core::BudgetState {
            remaining_tokens: self.token_budget.saturating_sub(self.consumed_tokens),
            remaining_cost: (self.cost_budget - self.consumed_cost).max(Decimal::ZERO),
            remaining_tool_calls: self.tool_budget.saturating_sub(self.consumed_tool_calls),
            remaining_wallclock_ms: self
                .deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            remaining_depth: self.max_depth.saturating_sub(self.depth),
        }
    }

    /// Tokens consumed so far.
    pub fn consumed_tokens(&self) -> u64 {
        self.consumed_tokens
    }

    /// Cost consumed so far.
    pub fn consumed_cost(&self) -> Decimal {
        self.consumed_cost
    }

    /// Tool calls consumed so far.
    pub fn consumed_tool_calls(&self) -> u32 {
        self.consumed_tool_calls
    }

    /// Derive a budget for a sub-completion entered at `depth + 1`.
    ///
    /// `requested_tokens` is the caller-requested cap (from `sub_complete`'s
    /// `max_tokens` argument); the actual sub-budget is
    /// `min(requested, remaining_tokens * inheritance_factor)`.
    /// Cost and tool-call caps inherit proportionally by the same factor.
    /// The wallclock deadline is **shared**, not re-derived — one global
    /// deadline applies across the whole recursion tree.
    pub fn derive_sub_ledger(&self, requested_tokens: u64, inheritance_factor: f64) -> Self {
        let state = self.state();
        let factor = inheritance_factor.clamp(0.0, 1.0);
        let sub_tokens = requested_tokens.min(
            (state.remaining_tokens as f64 * factor) as u64,
        );
        let sub_cost = state.remaining_cost * Decimal::try_from(factor).unwrap_or(Decimal::ZERO);
        let sub_tools = ((state.remaining_tool_calls as f64) * factor) as u32;

        Self {
            depth: self.depth + 1,
            max_depth: self.max_depth,
            token_budget: sub_tokens,
            consumed_tokens: 0,
            cost_budget: sub_cost,
            consumed_cost: Decimal::ZERO,
            tool_budget: sub_tools.max(1),
            consumed_tool_calls: 0,
            deadline: self.deadline,
            timeout: self.timeout,
        }
    }

    /// Charge a completed sub-ledger's consumption back onto this (parent) ledger.
    pub fn absorb(&mut self, sub: &BudgetLedger) {
        self.consumed_tokens = self.consumed_tokens.saturating_add(sub.consumed_tokens);
        self.consumed_cost += sub.consumed_cost;
        self.consumed_tool_calls = self.consumed_tool_calls.saturating_add(sub.consumed_tool_calls);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> BudgetOptions {
        BudgetOptions {
            max_depth: 2,
            token_budget: 1000,
            cost_budget: Decimal::new(100, 2),
            tool_budget: 5,
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn fresh_ledger_passes_check() {
        let ledger = BudgetLedger::new(opts());
        assert!(ledger.check().is_ok());
    }

    #[test]
    fn token_exhaustion_detected() {
        let mut ledger = BudgetLedger::new(opts());
        ledger.charge(600, 0, Decimal::ZERO);
        assert!(ledger.check().is_ok());
        ledger.charge(600, 0, Decimal::ZERO);
        let err = ledger.check().unwrap_err();
        assert_eq!(err.kind(), "token_exhausted");
    }

    #[test]
    fn tool_exhaustion_detected() {
        let mut ledger = BudgetLedger::new(opts());
        for _ in 0..5 {
            ledger.charge_tool_call();
        }
        assert_eq!(ledger.check().unwrap_err().kind(), "tool_exhausted");
    }

    #[test]
    fn cost_exhaustion_detected() {
        let mut ledger = BudgetLedger::new(opts());
        ledger.charge(0, 0, Decimal::new(100, 2));
        assert_eq!(ledger.check().unwrap_err().kind(), "cost_exhausted");
    }

    #[test]
    fn depth_exceeded_detected() {
        let mut ledger = BudgetLedger::new(opts());
        ledger.depth = 3;
        assert_eq!(ledger.check().unwrap_err().kind(), "depth_exceeded");
    }

    #[test]
    fn deadline_reached_detected() {
        let mut ledger = BudgetLedger::new(BudgetOptions {
            timeout: Duration::from_millis(0),
            ..opts()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ledger.check().unwrap_err().kind(), "deadline_reached");
    }

    #[test]
    fn sub_ledger_inherits_half_by_default() {
        let ledger = BudgetLedger::new(opts());
        let sub = ledger.derive_sub_ledger(10_000, 0.5);
        assert_eq!(sub.depth(), 1);
        assert_eq!(sub.token_budget, 500);
    }

    #[test]
    fn sub_ledger_respects_requested_cap_below_inherited_share() {
        let ledger = BudgetLedger::new(opts());
        let sub = ledger.derive_sub_ledger(100, 0.5);
        assert_eq!(sub.token_budget, 100);
    }

    #[test]
    fn absorb_merges_sub_consumption_into_parent() {
        let mut ledger = BudgetLedger::new(opts());
        let mut sub = ledger.derive_sub_ledger(500, 0.5);
        sub.charge(100, 50, Decimal::new(10, 2));
        sub.charge_tool_call();
        ledger.absorb(&sub);
        assert_eq!(ledger.consumed_tokens(), 150);
        assert_eq!(ledger.consumed_tool_calls(), 1);
        assert_eq!(ledger.consumed_cost(), Decimal::new(10, 2));
    }

    #[test]
    fn depth_cap_exceeded_at_max_depth_plus_one() {
        let ledger = BudgetLedger::new(BudgetOptions { max_depth: 1, ..opts() });
        let sub = ledger.derive_sub_ledger(10, 1.0);
        assert!(sub.check().is_ok());
        let grandchild = sub.derive_sub_ledger(10, 1.0);
        assert_eq!(grandchild.check().unwrap_err().kind(), "depth_exceeded");
    }

    proptest::proptest! {
        #[test]
        fn charge_never_panics(input in 0u64..1_000_000, output in 0u64..1_000_000) {
            let mut ledger = BudgetLedger::new(opts());
            ledger.charge(input, output, Decimal::ZERO);
            let _ = ledger.check();
        }
    }
}
