#![deny(missing_docs)]
//! Shared vocabulary for the Recursive Completion Engine.
//!
//! Every other `rce-*` crate depends on this one for typed ids, the
//! conversation data model (`Message`/`ContentBlock`/`ToolCall`/`ToolResult`),
//! the duration wire type, and the budget-violation taxonomy. It has no
//! knowledge of tools, interpreters, or providers — just the nouns they all
//! share.

mod budget;
mod duration;
mod id;
mod message;

pub use budget::{BudgetState, BudgetViolation};
pub use duration::DurationMs;
pub use id::{CallId, SessionId, TrajectoryId};
pub use message::{Content, ContentBlock, Message, Role, ToolCall, ToolResult};
