//! Agent harness and the built-in Quorum agents.
//!
//! [`harness`] owns the run lifecycle: connect, execute, audit, disconnect.
//! Agents implement the [`Agent`] trait and receive an [`AgentContext`]
//! giving them the memory substrate and the configured inference driver.

pub mod closer;
pub mod collector;
pub mod harness;

pub use closer::CloserAgent;
pub use collector::CollectorAgent;
pub use harness::{Agent, AgentContext, Harness};
