//! Persistent store and memory substrate for the Quorum agent system.
//!
//! Three layers:
//! - [`migration`]: SQLite schema creation, versioned via `user_version`.
//! - [`store`]: typed insert/select/update accessors over the content
//!   tables, the embeddings table, and the agent-run audit log.
//! - [`substrate`]: the embedding-backed read/write layer agents use:
//!   semantic search plus write helpers that keep embeddings synchronized
//!   with content.

pub mod migration;
pub mod store;
pub mod substrate;

pub use store::{NewDocument, NewTask, Store};
pub use substrate::{ChunkInput, MemorySubstrate};
