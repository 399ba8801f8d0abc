//! Core types for the Quorum agent system.
//!
//! Every crate in the workspace builds on the records, error taxonomy, and
//! configuration struct defined here. Records mirror the persistent store
//! tables one-to-one; the [`record::RefType`] registry is the single source
//! of truth for the polymorphic `(ref_type, ref_id)` embedding keys.

pub mod config;
pub mod error;
pub mod record;

pub use config::QuorumConfig;
pub use error::{QuorumError, QuorumResult};
