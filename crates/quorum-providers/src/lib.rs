//! Provider abstraction: interchangeable embedding and inference backends.
//!
//! Backend selection happens once at construction via the `create_*` factory
//! functions; an unknown backend name is a fatal configuration error. Calls
//! are synchronous request/response from the caller's point of view, with
//! fixed per-capability timeout ceilings and no automatic retry.

pub mod embedding;
pub mod inference;

pub use embedding::{
    cosine_similarity, create_embedding_driver, embedding_from_bytes, embedding_to_bytes,
    EmbeddingDriver, EMBED_DIMENSIONS, EMBED_INPUT_LIMIT,
};
pub use inference::{create_llm_driver, ChatTurn, LlmDriver};
