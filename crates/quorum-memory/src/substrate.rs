//! The embedding-backed memory substrate.
//!
//! This is the layer agents talk to. Writes embed content and persist both
//! rows together; reads embed the query and rank every stored vector by
//! cosine distance, then hydrate the winners through the ref-type registry.

use crate::store::{NewDocument, NewTask, Store};
use quorum_providers::{cosine_similarity, EmbeddingDriver};
use quorum_types::record::{Metadata, RefType, SearchHit, TaskStatus};
use quorum_types::QuorumResult;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of hits returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// One chunk of a large document, pre-split by the caller.
#[derive(Debug, Clone)]
pub struct ChunkInput {
    pub content: String,
    pub metadata: Metadata,
}

/// Shared read/write layer over the store plus the configured embedder.
#[derive(Clone)]
pub struct MemorySubstrate {
    store: Store,
    embedder: Arc<dyn EmbeddingDriver + Send + Sync>,
}

impl MemorySubstrate {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingDriver + Send + Sync>) -> Self {
        Self { store, embedder }
    }

    /// Direct access to the typed store for non-embedded reads and writes.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Embed and store a document. The vector is computed before anything is
    /// written, then the document and its embedding commit in one
    /// transaction, so an embedding failure leaves no unsearchable row.
    pub async fn store_document(
        &self,
        source: &str,
        doc_type: &str,
        title: &str,
        content: &str,
        metadata: Metadata,
        tags: Vec<String>,
    ) -> QuorumResult<Uuid> {
        let vector = self.embedder.embed(content).await?;
        self.store.insert_document_with_embedding(
            &NewDocument {
                doc_type: doc_type.to_string(),
                source: source.to_string(),
                title: title.to_string(),
                content: content.to_string(),
                metadata,
                tags,
            },
            &vector,
            self.embedder.model_name(),
        )
    }

    /// Embed and store chunks of an existing document. Whitespace-only
    /// chunks are dropped; surviving chunks are re-indexed contiguously
    /// from zero. Returns the number stored.
    pub async fn store_chunks(
        &self,
        document_id: Uuid,
        chunks: &[ChunkInput],
    ) -> QuorumResult<usize> {
        let mut index: u32 = 0;
        for chunk in chunks {
            if chunk.content.trim().is_empty() {
                continue;
            }
            let vector = self.embedder.embed(&chunk.content).await?;
            self.store.insert_chunk_with_embedding(
                document_id,
                index,
                &chunk.content,
                &chunk.metadata,
                &vector,
                self.embedder.model_name(),
            )?;
            index += 1;
        }
        Ok(index as usize)
    }

    /// Append an event. Events are not embedded on write.
    pub fn store_event(
        &self,
        actor: &str,
        event_type: &str,
        title: &str,
        description: &str,
        ref_ids: &[Uuid],
        metadata: &Metadata,
    ) -> QuorumResult<Uuid> {
        self.store
            .insert_event(actor, event_type, title, description, ref_ids, metadata)
    }

    /// Create a task. Tasks are not embedded on write.
    pub fn create_task(&self, task: &NewTask) -> QuorumResult<Uuid> {
        self.store.insert_task(task)
    }

    /// Close or advance a task, recording the verification note.
    pub fn update_task_status(
        &self,
        id: Uuid,
        status: &TaskStatus,
        note: &str,
    ) -> QuorumResult<()> {
        self.store.update_task_status(id, status, note)
    }

    /// Semantic search: embed the query, rank every candidate vector by
    /// cosine distance, keep the closest `limit`, then hydrate. Embedding
    /// rows whose backing content has since been deleted are skipped
    /// silently, so a search never fails on a tombstone.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        ref_type: Option<RefType>,
    ) -> QuorumResult<Vec<SearchHit>> {
        let query_vector = self.embedder.embed(query).await?;
        let candidates = self.store.embedding_candidates(ref_type)?;

        let mut ranked: Vec<(RefType, Uuid, f32)> = candidates
            .into_iter()
            .map(|(rt, id, vector)| {
                let distance = 1.0 - cosine_similarity(&query_vector, &vector);
                (rt, id, distance)
            })
            .collect();
        ranked.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        // Hydration happens after the cut, so a large table costs one pass
        // over vectors plus at most `limit` row fetches.
        ranked.truncate(limit);

        let mut hits = Vec::with_capacity(ranked.len());
        for (rt, id, distance) in ranked {
            match self.store.fetch_content(rt, id)? {
                Some(content) => hits.push(SearchHit {
                    ref_type: rt,
                    ref_id: id,
                    score: 1.0 - distance,
                    content,
                }),
                None => {
                    warn!(ref_type = %rt, ref_id = %id, "Embedding row has no backing content, skipping");
                }
            }
        }
        debug!(query_len = query.len(), hits = hits.len(), "Semantic search");
        Ok(hits)
    }
}
