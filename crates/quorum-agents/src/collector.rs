//! The Collector: data-ingestion agent.
//!
//! Takes queued raw items (emails, files, web pages, notes), asks the
//! inference backend to normalize each into a titled document, stores the
//! document with its embedding, and chunks anything too large to embed
//! whole. A normalization failure falls back to heuristics; a storage
//! failure on one item never aborts the batch.

use crate::closer::strip_code_fences;
use crate::harness::{Agent, AgentContext};
use async_trait::async_trait;
use quorum_memory::substrate::ChunkInput;
use quorum_types::record::Metadata;
use quorum_types::QuorumResult;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Max characters of raw content handed to the normalization model.
const MAX_LLM_INPUT: usize = 15_000;

/// Documents longer than this are chunked for embedding.
pub const DEFAULT_CHUNK_SIZE: usize = 3_000;

/// Max characters of a heuristically-derived title.
const MAX_TITLE_LEN: usize = 120;

const SYSTEM_PROMPT: &str = "You normalize raw captured content into a document record. \
Given the raw content and its source type, respond with JSON only:\n\
{\"title\": \"...\", \"doc_type\": \"...\", \"tags\": [\"...\"]}\n\
The title is short and specific. The doc_type is a lowercase snake_case \
category such as email, meeting_notes, article, or reference.";

/// One raw item waiting for ingestion.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub source_type: String,
    pub raw_content: String,
    pub metadata: Metadata,
}

/// Normalized shape returned by the model.
#[derive(Debug, Deserialize)]
struct NormalizedDoc {
    title: String,
    doc_type: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Split content into chunks of roughly `target` characters, breaking on
/// paragraph boundaries where possible. Paragraphs larger than the target
/// become their own oversized chunk rather than being split mid-sentence.
pub fn chunk_content(content: &str, target: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in content.split("\n\n") {
        if paragraph.trim().is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() + 2 > target {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Heuristic normalization when the model's answer is unusable: title from
/// metadata (subject, filename, url) or the first line, doc_type from the
/// source type.
fn fallback_normalize(item: &QueueItem) -> NormalizedDoc {
    let from_metadata = ["subject", "filename", "url"]
        .iter()
        .find_map(|key| item.metadata.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string);
    let title = from_metadata.unwrap_or_else(|| {
        let first_line = item.raw_content.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            "Untitled capture".to_string()
        } else {
            truncate_chars(first_line, MAX_TITLE_LEN).to_string()
        }
    });
    NormalizedDoc {
        title,
        doc_type: item.source_type.clone(),
        tags: Vec::new(),
    }
}

/// The data-ingestion agent. Items are queued before the run starts.
pub struct CollectorAgent {
    queue: Vec<QueueItem>,
    chunk_size: usize,
}

impl Default for CollectorAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorAgent {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn queue_item(&mut self, source_type: &str, raw_content: &str, metadata: Metadata) {
        self.queue.push(QueueItem {
            source_type: source_type.to_string(),
            raw_content: raw_content.to_string(),
            metadata,
        });
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    async fn normalize(&self, ctx: &AgentContext, item: &QueueItem) -> NormalizedDoc {
        let prompt = format!(
            "Source type: {}\n\nRaw content:\n{}",
            item.source_type,
            truncate_chars(&item.raw_content, MAX_LLM_INPUT)
        );
        match ctx.llm.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(raw) => match serde_json::from_str(strip_code_fences(&raw)) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "Undecodable normalization, using fallback");
                    fallback_normalize(item)
                }
            },
            Err(e) => {
                warn!(error = %e, "Normalization call failed, using fallback");
                fallback_normalize(item)
            }
        }
    }

    async fn ingest(&self, ctx: &AgentContext, item: &QueueItem) -> QuorumResult<()> {
        let normalized = self.normalize(ctx, item).await;
        let doc_id = ctx
            .memory
            .store_document(
                self.name(),
                &normalized.doc_type,
                &normalized.title,
                &item.raw_content,
                item.metadata.clone(),
                normalized.tags,
            )
            .await?;

        if item.raw_content.len() > self.chunk_size {
            let chunks: Vec<ChunkInput> = chunk_content(&item.raw_content, self.chunk_size)
                .into_iter()
                .map(|content| ChunkInput {
                    content,
                    metadata: Metadata::new(),
                })
                .collect();
            let stored = ctx.memory.store_chunks(doc_id, &chunks).await?;
            debug!(%doc_id, chunks = stored, "Chunked oversized document");
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for CollectorAgent {
    fn name(&self) -> &str {
        "collector"
    }

    async fn run(&mut self, ctx: &AgentContext) -> QuorumResult<String> {
        let items = std::mem::take(&mut self.queue);
        let total = items.len();
        let mut failures = 0;

        for item in &items {
            if let Err(e) = self.ingest(ctx, item).await {
                warn!(source_type = %item.source_type, error = %e, "Ingestion failed");
                failures += 1;
            }
        }

        info!(total, failures, "Ingestion batch finished");
        Ok(format!("Ingested {} items, {failures} failures.", total - failures))
    }
}
