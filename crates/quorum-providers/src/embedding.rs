//! Embedding drivers for vector-based semantic memory.
//!
//! Two backends: Ollama (`/api/embed`) and OpenAI (`/v1/embeddings`). Both
//! produce fixed 1024-dimension vectors so rows embedded by either backend
//! rank against each other in the same store.

use async_trait::async_trait;
use quorum_types::{QuorumConfig, QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Fixed dimensionality of all stored embedding vectors.
pub const EMBED_DIMENSIONS: usize = 1024;

/// Character budget for content embedding; longer input is truncated before
/// the request is sent (model context-window safety).
pub const EMBED_INPUT_LIMIT: usize = 8000;

/// Fixed timeout ceiling for embedding calls.
const EMBED_TIMEOUT_SECS: u64 = 30;

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingDriver: Send + Sync {
    /// Compute the embedding vector for `text`.
    ///
    /// Input beyond [`EMBED_INPUT_LIMIT`] characters is truncated before
    /// sending. Transport failures and non-success statuses surface as
    /// [`QuorumError::Provider`]; exceeding the timeout ceiling surfaces as
    /// [`QuorumError::ProviderTimeout`]. Callers decide whether to retry.
    async fn embed(&self, text: &str) -> QuorumResult<Vec<f32>>;

    /// The model name recorded alongside stored embeddings.
    fn model_name(&self) -> &str;

    /// Dimensionality of vectors produced by this driver.
    fn dimensions(&self) -> usize {
        EMBED_DIMENSIONS
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Map a reqwest transport error into the provider error taxonomy.
pub(crate) fn transport_error(provider: &str, seconds: u64, err: reqwest::Error) -> QuorumError {
    if err.is_timeout() {
        QuorumError::ProviderTimeout {
            provider: provider.to_string(),
            seconds,
        }
    } else {
        QuorumError::Provider {
            provider: provider.to_string(),
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }
}

/// Build a provider error from a non-success HTTP response.
pub(crate) async fn status_error(provider: &str, resp: reqwest::Response) -> QuorumError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    QuorumError::Provider {
        provider: provider.to_string(),
        status,
        message,
    }
}

/// Embedding driver for a local Ollama server.
pub struct OllamaEmbeddingDriver {
    host: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingDriver {
    pub fn new(host: &str, model: &str) -> QuorumResult<Self> {
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: embed_client()?,
        })
    }
}

#[async_trait]
impl EmbeddingDriver for OllamaEmbeddingDriver {
    async fn embed(&self, text: &str) -> QuorumResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.host);
        let body = OllamaEmbedRequest {
            model: &self.model,
            input: truncate_chars(text, EMBED_INPUT_LIMIT),
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("ollama", EMBED_TIMEOUT_SECS, e))?;

        if !resp.status().is_success() {
            return Err(status_error("ollama", resp).await);
        }

        let data: OllamaEmbedResponse = resp.json().await.map_err(|e| QuorumError::Provider {
            provider: "ollama".to_string(),
            status: 200,
            message: format!("invalid embed response body: {e}"),
        })?;

        let vector = data
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| QuorumError::Provider {
                provider: "ollama".to_string(),
                status: 200,
                message: "empty embeddings array".to_string(),
            })?;
        debug!(dims = vector.len(), "Embedded text via ollama");
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Embedding driver for the OpenAI embeddings API.
pub struct OpenAiEmbeddingDriver {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingDriver {
    pub fn new(api_key: &str) -> QuorumResult<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model: "text-embedding-3-small".to_string(),
            client: embed_client()?,
        })
    }
}

#[async_trait]
impl EmbeddingDriver for OpenAiEmbeddingDriver {
    async fn embed(&self, text: &str) -> QuorumResult<Vec<f32>> {
        let body = OpenAiEmbedRequest {
            model: &self.model,
            input: truncate_chars(text, EMBED_INPUT_LIMIT),
            dimensions: EMBED_DIMENSIONS,
        };

        let resp = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("openai", EMBED_TIMEOUT_SECS, e))?;

        if !resp.status().is_success() {
            return Err(status_error("openai", resp).await);
        }

        let data: OpenAiEmbedResponse = resp.json().await.map_err(|e| QuorumError::Provider {
            provider: "openai".to_string(),
            status: 200,
            message: format!("invalid embed response body: {e}"),
        })?;

        data.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| QuorumError::Provider {
                provider: "openai".to_string(),
                status: 200,
                message: "empty data array".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn embed_client() -> QuorumResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
        .build()
        .map_err(|e| QuorumError::Config(format!("failed to build HTTP client: {e}")))
}

/// Create an embedding driver from config. Selection happens once here;
/// an unknown backend name aborts the run.
pub fn create_embedding_driver(
    config: &QuorumConfig,
) -> QuorumResult<Box<dyn EmbeddingDriver + Send + Sync>> {
    match config.embedding_provider.as_str() {
        "ollama" => Ok(Box::new(OllamaEmbeddingDriver::new(
            &config.ollama_host,
            &config.ollama_embed_model,
        )?)),
        "openai" => Ok(Box::new(OpenAiEmbeddingDriver::new(
            &config.openai_api_key,
        )?)),
        other => Err(QuorumError::Config(format!(
            "Unknown embedding provider: {other}"
        ))),
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1.0, 1.0] where 1.0 = identical direction.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an embedding vector to bytes (for SQLite BLOB storage).
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding vector from bytes.
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_ascii() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        // Truncation counts characters, not bytes, and never splits one.
        let text = "日本語テスト";
        assert_eq!(truncate_chars(text, 2), "日本");
        assert_eq!(truncate_chars(text, 100), text);
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let sim = cosine_similarity(&a, &a);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_length_mismatch() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_embedding_bytes_round_trip() {
        let embedding = vec![0.1, -0.5, 1.23456, 0.0];
        let recovered = embedding_from_bytes(&embedding_to_bytes(&embedding));
        assert_eq!(embedding, recovered);
    }

    #[test]
    fn test_create_embedding_driver_ollama() {
        let config = QuorumConfig::default();
        let driver = create_embedding_driver(&config).unwrap();
        assert_eq!(driver.dimensions(), EMBED_DIMENSIONS);
        assert_eq!(driver.model_name(), "mxbai-embed-large");
    }

    #[test]
    fn test_create_embedding_driver_unknown() {
        let config = QuorumConfig {
            embedding_provider: "mystery".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_embedding_driver(&config),
            Err(QuorumError::Config(_))
        ));
    }
}
