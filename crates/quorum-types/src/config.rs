//! Runtime configuration, built once at startup and passed by reference.
//!
//! There is no ambient configuration lookup anywhere else in the workspace:
//! the CLI constructs a [`QuorumConfig`] (from the environment or defaults)
//! and hands it to every component that needs one.

use std::path::PathBuf;

/// Configuration for store location and provider selection.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Embedding backend name: "ollama" or "openai".
    pub embedding_provider: String,
    /// Base URL of the Ollama server.
    pub ollama_host: String,
    /// Ollama embedding model name.
    pub ollama_embed_model: String,
    /// OpenAI API key (embeddings and inference).
    pub openai_api_key: String,
    /// Inference backend name: "ollama", "anthropic", or "openai".
    pub llm_provider: String,
    /// Inference model name.
    pub llm_model: String,
    /// Anthropic API key.
    pub anthropic_api_key: String,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding_provider: "ollama".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            ollama_embed_model: "mxbai-embed-large".to_string(),
            openai_api_key: String::new(),
            llm_provider: "ollama".to_string(),
            llm_model: "llama3.2".to_string(),
            anthropic_api_key: String::new(),
        }
    }
}

impl QuorumConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Called exactly once at process startup; components receive the result
    /// by reference and never read the environment themselves.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("QUORUM_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            embedding_provider: env_or("EMBEDDING_PROVIDER", defaults.embedding_provider),
            ollama_host: env_or("OLLAMA_HOST", defaults.ollama_host),
            ollama_embed_model: env_or("OLLAMA_EMBED_MODEL", defaults.ollama_embed_model),
            openai_api_key: env_or("OPENAI_API_KEY", defaults.openai_api_key),
            llm_provider: env_or("LLM_PROVIDER", defaults.llm_provider),
            llm_model: env_or("LLM_MODEL", defaults.llm_model),
            anthropic_api_key: env_or("ANTHROPIC_API_KEY", defaults.anthropic_api_key),
        }
    }
}

fn env_or(key: &str, fallback: String) -> String {
    std::env::var(key).unwrap_or(fallback)
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".quorum").join("quorum.db"))
        .unwrap_or_else(|| PathBuf::from("quorum.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuorumConfig::default();
        assert_eq!(config.embedding_provider, "ollama");
        assert_eq!(config.llm_provider, "ollama");
        assert!(config.db_path.to_string_lossy().ends_with("quorum.db"));
    }
}
