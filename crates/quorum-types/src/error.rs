//! Shared error types for the Quorum system.

use thiserror::Error;

/// Top-level error type for the Quorum system.
#[derive(Error, Debug)]
pub enum QuorumError {
    /// An unknown provider name or otherwise invalid configuration.
    /// Fatal: aborts the run at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transport-level failure calling an embedding or inference backend.
    #[error("Provider error ({provider}, status {status}): {message}")]
    Provider {
        /// The backend that failed.
        provider: String,
        /// HTTP status, or 0 when the request never completed.
        status: u16,
        /// Response body or transport error text.
        message: String,
    },

    /// A provider call exceeded its fixed timeout ceiling.
    #[error("Provider timeout ({provider}) after {seconds}s")]
    ProviderTimeout {
        /// The backend that timed out.
        provider: String,
        /// The timeout ceiling that was exceeded.
        seconds: u64,
    },

    /// Malformed structured output from the inference provider.
    /// Recovered locally with a safe fallback, never fatal.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A persistent store read or write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with QuorumError.
pub type QuorumResult<T> = Result<T, QuorumError>;
