//! Advisory error types

use thiserror::Error;

/// Advisory error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Evidence provider error
    #[error("Evidence error: {0}")]
    Evidence(String),

    /// Synthesis (LLM backend) error
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Packet cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Prefetch queue error
    #[error("Prefetch error: {0}")]
    Prefetch(String),

    /// Outcome linking error
    #[error("Outcome error: {0}")]
    Outcome(String),

    /// Persisted state error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for advisory operations
pub type Result<T> = std::result::Result<T, Error>;
