use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignbotError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Forge error: {0}")]
    ForgeError(#[from] ForgeError),
    #[error("Retries exhausted for {op} after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        source: ForgeError,
    },
    #[error("Cache codec error: {0}")]
    CodecError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Failures reported by a forge backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForgeError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl ForgeError {
    /// Rate limiting and timeouts are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::RateLimited(_) | ForgeError::Timeout(_))
    }
}
