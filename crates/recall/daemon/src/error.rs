//! Error types for recalld

use recall_protocol_mcp::McpAdapterError;
use recall_store::StoreError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage could not be opened or closed
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Embedding service could not be set up
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Protocol adapter error
    #[error("Protocol error: {0}")]
    Protocol(#[from] McpAdapterError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
