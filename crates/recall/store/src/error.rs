use thiserror::Error;

/// Result type for engine operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Engine-level errors.
///
/// Embedding failures are reported through [`EmbeddingError`] and degrade to
/// lexical-only mode inside the coordinator instead of surfacing here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A concurrent writer replaced the memory first.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("vector index write failed: {0}")]
    IndexWriteFailure(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn stale_revision(memory: &crate::model::MemoryId, revision: u32) -> Self {
        Self::Conflict(format!(
            "memory {memory} changed while revision {revision} was being written"
        ))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure of a single embedding attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding call timed out after {0} ms")]
    Timeout(u64),

    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("embedding service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding service returned a degenerate vector")]
    Degenerate,

    #[error("embedding is disabled")]
    Disabled,
}
