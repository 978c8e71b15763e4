use crate::domain::DomainName;
use crate::model::{Chunk, ChunkId, Memory, MemoryId, VectorEntry, VectorHit};
use crate::{EmbeddingError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Durable record of memories and their chunks.
///
/// The coordinator is the only writer. Implementations must keep each
/// memory's chunk indices contiguous from 0.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a memory and all of its chunks in one transaction.
    async fn insert_memory(&self, memory: &Memory, chunks: &[Chunk]) -> StoreResult<()>;

    /// Replace content, row fields and the whole chunk set of an existing
    /// memory atomically. Returns the ids of the chunks that were removed.
    ///
    /// `memory.revision` must be exactly one past the stored revision;
    /// otherwise nothing is written and `Conflict` is returned.
    async fn replace_content(&self, memory: &Memory, chunks: &[Chunk])
        -> StoreResult<Vec<ChunkId>>;

    /// Update row fields (importance, attributes, timestamps) in place without
    /// touching chunks.
    async fn update_memory(&self, memory: &Memory) -> StoreResult<()>;

    async fn get_memory(&self, domain: &DomainName, id: &MemoryId)
        -> StoreResult<Option<Memory>>;

    async fn get_memories(&self, domain: &DomainName, ids: &[MemoryId])
        -> StoreResult<Vec<Memory>>;

    /// Chunks of one memory ordered by `chunk_index`.
    async fn chunks_for(&self, domain: &DomainName, id: &MemoryId) -> StoreResult<Vec<Chunk>>;

    /// Chunks by id; unknown ids are skipped.
    async fn get_chunks(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<Vec<Chunk>>;

    /// Case-insensitive content match, newest first.
    async fn lexical_search(
        &self,
        domain: &DomainName,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Memory>>;

    async fn list_recent(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Memory>>;

    async fn mark_indexed(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<()>;

    /// Chunks whose vector has not been written yet.
    async fn pending_chunks(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Chunk>>;

    async fn chunk_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>>;

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Chunk id to embedding mapping with cosine nearest-neighbour search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for a chunk. Idempotent.
    async fn upsert(&self, domain: &DomainName, entry: VectorEntry) -> StoreResult<()>;

    /// Delete a vector. No-op when absent.
    async fn remove(&self, domain: &DomainName, chunk_id: &ChunkId) -> StoreResult<()>;

    /// Up to `k` hits by descending similarity, ties by newest `updated_at`.
    /// An empty or unknown partition yields an empty list.
    async fn search(
        &self,
        domain: &DomainName,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorHit>>;

    async fn entry_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>>;

    /// Re-stamp every vector of `memory_id` with the owner's new `updated_at`
    /// so tie-breaks inside `search` follow the live row. Indexes that read
    /// the owner's timestamp at query time keep the default no-op.
    async fn touch(
        &self,
        _domain: &DomainName,
        _memory_id: &MemoryId,
        _updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn upsert_many(&self, domain: &DomainName, entries: Vec<VectorEntry>) -> StoreResult<()> {
        for entry in entries {
            self.upsert(domain, entry).await?;
        }
        Ok(())
    }

    async fn remove_many(&self, domain: &DomainName, chunk_ids: &[ChunkId]) -> StoreResult<()> {
        for chunk_id in chunk_ids {
            self.remove(domain, chunk_id).await?;
        }
        Ok(())
    }

    /// Flush to durable storage.
    async fn persist(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Known namespaces and their provisioning.
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    /// Validate `name` and create its partitions if absent.
    async fn ensure(&self, name: &str) -> StoreResult<DomainName>;

    /// Validate `name` and return it only if it already exists.
    async fn resolve(&self, name: &str) -> StoreResult<Option<DomainName>>;

    async fn list(&self) -> StoreResult<Vec<DomainName>>;

    fn is_multi_domain(&self) -> bool;
}

/// Text to fixed-length vector. One attempt per call, no retries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn model(&self) -> &str;
}

/// The three storage ports a coordinator is built from.
#[derive(Clone)]
pub struct StoreBackend {
    pub metadata: Arc<dyn MetadataStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub domains: Arc<dyn DomainRegistry>,
}

impl StoreBackend {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        domains: Arc<dyn DomainRegistry>,
    ) -> Self {
        Self {
            metadata,
            vectors,
            domains,
        }
    }
}
