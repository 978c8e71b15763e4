//! In-memory reference implementation of the storage ports.
//!
//! Deterministic and test-friendly. Nothing survives the process; use the
//! SQLite or Postgres backends for durable data.

use crate::domain::{DomainName, InMemoryDomainRegistry};
use crate::flat_index::FlatPartition;
use crate::model::{Chunk, ChunkId, Memory, MemoryId, VectorEntry, VectorHit};
use crate::traits::{MetadataStore, StoreBackend, VectorIndex};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Partition {
    memories: HashMap<MemoryId, Memory>,
    chunks: BTreeMap<ChunkId, Chunk>,
}

impl Partition {
    fn chunk_ids_of(&self, memory_id: &MemoryId) -> Vec<ChunkId> {
        self.chunks
            .values()
            .filter(|chunk| &chunk.memory_id == memory_id)
            .map(|chunk| chunk.chunk_id.clone())
            .collect()
    }
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    partitions: RwLock<HashMap<DomainName, Partition>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> StoreResult<std::sync::RwLockReadGuard<'_, HashMap<DomainName, Partition>>> {
        self.partitions
            .read()
            .map_err(|_| StoreError::Backend("metadata lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> StoreResult<std::sync::RwLockWriteGuard<'_, HashMap<DomainName, Partition>>> {
        self.partitions
            .write()
            .map_err(|_| StoreError::Backend("metadata lock poisoned".to_string()))
    }
}

fn newest_first(memories: &mut [Memory]) {
    memories.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert_memory(&self, memory: &Memory, chunks: &[Chunk]) -> StoreResult<()> {
        let mut guard = self.write()?;
        let partition = guard.entry(memory.domain.clone()).or_default();
        if partition.memories.contains_key(&memory.id) {
            return Err(StoreError::Backend(format!(
                "memory {} already exists",
                memory.id
            )));
        }
        partition.memories.insert(memory.id.clone(), memory.clone());
        for chunk in chunks {
            partition.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn replace_content(
        &self,
        memory: &Memory,
        chunks: &[Chunk],
    ) -> StoreResult<Vec<ChunkId>> {
        let mut guard = self.write()?;
        let partition = guard
            .get_mut(&memory.domain)
            .filter(|partition| partition.memories.contains_key(&memory.id))
            .ok_or_else(|| StoreError::not_found(format!("memory {}", memory.id)))?;
        let stored = partition
            .memories
            .get(&memory.id)
            .map(|m| m.revision)
            .unwrap_or_default();
        if stored.checked_add(1) != Some(memory.revision) {
            return Err(StoreError::stale_revision(&memory.id, memory.revision));
        }

        let removed = partition.chunk_ids_of(&memory.id);
        for chunk_id in &removed {
            partition.chunks.remove(chunk_id);
        }
        for chunk in chunks {
            partition.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        partition.memories.insert(memory.id.clone(), memory.clone());
        Ok(removed)
    }

    async fn update_memory(&self, memory: &Memory) -> StoreResult<()> {
        let mut guard = self.write()?;
        let slot = guard
            .get_mut(&memory.domain)
            .and_then(|partition| partition.memories.get_mut(&memory.id))
            .ok_or_else(|| StoreError::not_found(format!("memory {}", memory.id)))?;
        slot.importance = memory.importance;
        slot.attributes = memory.attributes.clone();
        slot.updated_at = memory.updated_at;
        Ok(())
    }

    async fn get_memory(
        &self,
        domain: &DomainName,
        id: &MemoryId,
    ) -> StoreResult<Option<Memory>> {
        let guard = self.read()?;
        Ok(guard
            .get(domain)
            .and_then(|partition| partition.memories.get(id))
            .cloned())
    }

    async fn get_memories(
        &self,
        domain: &DomainName,
        ids: &[MemoryId],
    ) -> StoreResult<Vec<Memory>> {
        let guard = self.read()?;
        let Some(partition) = guard.get(domain) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| partition.memories.get(id).cloned())
            .collect())
    }

    async fn chunks_for(&self, domain: &DomainName, id: &MemoryId) -> StoreResult<Vec<Chunk>> {
        let guard = self.read()?;
        let Some(partition) = guard.get(domain) else {
            return Ok(Vec::new());
        };
        let mut chunks: Vec<Chunk> = partition
            .chunks
            .values()
            .filter(|chunk| &chunk.memory_id == id)
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        Ok(chunks)
    }

    async fn get_chunks(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<Vec<Chunk>> {
        let guard = self.read()?;
        let Some(partition) = guard.get(domain) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| partition.chunks.get(id).cloned())
            .collect())
    }

    async fn lexical_search(
        &self,
        domain: &DomainName,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Memory>> {
        let needle = query.to_lowercase();
        let guard = self.read()?;
        let Some(partition) = guard.get(domain) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<Memory> = partition
            .memories
            .values()
            .filter(|memory| memory.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        newest_first(&mut matches);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn list_recent(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Memory>> {
        let guard = self.read()?;
        let Some(partition) = guard.get(domain) else {
            return Ok(Vec::new());
        };
        let mut memories: Vec<Memory> = partition.memories.values().cloned().collect();
        newest_first(&mut memories);
        memories.truncate(limit);
        Ok(memories)
    }

    async fn mark_indexed(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<()> {
        let mut guard = self.write()?;
        if let Some(partition) = guard.get_mut(domain) {
            for id in ids {
                if let Some(chunk) = partition.chunks.get_mut(id) {
                    chunk.indexed = true;
                }
            }
        }
        Ok(())
    }

    async fn pending_chunks(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Chunk>> {
        let guard = self.read()?;
        let Some(partition) = guard.get(domain) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .chunks
            .values()
            .filter(|chunk| !chunk.indexed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn chunk_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        let guard = self.read()?;
        Ok(guard
            .get(domain)
            .map(|partition| partition.chunks.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// In-memory exact cosine vector index.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    partitions: RwLock<HashMap<DomainName, FlatPartition>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, domain: &DomainName) -> usize {
        self.partitions
            .read()
            .map(|guard| guard.get(domain).map(FlatPartition::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, domain: &DomainName) -> bool {
        self.len(domain) == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, domain: &DomainName, entry: VectorEntry) -> StoreResult<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| StoreError::Backend("vector index lock poisoned".to_string()))?;
        guard.entry(domain.clone()).or_default().upsert(entry)
    }

    async fn remove(&self, domain: &DomainName, chunk_id: &ChunkId) -> StoreResult<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| StoreError::Backend("vector index lock poisoned".to_string()))?;
        if let Some(partition) = guard.get_mut(domain) {
            partition.remove(chunk_id);
        }
        Ok(())
    }

    async fn search(
        &self,
        domain: &DomainName,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorHit>> {
        let guard = self
            .partitions
            .read()
            .map_err(|_| StoreError::Backend("vector index lock poisoned".to_string()))?;
        match guard.get(domain) {
            Some(partition) => partition.search(query, k),
            None => Ok(Vec::new()),
        }
    }

    async fn entry_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        let guard = self
            .partitions
            .read()
            .map_err(|_| StoreError::Backend("vector index lock poisoned".to_string()))?;
        Ok(guard.get(domain).map(FlatPartition::ids).unwrap_or_default())
    }

    async fn touch(
        &self,
        domain: &DomainName,
        memory_id: &MemoryId,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| StoreError::Backend("vector index lock poisoned".to_string()))?;
        if let Some(partition) = guard.get_mut(domain) {
            partition.touch(memory_id, updated_at);
        }
        Ok(())
    }
}

/// Multi-domain backend held entirely in memory.
pub fn in_memory_backend() -> StoreBackend {
    StoreBackend::new(
        Arc::new(InMemoryMetadataStore::new()),
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(InMemoryDomainRegistry::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Map;

    fn memory(id: &str, content: &str, age_secs: i64) -> Memory {
        let at = Utc::now() - Duration::seconds(age_secs);
        Memory {
            id: MemoryId::new(id),
            domain: DomainName::default_domain(),
            content: content.to_string(),
            source: None,
            importance: 0.5,
            revision: 0,
            chunk_count: 1,
            attributes: Map::new(),
            created_at: at,
            updated_at: at,
        }
    }

    fn single_chunk(memory: &Memory) -> Vec<Chunk> {
        vec![Chunk {
            chunk_id: ChunkId::derive(&memory.id, memory.revision, 0),
            memory_id: memory.id.clone(),
            chunk_index: 0,
            text: memory.content.clone(),
            overlap: String::new(),
            indexed: false,
        }]
    }

    #[tokio::test]
    async fn lexical_search_is_case_insensitive_and_newest_first() {
        let store = InMemoryMetadataStore::new();
        let old = memory("mem_old", "I like Rust", 60);
        let new = memory("mem_new", "rust is fast", 1);
        let other = memory("mem_other", "python", 0);
        for m in [&old, &new, &other] {
            store.insert_memory(m, &single_chunk(m)).await.unwrap();
        }

        let hits = store
            .lexical_search(&DomainName::default_domain(), "RUST", 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mem_new", "mem_old"]);
    }

    #[tokio::test]
    async fn replace_content_swaps_chunk_set() {
        let store = InMemoryMetadataStore::new();
        let original = memory("mem_a", "old", 0);
        store
            .insert_memory(&original, &single_chunk(&original))
            .await
            .unwrap();

        let mut updated = original.clone();
        updated.content = "new".to_string();
        updated.revision = 1;
        let removed = store
            .replace_content(&updated, &single_chunk(&updated))
            .await
            .unwrap();
        assert_eq!(removed, vec![ChunkId::derive(&original.id, 0, 0)]);

        let domain = DomainName::default_domain();
        let chunks = store.chunks_for(&domain, &original.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "new");
        assert!(store.get_chunks(&domain, &removed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_content_rejects_stale_revision() {
        let store = InMemoryMetadataStore::new();
        let original = memory("mem_a", "old", 0);
        store
            .insert_memory(&original, &single_chunk(&original))
            .await
            .unwrap();

        let mut first = original.clone();
        first.content = "first".to_string();
        first.revision = 1;
        let mut second = original.clone();
        second.content = "second".to_string();
        second.revision = 1;

        store.replace_content(&first, &single_chunk(&first)).await.unwrap();
        let err = store
            .replace_content(&second, &single_chunk(&second))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let domain = DomainName::default_domain();
        let chunks = store.chunks_for(&domain, &original.id).await.unwrap();
        assert_eq!(chunks[0].text, "first");
    }

    #[tokio::test]
    async fn replace_content_of_unknown_memory_fails() {
        let store = InMemoryMetadataStore::new();
        let ghost = memory("mem_ghost", "x", 0);
        let err = store
            .replace_content(&ghost, &single_chunk(&ghost))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pending_chunks_clear_after_mark_indexed() {
        let store = InMemoryMetadataStore::new();
        let m = memory("mem_a", "text", 0);
        let chunks = single_chunk(&m);
        store.insert_memory(&m, &chunks).await.unwrap();
        let domain = DomainName::default_domain();
        assert_eq!(store.pending_chunks(&domain, 10).await.unwrap().len(), 1);
        store
            .mark_indexed(&domain, &[chunks[0].chunk_id.clone()])
            .await
            .unwrap();
        assert!(store.pending_chunks(&domain, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vector_partitions_are_isolated() {
        let index = InMemoryVectorIndex::new();
        let health = DomainName::parse("health").unwrap();
        let startup = DomainName::parse("startup").unwrap();
        index
            .upsert(
                &health,
                VectorEntry {
                    chunk_id: ChunkId("mem_a:0:0".to_string()),
                    memory_id: MemoryId::new("mem_a"),
                    embedding: vec![1.0, 0.0],
                    updated_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(index.search(&health, &[1.0, 0.0], 5).await.unwrap().len(), 1);
        assert!(index.search(&startup, &[1.0, 0.0], 5).await.unwrap().is_empty());
        assert!(index.is_empty(&startup));
    }
}
