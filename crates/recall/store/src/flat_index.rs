//! Exact cosine vector index persisted as a JSON snapshot file.
//!
//! Vectors live in memory, one partition per domain. The snapshot is written
//! to a temporary sibling file and renamed into place while the index write
//! lock is held, so readers see either the previous file or the new one.
//!
//! Mutations only mark the index dirty. The snapshot is rewritten by
//! [`VectorIndex::persist`] (called from `MemoryCoordinator::close`) unless
//! the index was opened with `autosave`.

use crate::domain::DomainName;
use crate::model::{ChunkId, MemoryId, VectorEntry, VectorHit};
use crate::ranking::cosine_similarity;
use crate::traits::VectorIndex;
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredVector {
    memory_id: MemoryId,
    embedding: Vec<f32>,
    updated_at: DateTime<Utc>,
}

/// Vectors of one domain. The dimension is fixed by the first vector written
/// and released again once the partition is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct FlatPartition {
    dimensions: Option<usize>,
    entries: BTreeMap<ChunkId, StoredVector>,
}

impl FlatPartition {
    pub(crate) fn upsert(&mut self, entry: VectorEntry) -> StoreResult<()> {
        if entry.embedding.is_empty() {
            return Err(StoreError::IndexWriteFailure(format!(
                "empty embedding for chunk {}",
                entry.chunk_id
            )));
        }
        match self.dimensions {
            Some(dims) if dims != entry.embedding.len() => {
                return Err(StoreError::IndexWriteFailure(format!(
                    "chunk {} has {} dimensions, index expects {}",
                    entry.chunk_id,
                    entry.embedding.len(),
                    dims
                )));
            }
            Some(_) => {}
            None => self.dimensions = Some(entry.embedding.len()),
        }
        self.entries.insert(
            entry.chunk_id,
            StoredVector {
                memory_id: entry.memory_id,
                embedding: entry.embedding,
                updated_at: entry.updated_at,
            },
        );
        Ok(())
    }

    pub(crate) fn remove(&mut self, chunk_id: &ChunkId) -> bool {
        let removed = self.entries.remove(chunk_id).is_some();
        if self.entries.is_empty() {
            self.dimensions = None;
        }
        removed
    }

    pub(crate) fn search(&self, query: &[f32], k: usize) -> StoreResult<Vec<VectorHit>> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dims) = self.dimensions {
            if dims != query.len() {
                return Err(StoreError::invalid(format!(
                    "query has {} dimensions, index expects {}",
                    query.len(),
                    dims
                )));
            }
        }

        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .filter_map(|(chunk_id, stored)| {
                cosine_similarity(query, &stored.embedding).map(|similarity| VectorHit {
                    chunk_id: chunk_id.clone(),
                    memory_id: stored.memory_id.clone(),
                    similarity,
                    updated_at: stored.updated_at,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Re-stamp all vectors owned by `memory_id`. Returns how many changed.
    pub(crate) fn touch(&mut self, memory_id: &MemoryId, updated_at: DateTime<Utc>) -> usize {
        let mut touched = 0;
        for stored in self.entries.values_mut() {
            if &stored.memory_id == memory_id && stored.updated_at != updated_at {
                stored.updated_at = updated_at;
                touched += 1;
            }
        }
        touched
    }

    pub(crate) fn ids(&self) -> Vec<ChunkId> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    domains: BTreeMap<DomainName, FlatPartition>,
}

/// File-persisted vector index for the simple backend.
#[derive(Debug)]
pub struct FileVectorIndex {
    path: PathBuf,
    autosave: bool,
    dirty: AtomicBool,
    partitions: RwLock<BTreeMap<DomainName, FlatPartition>>,
}

impl FileVectorIndex {
    /// Load the snapshot at `path`, or start empty if the file does not exist.
    /// A snapshot that cannot be parsed is an error.
    ///
    /// With `autosave` every mutation rewrites the whole snapshot; without it
    /// changes reach disk on `persist`.
    pub async fn open(path: impl Into<PathBuf>, autosave: bool) -> StoreResult<Self> {
        let path = path.into();
        let partitions = load_snapshot(&path).await?;
        let vectors: usize = partitions.values().map(FlatPartition::len).sum();
        tracing::debug!(
            path = %path.display(),
            domains = partitions.len(),
            vectors,
            "Loaded vector index"
        );
        Ok(Self {
            path,
            autosave,
            dirty: AtomicBool::new(false),
            partitions: RwLock::new(partitions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether in-memory changes have not been written to the snapshot yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    async fn mutate<F>(&self, domain: &DomainName, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut FlatPartition) -> StoreResult<bool> + Send,
    {
        let mut guard = self.partitions.write().await;
        let changed = apply(guard.entry(domain.clone()).or_default())?;
        if !changed {
            return Ok(());
        }
        if self.autosave {
            write_snapshot(&self.path, &guard).await?;
        } else {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FileVectorIndex {
    async fn upsert(&self, domain: &DomainName, entry: VectorEntry) -> StoreResult<()> {
        self.mutate(domain, |partition| partition.upsert(entry).map(|()| true))
            .await
    }

    async fn remove(&self, domain: &DomainName, chunk_id: &ChunkId) -> StoreResult<()> {
        self.mutate(domain, |partition| Ok(partition.remove(chunk_id)))
            .await
    }

    async fn upsert_many(&self, domain: &DomainName, entries: Vec<VectorEntry>) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mutate(domain, |partition| {
            entries
                .into_iter()
                .try_for_each(|entry| partition.upsert(entry))
                .map(|()| true)
        })
        .await
    }

    async fn remove_many(&self, domain: &DomainName, chunk_ids: &[ChunkId]) -> StoreResult<()> {
        self.mutate(domain, |partition| {
            let mut removed = false;
            for chunk_id in chunk_ids {
                removed |= partition.remove(chunk_id);
            }
            Ok(removed)
        })
        .await
    }

    async fn search(
        &self,
        domain: &DomainName,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorHit>> {
        let guard = self.partitions.read().await;
        match guard.get(domain) {
            Some(partition) => partition.search(query, k),
            None => Ok(Vec::new()),
        }
    }

    async fn entry_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        let guard = self.partitions.read().await;
        Ok(guard.get(domain).map(FlatPartition::ids).unwrap_or_default())
    }

    async fn touch(
        &self,
        domain: &DomainName,
        memory_id: &MemoryId,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.mutate(domain, |partition| Ok(partition.touch(memory_id, updated_at) > 0))
            .await
    }

    async fn persist(&self) -> StoreResult<()> {
        let guard = self.partitions.write().await;
        let on_disk = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        if !self.dirty.load(Ordering::Acquire) && on_disk {
            return Ok(());
        }
        write_snapshot(&self.path, &guard).await?;
        self.dirty.store(false, Ordering::Release);
        tracing::debug!(path = %self.path.display(), "Persisted vector index");
        Ok(())
    }
}

async fn load_snapshot(path: &Path) -> StoreResult<BTreeMap<DomainName, FlatPartition>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(StoreError::Backend(format!(
                "failed to read vector index {}: {err}",
                path.display()
            )))
        }
    };
    let snapshot: IndexSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
        StoreError::Serialization(format!(
            "corrupt vector index {}: {e}",
            path.display()
        ))
    })?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StoreError::Serialization(format!(
            "unsupported vector index version {}",
            snapshot.version
        )));
    }
    Ok(snapshot.domains)
}

async fn write_snapshot(
    path: &Path,
    partitions: &BTreeMap<DomainName, FlatPartition>,
) -> StoreResult<()> {
    let snapshot = IndexSnapshot {
        version: SNAPSHOT_VERSION,
        domains: partitions.clone(),
    };
    let bytes = serde_json::to_vec(&snapshot)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to create index directory: {e}")))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| StoreError::IndexWriteFailure(format!("failed to write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        StoreError::IndexWriteFailure(format!("failed to replace {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(chunk: &str, memory: &str, embedding: Vec<f32>, updated_at: DateTime<Utc>) -> VectorEntry {
        VectorEntry {
            chunk_id: ChunkId(chunk.to_string()),
            memory_id: MemoryId::new(memory),
            embedding,
            updated_at,
        }
    }

    fn domain() -> DomainName {
        DomainName::default_domain()
    }

    #[tokio::test]
    async fn search_orders_by_similarity_then_recency() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileVectorIndex::open(dir.path().join("index.json"), true)
            .await
            .unwrap();
        let now = Utc::now();
        index
            .upsert(&domain(), entry("a:0:0", "a", vec![1.0, 0.0], now - Duration::seconds(10)))
            .await
            .unwrap();
        index
            .upsert(&domain(), entry("b:0:0", "b", vec![1.0, 0.0], now))
            .await
            .unwrap();
        index
            .upsert(&domain(), entry("c:0:0", "c", vec![0.0, 1.0], now))
            .await
            .unwrap();

        let hits = index.search(&domain(), &[1.0, 0.1], 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b:0:0", "a:0:0", "c:0:0"]);
        assert!(hits[0].similarity > hits[2].similarity);
    }

    #[tokio::test]
    async fn unknown_domain_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileVectorIndex::open(dir.path().join("index.json"), false)
            .await
            .unwrap();
        let other = DomainName::parse("nothing_here").unwrap();
        assert!(index.search(&other, &[1.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_remove_tolerates_absent() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileVectorIndex::open(dir.path().join("index.json"), false)
            .await
            .unwrap();
        let now = Utc::now();
        index.upsert(&domain(), entry("a:0:0", "a", vec![1.0], now)).await.unwrap();
        index.upsert(&domain(), entry("a:0:0", "a", vec![1.0], now)).await.unwrap();
        assert_eq!(index.entry_ids(&domain()).await.unwrap().len(), 1);
        index.remove(&domain(), &ChunkId("missing".to_string())).await.unwrap();
        index.remove(&domain(), &ChunkId("a:0:0".to_string())).await.unwrap();
        assert!(index.entry_ids(&domain()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_index_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileVectorIndex::open(dir.path().join("index.json"), false)
            .await
            .unwrap();
        let now = Utc::now();
        index.upsert(&domain(), entry("a:0:0", "a", vec![1.0, 0.0], now)).await.unwrap();
        let err = index
            .upsert(&domain(), entry("b:0:0", "b", vec![1.0], now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexWriteFailure(_)));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");
        let now = Utc::now();
        {
            let index = FileVectorIndex::open(&path, false).await.unwrap();
            index.upsert(&domain(), entry("a:0:0", "a", vec![0.3, 0.4], now)).await.unwrap();
            index.persist().await.unwrap();
        }
        let reopened = FileVectorIndex::open(&path, false).await.unwrap();
        let hits = reopened.search(&domain(), &[0.3, 0.4], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id.as_str(), "a");
        assert!(!path.with_file_name("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn mutations_reach_disk_on_persist_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let now = Utc::now();
        let index = FileVectorIndex::open(&path, false).await.unwrap();
        index.upsert(&domain(), entry("a:0:0", "a", vec![1.0, 0.0], now)).await.unwrap();
        index.upsert(&domain(), entry("b:0:0", "b", vec![0.0, 1.0], now)).await.unwrap();
        assert!(index.is_dirty());
        assert!(!path.exists());

        index.persist().await.unwrap();
        assert!(!index.is_dirty());
        let reopened = FileVectorIndex::open(&path, false).await.unwrap();
        assert_eq!(reopened.entry_ids(&domain()).await.unwrap().len(), 2);

        // Nothing changed, so a second persist leaves the file alone.
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        index.remove(&domain(), &ChunkId("missing".to_string())).await.unwrap();
        assert!(!index.is_dirty());
        index.persist().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), before);
    }

    #[tokio::test]
    async fn touch_moves_ties_to_the_new_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let index = FileVectorIndex::open(dir.path().join("index.json"), false)
            .await
            .unwrap();
        let now = Utc::now();
        index
            .upsert(&domain(), entry("old:0:0", "old", vec![1.0, 0.0], now - Duration::seconds(60)))
            .await
            .unwrap();
        index
            .upsert(&domain(), entry("new:0:0", "new", vec![1.0, 0.0], now))
            .await
            .unwrap();
        let top = index.search(&domain(), &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top[0].memory_id.as_str(), "new");

        index
            .touch(&domain(), &MemoryId::new("old"), now + Duration::seconds(1))
            .await
            .unwrap();
        let top = index.search(&domain(), &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top[0].memory_id.as_str(), "old");
        assert_eq!(top[0].updated_at, now + Duration::seconds(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_a_partial_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let index = std::sync::Arc::new(FileVectorIndex::open(&path, true).await.unwrap());
        let now = Utc::now();

        let writer = {
            let index = index.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let chunk = format!("m{i}:0:0");
                    let memory = format!("m{i}");
                    index
                        .upsert(&domain(), entry(&chunk, &memory, vec![1.0, i as f32], now))
                        .await
                        .unwrap();
                }
            })
        };

        let searcher = {
            let index = index.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    index.search(&domain(), &[1.0, 1.0], 5).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let file_reader = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut parsed = 0usize;
                for _ in 0..200 {
                    match tokio::fs::read(&path).await {
                        Ok(bytes) => {
                            let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)
                                .expect("snapshot on disk is always complete");
                            assert_eq!(snapshot.version, SNAPSHOT_VERSION);
                            parsed += 1;
                        }
                        Err(err) => assert_eq!(err.kind(), ErrorKind::NotFound),
                    }
                    tokio::task::yield_now().await;
                }
                parsed
            })
        };

        writer.await.unwrap();
        searcher.await.unwrap();
        file_reader.await.unwrap();

        let reopened = FileVectorIndex::open(&path, false).await.unwrap();
        assert_eq!(reopened.entry_ids(&domain()).await.unwrap().len(), 200);
        assert!(!path.with_file_name("index.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = FileVectorIndex::open(&path, false).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
