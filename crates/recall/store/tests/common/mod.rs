#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_store::{
    ChunkId, DomainName, EmbeddingError, EmbeddingProvider, InMemoryDomainRegistry,
    InMemoryMetadataStore, InMemoryVectorIndex, MemoryId, StoreBackend, StoreError, StoreResult,
    VectorEntry, VectorHit, VectorIndex,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Keyword axes; a text's vector counts hits per axis plus a small bias term.
const AXES: &[&[&str]] = &[
    &[
        "rust",
        "programming",
        "language",
        "code",
        "systems",
        "preference",
        "prefers",
    ],
    &["health", "sleep", "exercise", "run", "running", "diet"],
    &["startup", "funding", "investor", "pitch", "revenue"],
    &["travel", "flight", "hotel", "trip"],
];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; AXES.len() + 1];
    for word in words(text) {
        for (axis, keywords) in AXES.iter().enumerate() {
            if keywords.contains(&word.as_str()) {
                vector[axis] += 1.0;
            }
        }
    }
    vector[AXES.len()] = 0.1;
    vector
}

/// Deterministic embedder that can be switched off at runtime.
#[derive(Default)]
pub struct KeywordEmbedder {
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("connection refused".to_string()));
        }
        Ok(keyword_vector(text))
    }

    fn model(&self) -> &str {
        "keyword-axes"
    }
}

/// Always unreachable.
#[derive(Default)]
pub struct FailingEmbedder {
    calls: AtomicUsize,
}

impl FailingEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingError::Unavailable("connection refused".to_string()))
    }

    fn model(&self) -> &str {
        "unreachable"
    }
}

/// Never answers within any sane timeout.
pub struct SlowEmbedder {
    pub delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(self.delay).await;
        Ok(keyword_vector(text))
    }

    fn model(&self) -> &str {
        "slow"
    }
}

/// Vector index whose writes can be made to fail; reads delegate.
#[derive(Default)]
pub struct FlakyVectorIndex {
    pub inner: InMemoryVectorIndex,
    failing: AtomicBool,
}

impl FlakyVectorIndex {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::IndexWriteFailure("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for FlakyVectorIndex {
    async fn upsert(&self, domain: &DomainName, entry: VectorEntry) -> StoreResult<()> {
        self.check()?;
        self.inner.upsert(domain, entry).await
    }

    async fn remove(&self, domain: &DomainName, chunk_id: &ChunkId) -> StoreResult<()> {
        self.check()?;
        self.inner.remove(domain, chunk_id).await
    }

    async fn search(
        &self,
        domain: &DomainName,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorHit>> {
        self.inner.search(domain, query, k).await
    }

    async fn entry_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        self.inner.entry_ids(domain).await
    }

    async fn touch(
        &self,
        domain: &DomainName,
        memory_id: &MemoryId,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner.touch(domain, memory_id, updated_at).await
    }
}

/// In-memory multi-domain backend that keeps handles for inspection.
pub struct Harness {
    pub metadata: Arc<InMemoryMetadataStore>,
    pub vectors: Arc<FlakyVectorIndex>,
    pub backend: StoreBackend,
}

pub fn harness() -> Harness {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let vectors = Arc::new(FlakyVectorIndex::default());
    let backend = StoreBackend::new(
        metadata.clone(),
        vectors.clone(),
        Arc::new(InMemoryDomainRegistry::new()),
    );
    Harness {
        metadata,
        vectors,
        backend,
    }
}
