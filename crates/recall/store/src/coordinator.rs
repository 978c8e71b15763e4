//! Memory store coordinator.
//!
//! Ties a memory to its chunks and keeps the metadata store and vector index
//! consistent. Metadata is authoritative and always written first; vector
//! writes are best effort and failures surface as [`StoreWarning`]s. Chunks
//! left without a vector are picked up by [`MemoryCoordinator::reconcile`].

use crate::chunker::{Chunker, ChunkerConfig, TextChunk};
use crate::domain::{DomainName, DEFAULT_DOMAIN};
use crate::model::{
    validate_attributes, validate_content, validate_importance, Chunk, ChunkId, Memory,
    MemoryId, MemoryUpdate, MemoryWithChunks, NewMemory, VectorEntry, DEFAULT_IMPORTANCE,
};
use crate::ranking::{rank_order, RankWeights};
use crate::traits::{DomainRegistry, EmbeddingProvider, MetadataStore, StoreBackend, VectorIndex};
use crate::{EmbeddingError, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// Engine knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub chunking: ChunkerConfig,
    /// Upper bound for one embedding call.
    pub embed_timeout: Duration,
    /// Embedding calls in flight per operation.
    pub embed_concurrency: usize,
    /// Vector hits gathered per requested result.
    pub overfetch_factor: usize,
    pub lexical_baseline: f32,
    pub importance_weight: f32,
    pub default_importance: f32,
    pub default_domain: String,
    /// Chunks re-embedded per reconcile pass.
    pub reconcile_batch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkerConfig::default(),
            embed_timeout: Duration::from_secs(10),
            embed_concurrency: 4,
            overfetch_factor: 3,
            lexical_baseline: 0.0,
            importance_weight: 0.01,
            default_importance: DEFAULT_IMPORTANCE,
            default_domain: DEFAULT_DOMAIN.to_string(),
            reconcile_batch: 256,
        }
    }
}

/// Non-fatal condition attached to a successful operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreWarning {
    /// Embedding was unavailable; these chunks are lexical-only for now.
    LexicalOnly {
        chunks_without_vectors: usize,
        reason: String,
    },
    /// Metadata committed but the vector index write failed.
    IndexWriteFailure { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub memory_id: MemoryId,
    pub domain: DomainName,
    pub chunk_count: usize,
    pub warnings: Vec<StoreWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReceipt {
    pub memory_id: MemoryId,
    pub rechunked: bool,
    pub chunk_count: usize,
    pub warnings: Vec<StoreWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub domain: Option<String>,
    pub limit: usize,
    pub use_vector: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            domain: None,
            limit,
            use_vector: true,
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn lexical_only(mut self) -> Self {
        self.use_vector = false;
        self
    }
}

/// Which signal produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSignal {
    Vector,
    Lexical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub memory: Memory,
    pub score: f32,
    pub signal: HitSignal,
    /// Best-matching chunk for vector hits.
    pub matched_chunk: Option<ChunkId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    LexicalOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub hits: Vec<MemoryHit>,
    pub mode: SearchMode,
    pub warnings: Vec<StoreWarning>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub embedded: usize,
    pub still_pending: usize,
    pub pruned: usize,
}

/// Strictly increasing microsecond clock, so `updated_at` ordering is total
/// within one process and survives microsecond storage precision.
#[derive(Debug, Default)]
struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let mut previous = self.last_micros.load(AtomicOrdering::Relaxed);
        loop {
            let next = wall.max(previous + 1);
            match self.last_micros.compare_exchange_weak(
                previous,
                next,
                AtomicOrdering::SeqCst,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
                Err(actual) => previous = actual,
            }
        }
    }
}

/// Outcome of embedding one operation's chunks.
struct Embedded {
    vectors: Vec<Option<Vec<f32>>>,
    warning: Option<StoreWarning>,
}

/// The memory store engine.
pub struct MemoryCoordinator {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorIndex>,
    domains: Arc<dyn DomainRegistry>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    weights: RankWeights,
    config: CoordinatorConfig,
    clock: MonotonicClock,
}

impl MemoryCoordinator {
    pub fn new(
        backend: StoreBackend,
        embedder: Arc<dyn EmbeddingProvider>,
        config: CoordinatorConfig,
    ) -> StoreResult<Self> {
        let chunker = Chunker::new(config.chunking)?;
        validate_importance(config.default_importance)?;
        DomainName::parse(&config.default_domain)?;
        if config.overfetch_factor == 0 {
            return Err(StoreError::invalid("overfetch_factor must be positive"));
        }
        Ok(Self {
            metadata: backend.metadata,
            vectors: backend.vectors,
            domains: backend.domains,
            embedder,
            chunker,
            weights: RankWeights {
                lexical_baseline: config.lexical_baseline,
                importance_weight: config.importance_weight,
            },
            config,
            clock: MonotonicClock::default(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_multi_domain(&self) -> bool {
        self.domains.is_multi_domain()
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model()
    }

    fn domain_or_default<'a>(&'a self, domain: Option<&'a str>) -> &'a str {
        domain
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.config.default_domain)
    }

    /// Resolve an existing domain; `NotFound` when it does not exist.
    async fn existing_domain(&self, domain: Option<&str>) -> StoreResult<DomainName> {
        let name = self.domain_or_default(domain);
        self.domains
            .resolve(name)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("domain {name}")))
    }

    fn build_chunks(&self, memory: &Memory, pieces: &[TextChunk]) -> Vec<Chunk> {
        pieces
            .iter()
            .map(|piece| Chunk {
                chunk_id: ChunkId::derive(&memory.id, memory.revision, piece.index),
                memory_id: memory.id.clone(),
                chunk_index: piece.index,
                text: piece.text.clone(),
                overlap: piece.overlap.clone(),
                indexed: false,
            })
            .collect()
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let timeout = self.config.embed_timeout;
        match tokio::time::timeout(timeout, self.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Timeout(
                timeout.as_millis().min(u64::MAX as u128) as u64,
            )),
        }
    }

    /// One attempt per window, run concurrently. Logs at most one warning.
    async fn embed_windows(&self, windows: Vec<String>) -> Embedded {
        let results: Vec<Result<Vec<f32>, EmbeddingError>> = stream::iter(windows)
            .map(|window| async move { self.embed_one(&window).await })
            .buffered(self.config.embed_concurrency.max(1))
            .collect()
            .await;

        let mut first_error = None;
        let mut missing = 0usize;
        let vectors = results
            .into_iter()
            .map(|result| match result {
                Ok(vector) => Some(vector),
                Err(err) => {
                    missing += 1;
                    first_error.get_or_insert(err);
                    None
                }
            })
            .collect();

        let warning = first_error.map(|err| {
            tracing::warn!(
                error = %err,
                chunks_without_vectors = missing,
                model = self.embedder.model(),
                "Embedding unavailable, continuing in lexical-only mode"
            );
            StoreWarning::LexicalOnly {
                chunks_without_vectors: missing,
                reason: err.to_string(),
            }
        });

        Embedded { vectors, warning }
    }

    /// Mirror embedded chunks into the vector index and flag them indexed.
    async fn index_chunks(
        &self,
        memory: &Memory,
        chunks: &[Chunk],
        vectors: Vec<Option<Vec<f32>>>,
    ) -> StoreResult<Option<StoreWarning>> {
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(vectors)
            .filter_map(|(chunk, vector)| {
                vector.map(|embedding| VectorEntry {
                    chunk_id: chunk.chunk_id.clone(),
                    memory_id: memory.id.clone(),
                    embedding,
                    updated_at: memory.updated_at,
                })
            })
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }

        let ids: Vec<ChunkId> = entries.iter().map(|e| e.chunk_id.clone()).collect();
        if let Err(err) = self.vectors.upsert_many(&memory.domain, entries).await {
            tracing::warn!(
                memory_id = %memory.id,
                domain = %memory.domain,
                error = %err,
                "Vector index write failed; memory stays lexically searchable"
            );
            return Ok(Some(StoreWarning::IndexWriteFailure {
                message: err.to_string(),
            }));
        }
        self.metadata.mark_indexed(&memory.domain, &ids).await?;
        Ok(None)
    }

    /// Store a new memory and return its id with any warnings.
    #[tracing::instrument(skip_all, fields(domain = new.domain.as_deref().unwrap_or_default()))]
    pub async fn store(&self, new: NewMemory) -> StoreResult<StoreReceipt> {
        validate_content(&new.content)?;
        let importance = validate_importance(new.importance.unwrap_or(self.config.default_importance))?;
        validate_attributes(&new.attributes)?;

        let domain = self
            .domains
            .ensure(self.domain_or_default(new.domain.as_deref()))
            .await?;
        let pieces = self.chunker.split(&new.content)?;

        let now = self.clock.now();
        let memory = Memory {
            id: MemoryId::generate(),
            domain,
            content: new.content,
            source: new.source,
            importance,
            revision: 0,
            chunk_count: pieces.len() as u32,
            attributes: new.attributes,
            created_at: now,
            updated_at: now,
        };
        let chunks = self.build_chunks(&memory, &pieces);
        let embedded = self
            .embed_windows(pieces.iter().map(TextChunk::window).collect())
            .await;

        self.metadata.insert_memory(&memory, &chunks).await?;

        let mut warnings: Vec<StoreWarning> = embedded.warning.into_iter().collect();
        warnings.extend(self.index_chunks(&memory, &chunks, embedded.vectors).await?);

        tracing::info!(
            memory_id = %memory.id,
            domain = %memory.domain,
            chunks = chunks.len(),
            warnings = warnings.len(),
            "Stored memory"
        );
        Ok(StoreReceipt {
            memory_id: memory.id,
            domain: memory.domain,
            chunk_count: chunks.len(),
            warnings,
        })
    }

    /// Update content and/or importance of an existing memory.
    ///
    /// New content is chunked and embedded before anything is written, then
    /// the row and its chunk set are replaced in one metadata transaction.
    /// If another content update lands first the call fails with `Conflict`
    /// and writes nothing.
    #[tracing::instrument(skip_all, fields(memory_id = %memory_id))]
    pub async fn update(
        &self,
        memory_id: &MemoryId,
        update: MemoryUpdate,
        domain: Option<&str>,
    ) -> StoreResult<UpdateReceipt> {
        if update.is_empty() {
            return Err(StoreError::invalid(
                "update requires content, importance or metadata",
            ));
        }
        if let Some(content) = update.content.as_deref() {
            validate_content(content)?;
        }
        if let Some(importance) = update.importance {
            validate_importance(importance)?;
        }
        validate_attributes(&update.attributes)?;

        let domain = self.existing_domain(domain).await?;
        let mut memory = self
            .metadata
            .get_memory(&domain, memory_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("memory {memory_id}")))?;

        if let Some(importance) = update.importance {
            memory.importance = importance;
        }
        memory.attributes.extend(update.attributes);

        let Some(content) = update.content else {
            memory.updated_at = self.clock.now();
            self.metadata.update_memory(&memory).await?;

            let mut warnings = Vec::new();
            if let Err(err) = self
                .vectors
                .touch(&domain, &memory.id, memory.updated_at)
                .await
            {
                tracing::warn!(
                    memory_id = %memory.id,
                    error = %err,
                    "Failed to re-stamp vectors after metadata update"
                );
                warnings.push(StoreWarning::IndexWriteFailure {
                    message: err.to_string(),
                });
            }
            tracing::info!(memory_id = %memory.id, domain = %domain, "Updated memory metadata");
            return Ok(UpdateReceipt {
                memory_id: memory.id,
                rechunked: false,
                chunk_count: memory.chunk_count as usize,
                warnings,
            });
        };

        let pieces = self.chunker.split(&content)?;
        memory.content = content;
        memory.revision += 1;
        memory.chunk_count = pieces.len() as u32;
        memory.updated_at = self.clock.now();
        let chunks = self.build_chunks(&memory, &pieces);
        let embedded = self
            .embed_windows(pieces.iter().map(TextChunk::window).collect())
            .await;

        let removed = self.metadata.replace_content(&memory, &chunks).await?;

        let mut warnings: Vec<StoreWarning> = embedded.warning.into_iter().collect();
        if let Err(err) = self.vectors.remove_many(&domain, &removed).await {
            // Orphans are harmless to search and pruned by reconcile.
            tracing::warn!(
                memory_id = %memory.id,
                error = %err,
                "Failed to drop superseded vectors"
            );
            warnings.push(StoreWarning::IndexWriteFailure {
                message: err.to_string(),
            });
        }
        warnings.extend(self.index_chunks(&memory, &chunks, embedded.vectors).await?);

        tracing::info!(
            memory_id = %memory.id,
            domain = %domain,
            revision = memory.revision,
            chunks = chunks.len(),
            "Replaced memory content"
        );
        Ok(UpdateReceipt {
            memory_id: memory.id,
            rechunked: true,
            chunk_count: chunks.len(),
            warnings,
        })
    }

    /// Ranked search over one domain.
    #[tracing::instrument(skip_all, fields(domain = request.domain.as_deref().unwrap_or_default(), limit = request.limit))]
    pub async fn search(&self, request: SearchRequest) -> StoreResult<SearchOutcome> {
        if request.limit == 0 {
            return Err(StoreError::invalid("limit must be positive"));
        }
        if request.query.trim().is_empty() {
            return Err(StoreError::invalid("query must not be empty"));
        }
        let domain = self.existing_domain(request.domain.as_deref()).await?;
        let limit = request.limit;

        if !request.use_vector {
            return self.lexical_outcome(&domain, &request.query, limit, Vec::new()).await;
        }

        let probe = self.query_window(&request.query)?;
        let embedding = match self.embed_one(&probe).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!(error = %err, "Query embedding unavailable, using lexical-only search");
                let warning = StoreWarning::LexicalOnly {
                    chunks_without_vectors: 1,
                    reason: err.to_string(),
                };
                return self
                    .lexical_outcome(&domain, &request.query, limit, vec![warning])
                    .await;
            }
        };

        let k = limit.saturating_mul(self.config.overfetch_factor);
        let (vector_hits, lexical_hits) = tokio::join!(
            self.vectors.search(&domain, &embedding, k),
            self.metadata.lexical_search(&domain, &request.query, k),
        );
        let lexical_hits = lexical_hits?;
        let vector_hits = match vector_hits {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(error = %err, "Vector search failed, using lexical-only search");
                let warning = StoreWarning::LexicalOnly {
                    chunks_without_vectors: 0,
                    reason: err.to_string(),
                };
                return self
                    .lexical_outcome(&domain, &request.query, limit, vec![warning])
                    .await;
            }
        };

        // Drop hits whose chunk was superseded but whose vector lingers.
        let hit_chunk_ids: Vec<ChunkId> = vector_hits.iter().map(|h| h.chunk_id.clone()).collect();
        let live: HashSet<ChunkId> = self
            .metadata
            .get_chunks(&domain, &hit_chunk_ids)
            .await?
            .into_iter()
            .map(|chunk| chunk.chunk_id)
            .collect();

        // Best chunk per memory; hits arrive in descending similarity.
        let mut best: HashMap<MemoryId, (f32, ChunkId)> = HashMap::new();
        for hit in vector_hits.into_iter().filter(|h| live.contains(&h.chunk_id)) {
            best.entry(hit.memory_id)
                .and_modify(|current| {
                    if hit.similarity > current.0 {
                        *current = (hit.similarity, hit.chunk_id.clone());
                    }
                })
                .or_insert((hit.similarity, hit.chunk_id));
        }

        let vector_ids: Vec<MemoryId> = best.keys().cloned().collect();
        let mut hits: Vec<MemoryHit> = self
            .metadata
            .get_memories(&domain, &vector_ids)
            .await?
            .into_iter()
            .filter_map(|memory| {
                let (similarity, chunk_id) = best.remove(&memory.id)?;
                Some(MemoryHit {
                    score: self.weights.score(Some(similarity), memory.importance),
                    signal: HitSignal::Vector,
                    matched_chunk: Some(chunk_id),
                    memory,
                })
            })
            .collect();

        let seen: HashSet<MemoryId> = hits.iter().map(|h| h.memory.id.clone()).collect();
        hits.extend(
            lexical_hits
                .into_iter()
                .filter(|memory| !seen.contains(&memory.id))
                .map(|memory| MemoryHit {
                    score: self.weights.score(None, memory.importance),
                    signal: HitSignal::Lexical,
                    matched_chunk: None,
                    memory,
                }),
        );

        sort_hits(&mut hits);
        hits.truncate(limit);
        tracing::debug!(hits = hits.len(), k, "Hybrid search complete");
        Ok(SearchOutcome {
            hits,
            mode: SearchMode::Hybrid,
            warnings: Vec::new(),
        })
    }

    /// Queries longer than one chunk are embedded by their first window.
    fn query_window(&self, query: &str) -> StoreResult<String> {
        Ok(self
            .chunker
            .split(query)?
            .into_iter()
            .next()
            .map(|chunk| chunk.window())
            .unwrap_or_else(|| query.to_string()))
    }

    /// Lexical-only results: no similarity exists, so recency decides.
    async fn lexical_outcome(
        &self,
        domain: &DomainName,
        query: &str,
        limit: usize,
        warnings: Vec<StoreWarning>,
    ) -> StoreResult<SearchOutcome> {
        let hits = self
            .metadata
            .lexical_search(domain, query, limit)
            .await?
            .into_iter()
            .map(|memory| MemoryHit {
                score: self.weights.score(None, memory.importance),
                signal: HitSignal::Lexical,
                matched_chunk: None,
                memory,
            })
            .collect::<Vec<_>>();
        tracing::debug!(hits = hits.len(), "Lexical search complete");
        Ok(SearchOutcome {
            hits,
            mode: SearchMode::LexicalOnly,
            warnings,
        })
    }

    /// Memory with its current chunks.
    pub async fn get(&self, memory_id: &MemoryId, domain: Option<&str>) -> StoreResult<MemoryWithChunks> {
        let domain = self.existing_domain(domain).await?;
        let memory = self
            .metadata
            .get_memory(&domain, memory_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("memory {memory_id}")))?;
        let chunks = self.metadata.chunks_for(&domain, memory_id).await?;
        Ok(MemoryWithChunks { memory, chunks })
    }

    /// Newest memories first. An unknown domain yields an empty list.
    pub async fn list_recent(&self, domain: Option<&str>, limit: usize) -> StoreResult<Vec<Memory>> {
        if limit == 0 {
            return Err(StoreError::invalid("limit must be positive"));
        }
        match self.existing_domain(domain).await {
            Ok(domain) => self.metadata.list_recent(&domain, limit).await,
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Known domains. `Unsupported` on single-domain backends.
    pub async fn list_domains(&self) -> StoreResult<Vec<DomainName>> {
        self.domains.list().await
    }

    /// Re-embed chunks that never reached the vector index and prune index
    /// entries whose chunk no longer exists.
    ///
    /// A chunk marked indexed whose vector is absent (an index snapshot lost
    /// before `close`) counts as pending too.
    #[tracing::instrument(skip_all)]
    pub async fn reconcile(&self, domain: Option<&str>) -> StoreResult<ReconcileReport> {
        let domain = self.existing_domain(domain).await?;
        let mut report = ReconcileReport::default();
        let batch = self.config.reconcile_batch;

        let live: HashSet<ChunkId> = self.metadata.chunk_ids(&domain).await?.into_iter().collect();
        let indexed: HashSet<ChunkId> = self.vectors.entry_ids(&domain).await?.into_iter().collect();

        let mut pending = self.metadata.pending_chunks(&domain, batch).await?;
        let room = batch.saturating_sub(pending.len());
        if room > 0 {
            let queued: HashSet<ChunkId> = pending.iter().map(|c| c.chunk_id.clone()).collect();
            let mut lost: Vec<ChunkId> = live
                .iter()
                .filter(|id| !indexed.contains(*id) && !queued.contains(*id))
                .cloned()
                .collect();
            lost.sort();
            lost.truncate(room);
            if !lost.is_empty() {
                tracing::debug!(count = lost.len(), "Chunks missing from the vector index");
                pending.extend(self.metadata.get_chunks(&domain, &lost).await?);
            }
        }

        if !pending.is_empty() {
            let memory_ids: Vec<MemoryId> = pending
                .iter()
                .map(|c| c.memory_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let owners: HashMap<MemoryId, DateTime<Utc>> = self
                .metadata
                .get_memories(&domain, &memory_ids)
                .await?
                .into_iter()
                .map(|m| (m.id, m.updated_at))
                .collect();

            let embedded = self
                .embed_windows(pending.iter().map(Chunk::window).collect())
                .await;
            let mut entries = Vec::new();
            for (chunk, vector) in pending.iter().zip(embedded.vectors) {
                match (vector, owners.get(&chunk.memory_id)) {
                    (Some(embedding), Some(updated_at)) => entries.push(VectorEntry {
                        chunk_id: chunk.chunk_id.clone(),
                        memory_id: chunk.memory_id.clone(),
                        embedding,
                        updated_at: *updated_at,
                    }),
                    _ => report.still_pending += 1,
                }
            }

            if !entries.is_empty() {
                let ids: Vec<ChunkId> = entries.iter().map(|e| e.chunk_id.clone()).collect();
                match self.vectors.upsert_many(&domain, entries).await {
                    Ok(()) => {
                        self.metadata.mark_indexed(&domain, &ids).await?;
                        report.embedded = ids.len();
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Reconcile could not write vectors");
                        report.still_pending += ids.len();
                    }
                }
            }
        }

        let mut orphans: Vec<ChunkId> = indexed
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        orphans.sort();
        if !orphans.is_empty() {
            self.vectors.remove_many(&domain, &orphans).await?;
            report.pruned = orphans.len();
        }

        tracing::info!(
            domain = %domain,
            embedded = report.embedded,
            still_pending = report.still_pending,
            pruned = report.pruned,
            "Reconcile pass complete"
        );
        Ok(report)
    }

    /// Flush the vector index and release storage handles.
    pub async fn close(&self) -> StoreResult<()> {
        self.vectors.persist().await?;
        self.metadata.close().await?;
        tracing::info!("Memory store closed");
        Ok(())
    }
}

fn sort_hits(hits: &mut [MemoryHit]) {
    hits.sort_by(|a, b| {
        rank_order(
            (a.score, a.memory.updated_at, a.memory.id.as_str()),
            (b.score, b.memory.updated_at, b.memory.id.as_str()),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use crate::memory::in_memory_backend;

    fn coordinator() -> MemoryCoordinator {
        MemoryCoordinator::new(
            in_memory_backend(),
            Arc::new(DisabledEmbedder),
            CoordinatorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::default();
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();
        assert!(a < b && b < c);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = CoordinatorConfig {
            overfetch_factor: 0,
            ..Default::default()
        };
        assert!(MemoryCoordinator::new(in_memory_backend(), Arc::new(DisabledEmbedder), config).is_err());

        let config = CoordinatorConfig {
            default_importance: 2.0,
            ..Default::default()
        };
        assert!(MemoryCoordinator::new(in_memory_backend(), Arc::new(DisabledEmbedder), config).is_err());
    }

    #[tokio::test]
    async fn store_without_embeddings_warns_once() {
        let coordinator = coordinator();
        let receipt = coordinator
            .store(NewMemory::new("The user prefers Rust"))
            .await
            .unwrap();
        assert_eq!(receipt.warnings.len(), 1);
        assert!(matches!(
            receipt.warnings[0],
            StoreWarning::LexicalOnly { chunks_without_vectors: 1, .. }
        ));
    }

    #[tokio::test]
    async fn rejects_empty_content_and_bad_limits() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.store(NewMemory::new("   ")).await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator.search(SearchRequest::new("x", 0)).await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            coordinator
                .store(NewMemory::new("x").with_importance(-0.1))
                .await,
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn empty_update_is_invalid() {
        let coordinator = coordinator();
        let receipt = coordinator.store(NewMemory::new("text")).await.unwrap();
        let err = coordinator
            .update(&receipt.memory_id, MemoryUpdate::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }
}
