//! PostgreSQL multi-domain backend.
//!
//! Each domain owns two tables, `"{domain}_memories"` and
//! `"{domain}_memory_chunks"`, created on first use. Chunk embeddings live in
//! a pgvector `vector` column on the chunk table, so one [`PostgresBackend`]
//! serves as metadata store, vector index and domain registry at once.
//!
//! Domain names are validated by [`DomainName::parse`] before they reach any
//! identifier, and identifiers are always double-quoted.

use crate::domain::DomainName;
use crate::model::{Chunk, ChunkId, Memory, MemoryId, VectorEntry, VectorHit};
use crate::traits::{DomainRegistry, MetadataStore, StoreBackend, VectorIndex};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const REGISTRY_TABLE: &str = "recall_domains";

/// PostgreSQL-backed storage for every port.
pub struct PostgresBackend {
    pool: PgPool,
    dimensions: usize,
    known: RwLock<HashSet<DomainName>>,
}

impl PostgresBackend {
    /// Connect with default pool parameters and initialise the registry.
    pub async fn connect(database_url: &str, dimensions: usize) -> StoreResult<Self> {
        Self::connect_with_options(database_url, dimensions, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        dimensions: usize,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool, dimensions).await
    }

    pub async fn from_pool(pool: PgPool, dimensions: usize) -> StoreResult<Self> {
        if dimensions == 0 {
            return Err(StoreError::invalid("embedding dimensions must be positive"));
        }
        let backend = Self {
            pool,
            dimensions,
            known: RwLock::new(HashSet::new()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bundle this backend as all three storage ports.
    pub fn into_backend(self) -> StoreBackend {
        let shared = Arc::new(self);
        StoreBackend::new(shared.clone(), shared.clone(), shared)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            "CREATE EXTENSION IF NOT EXISTS vector",
            r#"
            CREATE TABLE IF NOT EXISTS recall_domains (
                name TEXT PRIMARY KEY,
                dimensions INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        ];
        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    fn domain_ddl(&self, domain: &DomainName) -> Vec<String> {
        let memories = memories_table(domain);
        let chunks = chunks_table(domain);
        vec![
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {memories} (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    source TEXT,
                    importance REAL NOT NULL,
                    revision INTEGER NOT NULL,
                    chunk_count INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )
                "#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{domain}_memories_updated_idx" ON {memories} (updated_at DESC)"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{domain}_memories_metadata_idx" ON {memories} USING GIN (metadata)"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{domain}_memories_fts_idx" ON {memories} USING GIN (to_tsvector('english', content))"#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {chunks} (
                    chunk_id TEXT PRIMARY KEY,
                    memory_id TEXT NOT NULL REFERENCES {memories}(id) ON DELETE CASCADE,
                    chunk_index INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    overlap TEXT NOT NULL,
                    indexed BOOLEAN NOT NULL DEFAULT FALSE,
                    embedding vector({dims}),
                    UNIQUE (memory_id, chunk_index)
                )
                "#,
                dims = self.dimensions
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{domain}_chunks_embedding_idx" ON {chunks} USING hnsw (embedding vector_cosine_ops)"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{domain}_chunks_pending_idx" ON {chunks} (indexed) WHERE NOT indexed"#
            ),
        ]
    }

    fn is_cached(&self, domain: &DomainName) -> StoreResult<bool> {
        let known = self
            .known
            .read()
            .map_err(|_| StoreError::Backend("domain cache lock poisoned".to_string()))?;
        Ok(known.contains(domain))
    }

    fn cache(&self, domain: &DomainName) -> StoreResult<()> {
        let mut known = self
            .known
            .write()
            .map_err(|_| StoreError::Backend("domain cache lock poisoned".to_string()))?;
        known.insert(domain.clone());
        Ok(())
    }

    async fn is_provisioned(&self, domain: &DomainName) -> StoreResult<bool> {
        if self.is_cached(domain)? {
            return Ok(true);
        }
        let row = sqlx::query("SELECT 1 AS present FROM recall_domains WHERE name = $1")
            .bind(domain.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if row.is_some() {
            self.cache(domain)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn provision(&self, domain: &DomainName) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        // Serialises concurrent provisioning of the same name.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{REGISTRY_TABLE}:{domain}"))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        for stmt in self.domain_ddl(domain) {
            sqlx::query(&stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(format!("provisioning {domain} failed: {e}")))?;
        }
        sqlx::query(
            "INSERT INTO recall_domains (name, dimensions) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(domain.as_str())
        .bind(to_i32(self.dimensions)?)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

fn memories_table(domain: &DomainName) -> String {
    format!("\"{domain}_memories\"")
}

fn chunks_table(domain: &DomainName) -> String {
    format!("\"{domain}_memory_chunks\"")
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::invalid("limit too large"))
}

fn count(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::invalid(format!("{value} exceeds column range")))
}

fn to_i32(value: usize) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::invalid("value too large"))
}

/// pgvector text form, e.g. `[0.1,0.2]`.
fn vector_literal(values: &[f32]) -> String {
    let inner: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", inner.join(","))
}

/// `%`, `_` and `\` are literal inside the ILIKE pattern.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

const MEMORY_COLUMNS: &str =
    "id, content, metadata, source, importance, revision, chunk_count, created_at, updated_at";
const CHUNK_COLUMNS: &str = "chunk_id, memory_id, chunk_index, text, overlap, indexed";

fn memory_row(domain: &DomainName, row: PgRow) -> StoreResult<Memory> {
    let metadata: serde_json::Value = row.try_get("metadata").map_err(backend)?;
    let revision: i32 = row.try_get("revision").map_err(backend)?;
    let chunk_count: i32 = row.try_get("chunk_count").map_err(backend)?;
    Ok(Memory {
        id: MemoryId::new(row.try_get::<String, _>("id").map_err(backend)?),
        domain: domain.clone(),
        content: row.try_get("content").map_err(backend)?,
        source: row.try_get("source").map_err(backend)?,
        importance: row.try_get("importance").map_err(backend)?,
        revision: u32::try_from(revision)
            .map_err(|_| StoreError::Serialization(format!("invalid revision {revision}")))?,
        chunk_count: u32::try_from(chunk_count)
            .map_err(|_| StoreError::Serialization(format!("invalid chunk count {chunk_count}")))?,
        attributes: Memory::attributes_from_metadata(metadata),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(backend)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(backend)?,
    })
}

fn chunk_row(row: PgRow) -> StoreResult<Chunk> {
    let chunk_index: i32 = row.try_get("chunk_index").map_err(backend)?;
    Ok(Chunk {
        chunk_id: ChunkId(row.try_get("chunk_id").map_err(backend)?),
        memory_id: MemoryId::new(row.try_get::<String, _>("memory_id").map_err(backend)?),
        chunk_index: u32::try_from(chunk_index)
            .map_err(|_| StoreError::Serialization(format!("invalid chunk index {chunk_index}")))?,
        text: row.try_get("text").map_err(backend)?,
        overlap: row.try_get("overlap").map_err(backend)?,
        indexed: row.try_get("indexed").map_err(backend)?,
    })
}

fn ids_to_strings<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    ids.map(str::to_string).collect()
}

async fn insert_chunks(
    conn: &mut sqlx::PgConnection,
    domain: &DomainName,
    chunks: &[Chunk],
) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO {} (chunk_id, memory_id, chunk_index, text, overlap, indexed) VALUES ($1, $2, $3, $4, $5, $6)",
        chunks_table(domain)
    );
    for chunk in chunks {
        sqlx::query(&sql)
            .bind(chunk.chunk_id.as_str())
            .bind(chunk.memory_id.as_str())
            .bind(count(chunk.chunk_index)?)
            .bind(chunk.text.as_str())
            .bind(chunk.overlap.as_str())
            .bind(chunk.indexed)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for PostgresBackend {
    async fn insert_memory(&self, memory: &Memory, chunks: &[Chunk]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let sql = format!(
            r#"
            INSERT INTO {}
                (id, content, metadata, source, importance, revision, chunk_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            memories_table(&memory.domain)
        );
        sqlx::query(&sql)
            .bind(memory.id.as_str())
            .bind(memory.content.as_str())
            .bind(memory.metadata())
            .bind(memory.source.as_deref())
            .bind(memory.importance)
            .bind(count(memory.revision)?)
            .bind(count(memory.chunk_count)?)
            .bind(memory.created_at)
            .bind(memory.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        insert_chunks(&mut *tx, &memory.domain, chunks).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn replace_content(
        &self,
        memory: &Memory,
        chunks: &[Chunk],
    ) -> StoreResult<Vec<ChunkId>> {
        let domain = &memory.domain;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Existing keys are kept: the update document is merged on top.
        let sql = format!(
            r#"
            UPDATE {}
               SET content = $1, metadata = metadata || $2, importance = $3,
                   revision = $4, chunk_count = $5, updated_at = $6
             WHERE id = $7 AND revision = $8
            "#,
            memories_table(domain)
        );
        let revision = count(memory.revision)?;
        let result = sqlx::query(&sql)
            .bind(memory.content.as_str())
            .bind(memory.metadata())
            .bind(memory.importance)
            .bind(revision)
            .bind(count(memory.chunk_count)?)
            .bind(memory.updated_at)
            .bind(memory.id.as_str())
            .bind(revision - 1)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            let sql = format!("SELECT 1 FROM {} WHERE id = $1", memories_table(domain));
            let exists = sqlx::query(&sql)
                .bind(memory.id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?
                .is_some();
            return Err(if exists {
                StoreError::stale_revision(&memory.id, memory.revision)
            } else {
                StoreError::not_found(format!("memory {}", memory.id))
            });
        }

        let sql = format!(
            "DELETE FROM {} WHERE memory_id = $1 RETURNING chunk_id",
            chunks_table(domain)
        );
        let removed = sqlx::query(&sql)
            .bind(memory.id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?
            .into_iter()
            .map(|row| row.try_get::<String, _>("chunk_id").map(ChunkId).map_err(backend))
            .collect::<StoreResult<Vec<_>>>()?;

        insert_chunks(&mut *tx, domain, chunks).await?;
        tx.commit().await.map_err(backend)?;
        Ok(removed)
    }

    async fn update_memory(&self, memory: &Memory) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET metadata = metadata || $1, importance = $2, updated_at = $3 WHERE id = $4",
            memories_table(&memory.domain)
        );
        let result = sqlx::query(&sql)
            .bind(memory.metadata())
            .bind(memory.importance)
            .bind(memory.updated_at)
            .bind(memory.id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("memory {}", memory.id)));
        }
        Ok(())
    }

    async fn get_memory(
        &self,
        domain: &DomainName,
        id: &MemoryId,
    ) -> StoreResult<Option<Memory>> {
        if !self.is_provisioned(domain).await? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM {} WHERE id = $1",
            memories_table(domain)
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| memory_row(domain, row)).transpose()
    }

    async fn get_memories(
        &self,
        domain: &DomainName,
        ids: &[MemoryId],
    ) -> StoreResult<Vec<Memory>> {
        if ids.is_empty() || !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM {} WHERE id = ANY($1)",
            memories_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(ids_to_strings(ids.iter().map(MemoryId::as_str)))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(|row| memory_row(domain, row)).collect()
    }

    async fn chunks_for(&self, domain: &DomainName, id: &MemoryId) -> StoreResult<Vec<Chunk>> {
        if !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM {} WHERE memory_id = $1 ORDER BY chunk_index",
            chunks_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(chunk_row).collect()
    }

    async fn get_chunks(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<Vec<Chunk>> {
        if ids.is_empty() || !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM {} WHERE chunk_id = ANY($1)",
            chunks_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(ids_to_strings(ids.iter().map(ChunkId::as_str)))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(chunk_row).collect()
    }

    async fn lexical_search(
        &self,
        domain: &DomainName,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Memory>> {
        if !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {MEMORY_COLUMNS}
              FROM {}
             WHERE to_tsvector('english', content) @@ plainto_tsquery('english', $1)
                OR content ILIKE $2 ESCAPE '\'
             ORDER BY updated_at DESC, id ASC
             LIMIT $3
            "#,
            memories_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(query)
            .bind(like_pattern(query))
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(|row| memory_row(domain, row)).collect()
    }

    async fn list_recent(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Memory>> {
        if !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM {} ORDER BY updated_at DESC, id ASC LIMIT $1",
            memories_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(|row| memory_row(domain, row)).collect()
    }

    async fn mark_indexed(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<()> {
        if ids.is_empty() || !self.is_provisioned(domain).await? {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET indexed = TRUE WHERE chunk_id = ANY($1)",
            chunks_table(domain)
        );
        sqlx::query(&sql)
            .bind(ids_to_strings(ids.iter().map(ChunkId::as_str)))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn pending_chunks(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Chunk>> {
        if !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM {} WHERE NOT indexed ORDER BY chunk_id LIMIT $1",
            chunks_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(chunk_row).collect()
    }

    async fn chunk_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        if !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT chunk_id FROM {} ORDER BY chunk_id", chunks_table(domain));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("chunk_id").map(ChunkId).map_err(backend))
            .collect()
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for PostgresBackend {
    async fn upsert(&self, domain: &DomainName, entry: VectorEntry) -> StoreResult<()> {
        if entry.embedding.len() != self.dimensions {
            return Err(StoreError::IndexWriteFailure(format!(
                "chunk {} has {} dimensions, column expects {}",
                entry.chunk_id,
                entry.embedding.len(),
                self.dimensions
            )));
        }
        let sql = format!(
            "UPDATE {} SET embedding = $1::vector WHERE chunk_id = $2",
            chunks_table(domain)
        );
        let result = sqlx::query(&sql)
            .bind(vector_literal(&entry.embedding))
            .bind(entry.chunk_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::IndexWriteFailure(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::IndexWriteFailure(format!(
                "chunk {} has no metadata row",
                entry.chunk_id
            )));
        }
        Ok(())
    }

    async fn remove(&self, domain: &DomainName, chunk_id: &ChunkId) -> StoreResult<()> {
        if !self.is_provisioned(domain).await? {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET embedding = NULL, indexed = FALSE WHERE chunk_id = $1",
            chunks_table(domain)
        );
        sqlx::query(&sql)
            .bind(chunk_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn search(
        &self,
        domain: &DomainName,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<VectorHit>> {
        if k == 0 || !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        if query.len() != self.dimensions {
            return Err(StoreError::invalid(format!(
                "query has {} dimensions, column expects {}",
                query.len(),
                self.dimensions
            )));
        }
        let sql = format!(
            r#"
            SELECT c.chunk_id, c.memory_id,
                   (1 - (c.embedding <=> $1::vector))::float8 AS similarity,
                   m.updated_at
              FROM {chunks} c
              JOIN {memories} m ON m.id = c.memory_id
             WHERE c.embedding IS NOT NULL
             ORDER BY c.embedding <=> $1::vector, m.updated_at DESC, c.chunk_id ASC
             LIMIT $2
            "#,
            chunks = chunks_table(domain),
            memories = memories_table(domain)
        );
        let rows = sqlx::query(&sql)
            .bind(vector_literal(query))
            .bind(to_i64(k)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let similarity: f64 = row.try_get("similarity").map_err(backend)?;
                Ok(VectorHit {
                    chunk_id: ChunkId(row.try_get("chunk_id").map_err(backend)?),
                    memory_id: MemoryId::new(row.try_get::<String, _>("memory_id").map_err(backend)?),
                    similarity: similarity as f32,
                    updated_at: row.try_get("updated_at").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn entry_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        if !self.is_provisioned(domain).await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT chunk_id FROM {} WHERE embedding IS NOT NULL ORDER BY chunk_id",
            chunks_table(domain)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("chunk_id").map(ChunkId).map_err(backend))
            .collect()
    }
}

#[async_trait]
impl DomainRegistry for PostgresBackend {
    async fn ensure(&self, name: &str) -> StoreResult<DomainName> {
        let domain = DomainName::parse(name)?;
        if self.is_provisioned(&domain).await? {
            return Ok(domain);
        }
        self.provision(&domain).await?;
        self.cache(&domain)?;
        tracing::info!(domain = %domain, dimensions = self.dimensions, "Provisioned memory domain");
        Ok(domain)
    }

    async fn resolve(&self, name: &str) -> StoreResult<Option<DomainName>> {
        let domain = DomainName::parse(name)?;
        Ok(self.is_provisioned(&domain).await?.then_some(domain))
    }

    async fn list(&self) -> StoreResult<Vec<DomainName>> {
        let rows = sqlx::query("SELECT name FROM recall_domains ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(backend)?;
                DomainName::parse(&name)
            })
            .collect()
    }

    fn is_multi_domain(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::Map;

    const DIMS: usize = 3;

    async fn connect() -> Option<PostgresBackend> {
        let url = std::env::var("RECALL_TEST_DATABASE_URL").ok()?;
        Some(PostgresBackend::connect(&url, DIMS).await.unwrap())
    }

    fn unique_domain(prefix: &str) -> String {
        format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
            .chars()
            .take(40)
            .collect()
    }

    fn memory(domain: &DomainName, id: &str, content: &str, age_secs: i64) -> Memory {
        let at = Utc::now() - ChronoDuration::seconds(age_secs);
        Memory {
            id: MemoryId::new(id),
            domain: domain.clone(),
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

    fn chunk(memory: &Memory) -> Chunk {
        Chunk {
            chunk_id: ChunkId::derive(&memory.id, memory.revision, 0),
            memory_id: memory.id.clone(),
            chunk_index: 0,
            text: memory.content.clone(),
            overlap: String::new(),
            indexed: false,
        }
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
        assert_eq!(vector_literal(&[0.5, 1.0]), "[0.5,1]");
    }

    #[tokio::test]
    async fn replace_content_rejects_stale_revision() {
        let Some(backend) = connect().await else {
            return;
        };
        let domain = backend.ensure(&unique_domain("race")).await.unwrap();
        let original = memory(&domain, "mem_race", "old", 0);
        backend.insert_memory(&original, &[chunk(&original)]).await.unwrap();

        let mut winner = original.clone();
        winner.content = "winner".to_string();
        winner.revision = 1;
        let mut loser = winner.clone();
        loser.content = "loser".to_string();

        backend.replace_content(&winner, &[chunk(&winner)]).await.unwrap();
        let err = backend
            .replace_content(&loser, &[chunk(&loser)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let current = backend.get_memory(&domain, &original.id).await.unwrap().unwrap();
        assert_eq!(current.content, "winner");
    }

    #[tokio::test]
    async fn provisions_and_lists_domains() {
        let Some(backend) = connect().await else {
            return;
        };
        let name = unique_domain("health");
        assert!(backend.resolve(&name).await.unwrap().is_none());
        backend.ensure(&name).await.unwrap();
        backend.ensure(&name).await.unwrap();
        let names: Vec<String> = backend
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert!(names.contains(&name));
        assert!(backend.ensure("bad; drop").await.is_err());
    }

    #[tokio::test]
    async fn vector_search_is_scoped_to_domain() {
        let Some(backend) = connect().await else {
            return;
        };
        let health = backend.ensure(&unique_domain("health")).await.unwrap();
        let startup = backend.ensure(&unique_domain("startup")).await.unwrap();

        let m = memory(&health, "mem_pg_a", "sleep eight hours", 0);
        let c = chunk(&m);
        backend.insert_memory(&m, &[c.clone()]).await.unwrap();
        backend
            .upsert(
                &health,
                VectorEntry {
                    chunk_id: c.chunk_id.clone(),
                    memory_id: m.id.clone(),
                    embedding: vec![1.0, 0.0, 0.0],
                    updated_at: m.updated_at,
                },
            )
            .await
            .unwrap();

        let hits = backend.search(&health, &[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert!(backend
            .search(&startup, &[1.0, 0.0, 0.0], 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn lexical_search_escapes_wildcards() {
        let Some(backend) = connect().await else {
            return;
        };
        let domain = backend.ensure(&unique_domain("lex")).await.unwrap();
        let a = memory(&domain, "mem_pg_1", "discount of 50% today", 10);
        let b = memory(&domain, "mem_pg_2", "fifty percent", 0);
        backend.insert_memory(&a, &[chunk(&a)]).await.unwrap();
        backend.insert_memory(&b, &[chunk(&b)]).await.unwrap();

        let hits = backend.lexical_search(&domain, "50%", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "mem_pg_1");
    }
}
