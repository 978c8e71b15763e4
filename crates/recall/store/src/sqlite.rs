//! SQLite metadata store for the simple single-domain backend.
//!
//! Pairs with [`FileVectorIndex`] and [`SingleDomainRegistry`] via
//! [`open_simple_backend`]. Timestamps are stored as integer microseconds so
//! recency ordering is exact.
//!
//! Lexical search goes through an FTS5 trigram index on `content`, kept in
//! sync by triggers. Trigrams cannot match queries shorter than three
//! characters, so those fall back to a case-insensitive `instr` scan.

use crate::domain::{DomainName, SingleDomainRegistry};
use crate::flat_index::FileVectorIndex;
use crate::model::{Chunk, ChunkId, Memory, MemoryId};
use crate::traits::{MetadataStore, StoreBackend};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

pub const METADATA_FILE: &str = "memory.db";
pub const INDEX_FILE: &str = "vector_index.json";

const MEMORY_COLUMNS: &str = "id, domain, content, source, importance, revision, chunk_count, \
                              metadata, created_at_us, updated_at_us";
const CHUNK_COLUMNS: &str = "chunk_id, memory_id, chunk_index, text, overlap, indexed";

/// Shortest query the trigram tokenizer can match.
const TRIGRAM_MIN_CHARS: usize = 3;

/// SQLite-backed metadata store.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to open sqlite: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database; one connection that never expires.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Backend(format!("invalid sqlite url: {e}")))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to open sqlite: {e}")))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                content TEXT NOT NULL,
                source TEXT,
                importance REAL NOT NULL,
                revision INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                created_at_us INTEGER NOT NULL,
                updated_at_us INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_memories_recency ON memories (domain, updated_at_us DESC)",
            "CREATE INDEX IF NOT EXISTS idx_memories_source ON memories (source)",
            "CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories (importance)",
            r#"
            CREATE TABLE IF NOT EXISTS memory_chunks (
                chunk_id TEXT PRIMARY KEY,
                memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
                domain TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                overlap TEXT NOT NULL,
                indexed INTEGER NOT NULL DEFAULT 0,
                UNIQUE (memory_id, chunk_index)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chunks_pending ON memory_chunks (domain, indexed)",
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                content,
                content='memories',
                content_rowid='rowid',
                tokenize='trigram'
            )
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS memories_fts_insert AFTER INSERT ON memories BEGIN
                INSERT INTO memories_fts (rowid, content) VALUES (new.rowid, new.content);
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS memories_fts_delete AFTER DELETE ON memories BEGIN
                INSERT INTO memories_fts (memories_fts, rowid, content)
                VALUES ('delete', old.rowid, old.content);
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS memories_fts_update AFTER UPDATE OF content ON memories BEGIN
                INSERT INTO memories_fts (memories_fts, rowid, content)
                VALUES ('delete', old.rowid, old.content);
                INSERT INTO memories_fts (rowid, content) VALUES (new.rowid, new.content);
            END
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
}

/// Simple backend rooted at `data_dir`: SQLite metadata, a JSON snapshot
/// vector index and one implicit domain.
pub async fn open_simple_backend(
    data_dir: impl AsRef<Path>,
    domain: DomainName,
) -> StoreResult<StoreBackend> {
    let data_dir = data_dir.as_ref();
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to create {}: {e}", data_dir.display())))?;
    let metadata = SqliteMetadataStore::open(data_dir.join(METADATA_FILE)).await?;
    let vectors = FileVectorIndex::open(data_dir.join(INDEX_FILE), false).await?;
    Ok(StoreBackend::new(
        Arc::new(metadata),
        Arc::new(vectors),
        Arc::new(SingleDomainRegistry::new(domain)),
    ))
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp {value} out of range")))
}

/// Quote `query` as a single FTS5 phrase so operators in user text are inert.
fn fts_phrase(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

fn to_i64(value: usize) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::invalid("limit too large"))
}

fn memory_row(row: SqliteRow) -> StoreResult<Memory> {
    let domain: String = row.try_get("domain").map_err(backend)?;
    let metadata: String = row.try_get("metadata").map_err(backend)?;
    let metadata: serde_json::Value = serde_json::from_str(&metadata)?;
    let importance: f64 = row.try_get("importance").map_err(backend)?;
    let revision: i64 = row.try_get("revision").map_err(backend)?;
    let chunk_count: i64 = row.try_get("chunk_count").map_err(backend)?;
    Ok(Memory {
        id: MemoryId::new(row.try_get::<String, _>("id").map_err(backend)?),
        domain: DomainName::parse(&domain)?,
        content: row.try_get("content").map_err(backend)?,
        source: row.try_get("source").map_err(backend)?,
        importance: importance as f32,
        revision: u32::try_from(revision)
            .map_err(|_| StoreError::Serialization(format!("invalid revision {revision}")))?,
        chunk_count: u32::try_from(chunk_count)
            .map_err(|_| StoreError::Serialization(format!("invalid chunk count {chunk_count}")))?,
        attributes: Memory::attributes_from_metadata(metadata),
        created_at: from_micros(row.try_get("created_at_us").map_err(backend)?)?,
        updated_at: from_micros(row.try_get("updated_at_us").map_err(backend)?)?,
    })
}

fn chunk_row(row: SqliteRow) -> StoreResult<Chunk> {
    let chunk_index: i64 = row.try_get("chunk_index").map_err(backend)?;
    let indexed: i64 = row.try_get("indexed").map_err(backend)?;
    Ok(Chunk {
        chunk_id: ChunkId(row.try_get("chunk_id").map_err(backend)?),
        memory_id: MemoryId::new(row.try_get::<String, _>("memory_id").map_err(backend)?),
        chunk_index: u32::try_from(chunk_index)
            .map_err(|_| StoreError::Serialization(format!("invalid chunk index {chunk_index}")))?,
        text: row.try_get("text").map_err(backend)?,
        overlap: row.try_get("overlap").map_err(backend)?,
        indexed: indexed != 0,
    })
}

async fn insert_chunks(
    conn: &mut sqlx::SqliteConnection,
    domain: &DomainName,
    chunks: &[Chunk],
) -> StoreResult<()> {
    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO memory_chunks (chunk_id, memory_id, domain, chunk_index, text, overlap, indexed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.chunk_id.as_str())
        .bind(chunk.memory_id.as_str())
        .bind(domain.as_str())
        .bind(i64::from(chunk.chunk_index))
        .bind(chunk.text.as_str())
        .bind(chunk.overlap.as_str())
        .bind(i64::from(chunk.indexed))
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert_memory(&self, memory: &Memory, chunks: &[Chunk]) -> StoreResult<()> {
        let metadata = serde_json::to_string(&memory.metadata())?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO memories
                (id, domain, content, source, importance, revision, chunk_count, metadata, created_at_us, updated_at_us)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(memory.id.as_str())
        .bind(memory.domain.as_str())
        .bind(memory.content.as_str())
        .bind(memory.source.as_deref())
        .bind(f64::from(memory.importance))
        .bind(i64::from(memory.revision))
        .bind(i64::from(memory.chunk_count))
        .bind(metadata)
        .bind(micros(memory.created_at))
        .bind(micros(memory.updated_at))
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
        let metadata = serde_json::to_string(&memory.metadata())?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let result = sqlx::query(
            r#"
            UPDATE memories
               SET content = ?, importance = ?, revision = ?, chunk_count = ?,
                   metadata = ?, updated_at_us = ?
             WHERE id = ? AND domain = ? AND revision = ?
            "#,
        )
        .bind(memory.content.as_str())
        .bind(f64::from(memory.importance))
        .bind(i64::from(memory.revision))
        .bind(i64::from(memory.chunk_count))
        .bind(metadata)
        .bind(micros(memory.updated_at))
        .bind(memory.id.as_str())
        .bind(memory.domain.as_str())
        .bind(i64::from(memory.revision) - 1)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM memories WHERE id = ? AND domain = ?")
                .bind(memory.id.as_str())
                .bind(memory.domain.as_str())
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

        let removed: Vec<ChunkId> = sqlx::query("SELECT chunk_id FROM memory_chunks WHERE memory_id = ?")
            .bind(memory.id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?
            .into_iter()
            .map(|row| row.try_get::<String, _>("chunk_id").map(ChunkId).map_err(backend))
            .collect::<StoreResult<_>>()?;

        sqlx::query("DELETE FROM memory_chunks WHERE memory_id = ?")
            .bind(memory.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        insert_chunks(&mut *tx, &memory.domain, chunks).await?;

        tx.commit().await.map_err(backend)?;
        Ok(removed)
    }

    async fn update_memory(&self, memory: &Memory) -> StoreResult<()> {
        let metadata = serde_json::to_string(&memory.metadata())?;
        let result = sqlx::query(
            r#"
            UPDATE memories
               SET importance = ?, metadata = ?, updated_at_us = ?
             WHERE id = ? AND domain = ?
            "#,
        )
        .bind(f64::from(memory.importance))
        .bind(metadata)
        .bind(micros(memory.updated_at))
        .bind(memory.id.as_str())
        .bind(memory.domain.as_str())
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
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ? AND domain = ?");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(domain.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(memory_row).transpose()
    }

    async fn get_memories(
        &self,
        domain: &DomainName,
        ids: &[MemoryId],
    ) -> StoreResult<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE domain = "
        ));
        qb.push_bind(domain.as_str().to_string());
        qb.push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str().to_string());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;
        rows.into_iter().map(memory_row).collect()
    }

    async fn chunks_for(&self, domain: &DomainName, id: &MemoryId) -> StoreResult<Vec<Chunk>> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM memory_chunks WHERE memory_id = ? AND domain = ? ORDER BY chunk_index"
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(domain.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(chunk_row).collect()
    }

    async fn get_chunks(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CHUNK_COLUMNS} FROM memory_chunks WHERE domain = "
        ));
        qb.push_bind(domain.as_str().to_string());
        qb.push(" AND chunk_id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str().to_string());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(backend)?;
        rows.into_iter().map(chunk_row).collect()
    }

    async fn lexical_search(
        &self,
        domain: &DomainName,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Memory>> {
        let (filter, pattern) = if query.chars().count() >= TRIGRAM_MIN_CHARS {
            (
                "rowid IN (SELECT rowid FROM memories_fts WHERE memories_fts MATCH ?)",
                fts_phrase(query),
            )
        } else {
            ("instr(lower(content), lower(?)) > 0", query.to_string())
        };
        let sql = format!(
            r#"
            SELECT {MEMORY_COLUMNS}
              FROM memories
             WHERE domain = ? AND {filter}
             ORDER BY updated_at_us DESC, id ASC
             LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(domain.as_str())
            .bind(pattern)
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(memory_row).collect()
    }

    async fn list_recent(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Memory>> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE domain = ? ORDER BY updated_at_us DESC, id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(domain.as_str())
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(memory_row).collect()
    }

    async fn mark_indexed(&self, domain: &DomainName, ids: &[ChunkId]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut qb =
            QueryBuilder::<Sqlite>::new("UPDATE memory_chunks SET indexed = 1 WHERE domain = ");
        qb.push_bind(domain.as_str().to_string());
        qb.push(" AND chunk_id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str().to_string());
        }
        separated.push_unseparated(")");

        qb.build().execute(&self.pool).await.map_err(backend)?;
        Ok(())
    }

    async fn pending_chunks(&self, domain: &DomainName, limit: usize) -> StoreResult<Vec<Chunk>> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM memory_chunks WHERE domain = ? AND indexed = 0 ORDER BY chunk_id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(domain.as_str())
            .bind(to_i64(limit)?)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(chunk_row).collect()
    }

    async fn chunk_ids(&self, domain: &DomainName) -> StoreResult<Vec<ChunkId>> {
        let rows = sqlx::query("SELECT chunk_id FROM memory_chunks WHERE domain = ? ORDER BY chunk_id")
            .bind(domain.as_str())
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::{Map, Value};

    fn memory(id: &str, content: &str, age_secs: i64) -> Memory {
        let at = Utc::now() - Duration::seconds(age_secs);
        let mut attributes = Map::new();
        attributes.insert("topic".to_string(), Value::from("prefs"));
        Memory {
            id: MemoryId::new(id),
            domain: DomainName::default_domain(),
            content: content.to_string(),
            source: Some("test".to_string()),
            importance: 0.25,
            revision: 0,
            chunk_count: 1,
            attributes,
            created_at: at,
            updated_at: at,
        }
    }

    fn chunks_of(memory: &Memory, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| Chunk {
                chunk_id: ChunkId::derive(&memory.id, memory.revision, i as u32),
                memory_id: memory.id.clone(),
                chunk_index: i as u32,
                text: text.to_string(),
                overlap: String::new(),
                indexed: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn memory_round_trips_through_sqlite() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        let m = memory("mem_a", "The user prefers Rust", 0);
        store
            .insert_memory(&m, &chunks_of(&m, &["The user ", "prefers Rust"]))
            .await
            .unwrap();

        let domain = DomainName::default_domain();
        let loaded = store.get_memory(&domain, &m.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, m.content);
        assert_eq!(loaded.source.as_deref(), Some("test"));
        assert_eq!(loaded.attributes["topic"], "prefs");
        assert_eq!(loaded.updated_at.timestamp_micros(), m.updated_at.timestamp_micros());

        let chunks = store.chunks_for(&domain, &m.id).await.unwrap();
        let indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn lexical_search_matches_substring_newest_first() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        for (id, content, age) in [
            ("mem_1", "Rust is great", 30),
            ("mem_2", "I write rust daily", 10),
            ("mem_3", "Go is fine", 0),
        ] {
            let m = memory(id, content, age);
            store.insert_memory(&m, &chunks_of(&m, &[content])).await.unwrap();
        }

        let hits = store
            .lexical_search(&DomainName::default_domain(), "Rust", 5)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mem_2", "mem_1"]);
    }

    #[tokio::test]
    async fn replace_content_is_atomic_and_reports_removed_chunks() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        let original = memory("mem_a", "old text", 0);
        let old_chunks = chunks_of(&original, &["old ", "text"]);
        store.insert_memory(&original, &old_chunks).await.unwrap();

        let mut updated = original.clone();
        updated.content = "new text".to_string();
        updated.revision = 1;
        let new_chunks = chunks_of(&updated, &["new text"]);
        let removed = store.replace_content(&updated, &new_chunks).await.unwrap();
        assert_eq!(removed.len(), 2);

        let domain = DomainName::default_domain();
        let chunks = store.chunks_for(&domain, &original.id).await.unwrap();
        assert_eq!(chunks, new_chunks);
        assert!(store
            .get_chunks(&domain, &[old_chunks[0].chunk_id.clone()])
            .await
            .unwrap()
            .is_empty());

        let ghost = memory("mem_ghost", "x", 0);
        let err = store
            .replace_content(&ghost, &chunks_of(&ghost, &["x"]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn replace_content_rejects_stale_revision() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        let original = memory("mem_a", "old text", 0);
        store
            .insert_memory(&original, &chunks_of(&original, &["old text"]))
            .await
            .unwrap();

        let mut winner = original.clone();
        winner.content = "winner".to_string();
        winner.revision = 1;
        let mut loser = winner.clone();
        loser.content = "loser".to_string();

        store
            .replace_content(&winner, &chunks_of(&winner, &["winner"]))
            .await
            .unwrap();
        let err = store
            .replace_content(&loser, &chunks_of(&loser, &["loser"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let domain = DomainName::default_domain();
        let current = store.get_memory(&domain, &original.id).await.unwrap().unwrap();
        assert_eq!(current.content, "winner");
        assert_eq!(store.chunks_for(&domain, &original.id).await.unwrap()[0].text, "winner");
    }

    #[tokio::test]
    async fn lexical_search_uses_trigram_index_and_follows_updates() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        let domain = DomainName::default_domain();
        let m = memory("mem_a", "Ported the PARSER to Rust", 0);
        store.insert_memory(&m, &chunks_of(&m, &[m.content.as_str()])).await.unwrap();
        let other = memory("mem_b", "Go is fine", 5);
        store
            .insert_memory(&other, &chunks_of(&other, &[other.content.as_str()]))
            .await
            .unwrap();

        let hits = store.lexical_search(&domain, "arser", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, m.id);

        // Below trigram length the scan path still matches case-insensitively.
        let hits = store.lexical_search(&domain, "GO", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, other.id);

        // FTS operators in user text are matched literally.
        assert!(store
            .lexical_search(&domain, "parser OR \"go\"", 5)
            .await
            .unwrap()
            .is_empty());

        let mut updated = m.clone();
        updated.content = "Rewrote the lexer".to_string();
        updated.revision = 1;
        store
            .replace_content(&updated, &chunks_of(&updated, &["Rewrote the lexer"]))
            .await
            .unwrap();
        assert!(store.lexical_search(&domain, "parser", 5).await.unwrap().is_empty());
        let hits = store.lexical_search(&domain, "LEXER", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, m.id);
    }

    #[tokio::test]
    async fn mark_indexed_clears_pending() {
        let store = SqliteMetadataStore::open_in_memory().await.unwrap();
        let m = memory("mem_a", "abc", 0);
        let chunks = chunks_of(&m, &["a", "bc"]);
        store.insert_memory(&m, &chunks).await.unwrap();
        let domain = DomainName::default_domain();

        store
            .mark_indexed(&domain, &[chunks[0].chunk_id.clone()])
            .await
            .unwrap();
        let pending = store.pending_chunks(&domain, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chunk_id, chunks[1].chunk_id);
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        let m = memory("mem_a", "durable", 0);
        {
            let store = SqliteMetadataStore::open(&path).await.unwrap();
            store.insert_memory(&m, &chunks_of(&m, &["durable"])).await.unwrap();
            store.close().await.unwrap();
        }
        let store = SqliteMetadataStore::open(&path).await.unwrap();
        let recent = store
            .list_recent(&DomainName::default_domain(), 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "durable");
    }
}
