use crate::domain::DomainName;
use crate::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Importance assigned when the caller does not provide one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

/// Metadata keys owned by the engine. Callers cannot set them as attributes.
pub const RESERVED_METADATA_KEYS: [&str; 6] = [
    "source",
    "importance",
    "revision",
    "chunk_count",
    "created_at",
    "updated_at",
];

/// Stable memory identifier, assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub String);

impl MemoryId {
    pub fn generate() -> Self {
        Self(format!("mem_{}", Uuid::new_v4().simple()))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chunk identifier derived from the owning memory, its content revision and
/// the chunk position. A content update bumps the revision, so chunk ids
/// never survive a rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub String);

impl ChunkId {
    pub fn derive(memory_id: &MemoryId, revision: u32, chunk_index: u32) -> Self {
        Self(format!("{}:{}:{}", memory_id, revision, chunk_index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical unit of stored knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub domain: DomainName,
    pub content: String,
    pub source: Option<String>,
    pub importance: f32,
    /// Content revision; starts at 0 and increments on every content update.
    pub revision: u32,
    pub chunk_count: u32,
    /// Caller-supplied metadata keys beyond the structured fields.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    /// Structured metadata as persisted next to the content.
    pub fn metadata(&self) -> Value {
        let mut object = self.attributes.clone();
        object.insert(
            "source".to_string(),
            self.source.clone().map(Value::String).unwrap_or(Value::Null),
        );
        object.insert("importance".to_string(), Value::from(self.importance));
        object.insert("revision".to_string(), Value::from(self.revision));
        object.insert("chunk_count".to_string(), Value::from(self.chunk_count));
        object.insert(
            "created_at".to_string(),
            Value::String(self.created_at.to_rfc3339()),
        );
        object.insert(
            "updated_at".to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        Value::Object(object)
    }

    /// Caller attributes recovered from a persisted metadata object.
    pub fn attributes_from_metadata(metadata: Value) -> Map<String, Value> {
        match metadata {
            Value::Object(mut object) => {
                for key in RESERVED_METADATA_KEYS {
                    object.remove(key);
                }
                object
            }
            _ => Map::new(),
        }
    }
}

/// A retrievable slice of a memory's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub memory_id: MemoryId,
    pub chunk_index: u32,
    /// Exact partition slice of the memory content.
    pub text: String,
    /// Text immediately preceding `text`, shared with the previous chunk.
    pub overlap: String,
    /// Whether the chunk's vector has been written to the vector index.
    pub indexed: bool,
}

impl Chunk {
    /// Text handed to the embedding port: overlap followed by the slice.
    pub fn window(&self) -> String {
        let mut window = String::with_capacity(self.overlap.len() + self.text.len());
        window.push_str(&self.overlap);
        window.push_str(&self.text);
        window
    }
}

/// A memory together with its current chunk set, ordered by `chunk_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWithChunks {
    pub memory: Memory,
    pub chunks: Vec<Chunk>,
}

impl MemoryWithChunks {
    /// Concatenates chunk slices in order.
    pub fn reconstruct(&self) -> String {
        self.chunks.iter().map(|chunk| chunk.text.as_str()).collect()
    }
}

/// Input for a new memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub domain: Option<String>,
    pub source: Option<String>,
    pub importance: Option<f32>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Partial update of an existing memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub importance: Option<f32>,
    /// Keys merged into the memory's attributes.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl MemoryUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn importance(importance: f32) -> Self {
        Self {
            importance: Some(importance),
            ..Default::default()
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.importance.is_none() && self.attributes.is_empty()
    }
}

/// Vector written to the index for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub chunk_id: ChunkId,
    pub memory_id: MemoryId,
    pub embedding: Vec<f32>,
    /// Owning memory's `updated_at` at write time, used for tie-breaks.
    pub updated_at: DateTime<Utc>,
}

/// Nearest-neighbour result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk_id: ChunkId,
    pub memory_id: MemoryId,
    pub similarity: f32,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn validate_importance(importance: f32) -> StoreResult<f32> {
    if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
        return Err(StoreError::invalid(format!(
            "importance must be within [0, 1], got {importance}"
        )));
    }
    Ok(importance)
}

pub(crate) fn validate_attributes(attributes: &Map<String, Value>) -> StoreResult<()> {
    if let Some(key) = RESERVED_METADATA_KEYS
        .iter()
        .find(|key| attributes.contains_key(**key))
    {
        return Err(StoreError::invalid(format!(
            "metadata key {key:?} is reserved"
        )));
    }
    Ok(())
}

pub(crate) fn validate_content(content: &str) -> StoreResult<()> {
    if content.trim().is_empty() {
        return Err(StoreError::invalid("content must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_change_with_revision() {
        let id = MemoryId::new("mem_a");
        assert_eq!(ChunkId::derive(&id, 0, 2).as_str(), "mem_a:0:2");
        assert_ne!(ChunkId::derive(&id, 0, 0), ChunkId::derive(&id, 1, 0));
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = MemoryId::generate();
        let b = MemoryId::generate();
        assert!(a.as_str().starts_with("mem_"));
        assert_ne!(a, b);
    }

    #[test]
    fn importance_bounds() {
        assert!(validate_importance(0.0).is_ok());
        assert!(validate_importance(1.0).is_ok());
        assert!(validate_importance(1.5).is_err());
        assert!(validate_importance(f32::NAN).is_err());
    }

    #[test]
    fn metadata_keeps_attributes_and_structured_fields() {
        let now = Utc::now();
        let mut attributes = Map::new();
        attributes.insert("topic".to_string(), Value::from("rust"));
        let memory = Memory {
            id: MemoryId::new("mem_a"),
            domain: DomainName::parse("default").unwrap(),
            content: "text".to_string(),
            source: Some("conversation".to_string()),
            importance: 0.75,
            revision: 2,
            chunk_count: 1,
            attributes,
            created_at: now,
            updated_at: now,
        };
        let metadata = memory.metadata();
        assert_eq!(metadata["topic"], "rust");
        assert_eq!(metadata["source"], "conversation");
        assert_eq!(metadata["revision"], 2);
        assert_eq!(metadata["importance"], 0.75);

        let recovered = Memory::attributes_from_metadata(metadata);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered["topic"], "rust");
    }

    #[test]
    fn reserved_attribute_keys_are_rejected() {
        let mut attributes = Map::new();
        attributes.insert("importance".to_string(), Value::from(1));
        assert!(validate_attributes(&attributes).is_err());
        attributes.clear();
        attributes.insert("topic".to_string(), Value::from("x"));
        assert!(validate_attributes(&attributes).is_ok());
    }
}
