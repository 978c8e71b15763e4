//! Recall memory store engine.
//!
//! This crate persists free-text memories for agents and retrieves them by
//! semantic relevance:
//! - boundary-aware chunking with overlap windows
//! - an embedding port with HTTP adapters and a lexical-only fallback
//! - a metadata store and a vector index kept consistent by the coordinator
//! - isolated memory domains provisioned on demand
//!
//! Design stance:
//! - Metadata is the source of truth and is written first.
//! - The vector index is a best-effort mirror repaired by `reconcile`.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod chunker;
mod coordinator;
pub mod domain;
pub mod embedding;
mod error;
pub mod flat_index;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod ranking;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

pub use chunker::{chunk, Chunker, ChunkerConfig, TextChunk};
pub use coordinator::{
    CoordinatorConfig, HitSignal, MemoryCoordinator, MemoryHit, ReconcileReport, SearchMode,
    SearchOutcome, SearchRequest, StoreReceipt, StoreWarning, UpdateReceipt,
};
pub use domain::{DomainName, InMemoryDomainRegistry, SingleDomainRegistry, DEFAULT_DOMAIN};
pub use embedding::{DisabledEmbedder, OllamaEmbedder, OpenAiCompatibleEmbedder, ProbeStatus};
pub use error::{EmbeddingError, StoreError, StoreResult};
pub use flat_index::FileVectorIndex;
pub use memory::{in_memory_backend, InMemoryMetadataStore, InMemoryVectorIndex};
pub use model::{
    Chunk, ChunkId, Memory, MemoryId, MemoryUpdate, MemoryWithChunks, NewMemory, VectorEntry,
    VectorHit, DEFAULT_IMPORTANCE, RESERVED_METADATA_KEYS,
};
pub use traits::{DomainRegistry, EmbeddingProvider, MetadataStore, StoreBackend, VectorIndex};
