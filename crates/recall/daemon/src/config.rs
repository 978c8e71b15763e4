//! Configuration for recalld

use recall_store::embedding::{
    DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL, DEFAULT_OLLAMA_URL,
};
use recall_store::{ChunkerConfig, CoordinatorConfig, DEFAULT_DOMAIN, DEFAULT_IMPORTANCE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name reported to clients on initialize
    #[serde(default = "default_server_name")]
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// SQLite metadata plus a file-persisted vector index, one domain
    Sqlite {
        /// Directory holding `memory.db` and `vector_index.json`
        #[serde(default = "default_data_dir")]
        data_dir: PathBuf,
    },

    /// PostgreSQL with pgvector, one table pair per domain
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,

        /// Domain used when a request names none
        #[serde(default = "default_domain")]
        default_domain: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Sqlite { .. } => "sqlite",
            StorageConfig::Postgres { .. } => "postgres",
        }
    }

    pub fn default_domain(&self) -> &str {
        match self {
            StorageConfig::Sqlite { .. } => DEFAULT_DOMAIN,
            StorageConfig::Postgres { default_domain, .. } => default_domain,
        }
    }
}

/// Which embedding service to call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    #[default]
    Ollama,
    Openai,
    Disabled,
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,

    #[serde(default = "default_embedding_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Bearer token for OpenAI-compatible servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Vector length; sizes the pgvector column
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            base_url: default_embedding_url(),
            model: default_embedding_model(),
            api_key: None,
            dimensions: default_dimensions(),
            timeout_ms: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_overfetch")]
    pub overfetch_factor: usize,

    #[serde(default)]
    pub lexical_baseline: f32,

    #[serde(default = "default_importance_weight")]
    pub importance_weight: f32,

    #[serde(default = "default_importance")]
    pub default_importance: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            overfetch_factor: default_overfetch(),
            lexical_baseline: 0.0,
            importance_weight: default_importance_weight(),
            default_importance: default_importance(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_server_name() -> String {
    "Local Context Memory".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_embedding_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}

fn default_embedding_timeout() -> u64 {
    10_000
}

fn default_max_chunk_chars() -> usize {
    1000
}

fn default_overlap_chars() -> usize {
    100
}

fn default_limit() -> usize {
    5
}

fn default_overfetch() -> usize {
    3
}

fn default_importance_weight() -> f32 {
    0.01
}

fn default_importance() -> f32 {
    DEFAULT_IMPORTANCE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `RECALL_*` environment variables (`__` separates sections).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RECALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Engine knobs derived from this configuration.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            chunking: ChunkerConfig {
                max_chunk_chars: self.chunking.max_chunk_chars,
                overlap_chars: self.chunking.overlap_chars,
            },
            embed_timeout: self.embedding.timeout(),
            overfetch_factor: self.search.overfetch_factor,
            lexical_baseline: self.search.lexical_baseline,
            importance_weight: self.search.importance_weight,
            default_importance: self.search.default_importance,
            default_domain: self.storage.default_domain().to_string(),
            ..CoordinatorConfig::default()
        }
    }
}
