//! Backend wiring: storage, embedder and the coordinator that owns them.

use crate::config::{DaemonConfig, EmbeddingConfig, EmbeddingProviderKind, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use recall_store::{
    DisabledEmbedder, EmbeddingProvider, MemoryCoordinator, OllamaEmbedder,
    OpenAiCompatibleEmbedder, ProbeStatus, StoreBackend,
};
use std::path::Path;
use std::sync::Arc;

/// Open storage, set up the embedder and build the one coordinator the
/// process shares.
pub async fn build_coordinator(config: &DaemonConfig) -> DaemonResult<Arc<MemoryCoordinator>> {
    let backend = open_storage(config).await?;
    let embedder = build_embedder(&config.embedding).await?;
    let coordinator = MemoryCoordinator::new(backend, embedder, config.coordinator_config())?;
    tracing::info!(
        storage = config.storage.kind(),
        model = coordinator.embedding_model(),
        multi_domain = coordinator.is_multi_domain(),
        "Memory store ready"
    );
    Ok(Arc::new(coordinator))
}

async fn open_storage(config: &DaemonConfig) -> DaemonResult<StoreBackend> {
    match &config.storage {
        StorageConfig::Sqlite { data_dir } => open_sqlite(data_dir).await,
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
            ..
        } => {
            open_postgres(
                url,
                config.embedding.dimensions,
                *max_connections,
                *connect_timeout_secs,
            )
            .await
        }
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(data_dir: &Path) -> DaemonResult<StoreBackend> {
    let backend =
        recall_store::sqlite::open_simple_backend(data_dir, recall_store::DomainName::default_domain())
            .await?;
    tracing::info!(data_dir = %data_dir.display(), "Opened SQLite memory store");
    Ok(backend)
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_data_dir: &Path) -> DaemonResult<StoreBackend> {
    Err(DaemonError::Config(
        "recalld was built without the sqlite feature".to_string(),
    ))
}

#[cfg(feature = "postgres")]
async fn open_postgres(
    url: &str,
    dimensions: usize,
    max_connections: u32,
    connect_timeout_secs: u64,
) -> DaemonResult<StoreBackend> {
    let backend = recall_store::postgres::PostgresBackend::connect_with_options(
        url,
        dimensions,
        max_connections,
        connect_timeout_secs,
    )
    .await?;
    tracing::info!(dimensions, max_connections, "Connected to PostgreSQL memory store");
    Ok(backend.into_backend())
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(
    _url: &str,
    _dimensions: usize,
    _max_connections: u32,
    _connect_timeout_secs: u64,
) -> DaemonResult<StoreBackend> {
    Err(DaemonError::Config(
        "recalld was built without the postgres feature".to_string(),
    ))
}

/// Build the configured embedder. An unreachable service is not fatal: the
/// store starts in lexical-only mode and recovers once the service answers.
pub async fn build_embedder(config: &EmbeddingConfig) -> DaemonResult<Arc<dyn EmbeddingProvider>> {
    let embedding_error = |e: recall_store::EmbeddingError| DaemonError::Embedding(e.to_string());
    match config.provider {
        EmbeddingProviderKind::Ollama => {
            let embedder = OllamaEmbedder::new(&config.base_url, &config.model, config.timeout())
                .map_err(embedding_error)?;
            match embedder.probe().await {
                ProbeStatus::Ready => {
                    tracing::info!(model = %config.model, url = %config.base_url, "Ollama embeddings ready")
                }
                ProbeStatus::ModelMissing { installed } => tracing::warn!(
                    model = %config.model,
                    ?installed,
                    "Embedding model is not pulled; run `ollama pull {}`",
                    config.model
                ),
                ProbeStatus::Unreachable(reason) => tracing::warn!(
                    url = %config.base_url,
                    %reason,
                    "Ollama unreachable, starting in lexical-only mode"
                ),
            }
            Ok(Arc::new(embedder))
        }
        EmbeddingProviderKind::Openai => {
            let embedder = OpenAiCompatibleEmbedder::new(
                &config.base_url,
                &config.model,
                config.api_key.clone(),
                config.timeout(),
            )
            .map_err(embedding_error)?;
            tracing::info!(model = %config.model, url = %config.base_url, "OpenAI-compatible embeddings configured");
            Ok(Arc::new(embedder))
        }
        EmbeddingProviderKind::Disabled => {
            tracing::info!("Embeddings disabled, lexical-only mode");
            Ok(Arc::new(DisabledEmbedder))
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use recall_store::NewMemory;

    #[tokio::test]
    async fn builds_sqlite_store_without_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.storage = StorageConfig::Sqlite {
            data_dir: dir.path().join("data"),
        };
        config.embedding.provider = EmbeddingProviderKind::Disabled;

        let coordinator = build_coordinator(&config).await.unwrap();
        assert!(!coordinator.is_multi_domain());
        assert_eq!(coordinator.embedding_model(), "disabled");

        coordinator.store(NewMemory::new("hello")).await.unwrap();
        coordinator.close().await.unwrap();
        assert!(dir.path().join("data").join("memory.db").exists());
    }

    #[tokio::test]
    async fn unreachable_ollama_is_not_fatal() {
        let mut config = EmbeddingConfig::default();
        config.base_url = "http://127.0.0.1:9".to_string();
        config.timeout_ms = 200;
        let embedder = build_embedder(&config).await.unwrap();
        assert_eq!(embedder.model(), "nomic-embed-text");
    }
}
