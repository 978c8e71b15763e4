//! Recall Daemon - persistent semantic memory for agents
//!
//! The daemon provides:
//! - Memory tools, a `memory://` resource and a summarisation prompt
//! - SQLite or PostgreSQL storage with a vector index
//! - Lexical-only operation while the embedding service is down

use clap::{Parser, ValueEnum};
use recall_daemon::config::StorageConfig;
use recall_daemon::{build_coordinator, DaemonConfig, DaemonError, DaemonResult, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Sqlite,
    Postgres,
}

/// Recall Daemon CLI
#[derive(Parser)]
#[command(name = "recalld")]
#[command(about = "Recall Daemon - persistent semantic memory for agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RECALL_CONFIG")]
    config: Option<String>,

    /// Log level (overrides the configured level; RUST_LOG wins over both)
    #[arg(long, env = "RECALL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "RECALL_LOG_JSON")]
    json: bool,

    /// Storage backend override
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// PostgreSQL URL, used with `--backend postgres`
    #[arg(long, env = "RECALL_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Initialize tracing; stdout carries protocol frames, so logs go to stderr
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Override with CLI args
    apply_backend_override(&mut config, cli.backend, cli.database_url)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = config.storage.kind(),
        embedding = ?config.embedding.provider,
        "Starting recalld"
    );

    let coordinator = build_coordinator(&config).await?;
    Server::new(&config, coordinator).run().await
}

fn apply_backend_override(
    config: &mut DaemonConfig,
    backend: Option<BackendKind>,
    database_url: Option<String>,
) -> DaemonResult<()> {
    match (backend, config.storage.kind()) {
        (Some(BackendKind::Sqlite), "postgres") => {
            config.storage = StorageConfig::default();
        }
        (Some(BackendKind::Postgres), "sqlite") => {
            let url = database_url.clone().ok_or_else(|| {
                DaemonError::Config(
                    "--backend postgres needs --database-url or RECALL_DATABASE_URL".to_string(),
                )
            })?;
            config.storage = StorageConfig::Postgres {
                url,
                max_connections: 10,
                connect_timeout_secs: 5,
                default_domain: recall_store::DEFAULT_DOMAIN.to_string(),
            };
        }
        _ => {}
    }

    if let (Some(url), StorageConfig::Postgres { url: current, .. }) =
        (database_url, &mut config.storage)
    {
        *current = url;
    }
    Ok(())
}
