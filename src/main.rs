//! replistore server binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use replistore::config::{load_config, Config};
use replistore::metrics::{describe_metrics, init_metrics};
use replistore::replication::state::ReplicationState;
use replistore::server::build_router;
use replistore::store::engine::StoreEngine;
use replistore::store::memory::MemoryStore;
use replistore::store::sqlite::SqliteStore;
use replistore::AppState;

#[derive(Debug, Parser)]
#[command(name = "replistore", about = "Replicated key-value store server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Override the listen address (`host:port`).
    #[arg(long)]
    bind: Option<String>,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn StoreEngine>> {
    match config.store.engine.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "sqlite" => {
            let store = SqliteStore::new(&config.store.sqlite.path)
                .with_context(|| format!("opening sqlite store at {}", config.store.sqlite.path))?;
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("unknown store engine `{other}` (expected memory or sqlite)"),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    init_tracing(&config);

    if config.observability.metrics {
        init_metrics();
        describe_metrics();
    }

    let store = build_store(&config)?;
    let replication = ReplicationState::bootstrap(&config, store)
        .context("bootstrapping replication state")?;
    let mut fatal = replication.fatal_watch();

    let state = AppState {
        config: Arc::new(config.clone()),
        replication: replication.clone(),
    };
    let app = build_router(state);

    let addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.api_port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(addr, node = %replication.node(), "replistore listening");

    let shutdown_replication = replication.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
            _ = fatal.wait_for(|halted| *halted) => {
                error!("apply pipeline halted; stopping server");
            }
        }
        shutdown_replication.shutdown();
    });

    server.await.context("http server error")?;

    // The router is down; finish draining the replication layer.
    replication.shutdown();
    let teardown = tokio::time::timeout(
        std::time::Duration::from_secs(config.server.shutdown_timeout),
        replication.join(),
    )
    .await;

    match teardown {
        Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "replication layer halted abnormally");
            std::process::exit(1);
        }
        Err(_) => {
            error!("replication layer did not stop within the shutdown timeout");
            std::process::exit(1);
        }
    }
}
