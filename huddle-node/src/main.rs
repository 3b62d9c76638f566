//! huddle-node - realtime collaboration node
//!
//! Loads configuration, opens the shared store, serves the HTTP API and runs
//! background maintenance until Ctrl+C or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use huddle_common::config::HuddleConfig;
use huddle_common::store::{ResilientStore, RetryPolicy, SqliteStore, Stores};
use huddle_node::maintenance::BackgroundTasks;
use huddle_node::{build_router, AppState};

/// Command-line arguments for huddle-node
#[derive(Parser, Debug)]
#[command(name = "huddle-node")]
#[command(about = "Realtime collaboration node")]
#[command(version)]
struct Args {
    /// Configuration file (overrides HUDDLE_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "HUDDLE_PORT")]
    port: Option<u16>,

    /// Node id stamped on authored events
    #[arg(long, env = "HUDDLE_NODE_ID")]
    node_id: Option<String>,

    /// SQLite database shared with the other nodes on this host
    #[arg(long, env = "HUDDLE_DATABASE")]
    database: Option<PathBuf>,

    /// Use the in-process store even if a database is configured
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config =
        HuddleConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("huddle_node={0},huddle_common={0},tower_http=info", config.logging.level)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting huddle-node v{}", env!("CARGO_PKG_VERSION"));

    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(path) = args.database {
        config.store.database_path = Some(path);
    }
    let node_id = args
        .node_id
        .or_else(|| config.node.node_id.clone())
        .unwrap_or_else(|| format!("node-{}", Uuid::new_v4().simple()));
    info!("Node id: {}", node_id);

    let stores = open_stores(&config, args.memory_store).await?;
    let addr: SocketAddr = format!("{}:{}", config.node.bind_host, config.node.port)
        .parse()
        .context("Invalid bind address")?;

    let state = AppState::new(config, node_id, stores);
    let tasks = BackgroundTasks::spawn(&state);
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("huddle-node listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Ends push streams so the server can drain
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    tasks.join().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn open_stores(config: &HuddleConfig, force_memory: bool) -> Result<Stores> {
    let policy = RetryPolicy::from_config(&config.store);
    match (&config.store.database_path, force_memory) {
        (Some(path), false) => {
            info!("Store database: {}", path.display());
            let sqlite = SqliteStore::open(
                path,
                std::time::Duration::from_millis(config.store.busy_timeout_ms),
            )
            .await
            .context("Failed to open store database")?;
            Ok(Stores::new(ResilientStore::new(sqlite, policy)))
        }
        _ => {
            warn!("Using the in-process store; state is not shared with other nodes");
            Ok(Stores::new(ResilientStore::new(
                huddle_common::store::MemoryStore::new(),
                policy,
            )))
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
