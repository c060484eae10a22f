//! Server setup and initialization
//!
//! Wires together schema storage, the registry, the graph store, the script
//! evaluator and the HTTP routes.

use crate::{
    api::{create_routes, AppState},
    config::Config,
    graph::{LocalStorageProvider, MemoryGraph, StorageProviders},
    schema::{SchemaRegistry, SchemaStorage},
    script::{ChannelBroadcaster, Scripting},
};
use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

/// Capacity of the scripting error broadcast channel
const BROADCAST_CAPACITY: usize = 256;

/// Initialize every component and return the shared handler state
pub async fn create_state(config: &Config) -> Result<AppState> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    tracing::info!("🗄️ Opening schema database");
    let options = SqliteConnectOptions::new()
        .filename(Path::new(&config.database.data_dir).join("schema.db"))
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open schema database: {}", e))?;

    tracing::info!("📊 Initializing schema registry");
    let registry = SchemaRegistry::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to compile built-in schema: {}", e))?
        .with_storage(SchemaStorage::new(pool));
    registry.init_from_storage().await?;
    let registry = Arc::new(registry);

    tracing::info!("📣 Starting scripting error broadcaster");
    let broadcaster = ChannelBroadcaster::new(BROADCAST_CAPACITY);
    let mut errors = broadcaster.subscribe();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(message) => tracing::debug!(
                    "📣 Scripting error for session {}: {}",
                    message.session_id.as_deref().unwrap_or("-"),
                    message.event.message.as_deref().unwrap_or_default()
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("⚠️ Error listener skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("⚙️ Initializing script evaluator");
    let scripting = Scripting::new(config)?
        .with_schema(Arc::clone(&registry))
        .with_broadcaster(Arc::new(broadcaster));

    let graph = Arc::new(MemoryGraph::new());
    let mut changes = graph.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(ids) => tracing::debug!("🔔 Committed changes: {}", ids.join(", ")),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("⚠️ Change listener skipped {} commits", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let files = StorageProviders::new(Box::new(LocalStorageProvider::new(&config.database.data_dir)));

    Ok(AppState {
        registry,
        graph,
        scripting: Arc::new(scripting),
        files: Arc::new(files),
    })
}

/// Create the main Axum application with all routes
pub async fn create_app(config: &Config) -> Result<Router> {
    let state = create_state(config).await?;

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = create_routes().with_state(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting strata server...");

    let app = create_app(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
