// Server startup: open the data directory, wire up the handler tables and serve

use crate::blobstore::BlobStore;
use crate::constants;
use crate::entity::{DocumentStore, EntityStore};
use crate::meta::MetaEngine;
use crate::runtime::ServerRuntime;
use crate::server::{api_router, create_router, default_registry, ServerConfig, ServerState};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

/// Open (creating if needed) the data directory and assemble the shared state
pub fn build_state(config: &ServerConfig) -> Result<ServerState> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create data directory {}", config.dir.display()))?;

    let blobs = BlobStore::open_dir(constants::blob_dir(&config.dir))
        .context("Failed to open blob store")?
        .with_verification(config.verify_hashes);
    let blobs = Arc::new(blobs);
    let store = Arc::new(EntityStore::open(constants::entities_path(&config.dir)).context("Failed to open entity store")?);
    log::debug!("[Startup] Loaded {} entities from {}", store.count(), config.dir.display());

    let registry = default_registry(Arc::clone(&store), Arc::clone(&blobs))?;
    log::debug!("[Startup] Registered {} metadata handlers", registry.len());
    let engine = MetaEngine::new(
        Arc::new(registry),
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        config.meta_policy,
    );
    let api = api_router(config.request_timeout)?;

    Ok(ServerState {
        store,
        blobs,
        engine: Arc::new(engine),
        api: Arc::new(api),
        config: config.clone(),
        start_time: Instant::now(),
    })
}

/// Serve on an already bound listener until `runtime` shuts down
pub async fn serve(listener: TcpListener, state: ServerState, runtime: &ServerRuntime, ctrl_c: bool) -> Result<()> {
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(runtime.create_shutdown_future(ctrl_c))
        .await
        .context("Server error")?;
    log::info!("[Server] Stopped");
    Ok(())
}

/// Main server startup function
pub async fn start_server(config: ServerConfig, runtime: &ServerRuntime, ctrl_c: bool) -> Result<()> {
    let state = build_state(&config)?;

    let addr = config.addr();
    let socket_addr: SocketAddr = addr.parse().context("Invalid address format")?;
    let listener = TcpListener::bind(socket_addr)
        .await
        .context("Failed to bind to address")?;

    display_server_info(&state, &addr);
    serve(listener, state, runtime, ctrl_c).await
}

fn display_server_info(state: &ServerState, addr: &str) {
    let config = &state.config;
    eprintln!("{} HTTP server started", constants::BINARY_NAME);
    eprintln!("  Directory: {}", config.dir.display());
    eprintln!("  Listening: http://{}", addr);
    eprintln!("  Entities: {} stored", state.store.count());
    eprintln!(
        "  Hash verification: {}",
        if config.verify_hashes { "ENABLED" } else { "disabled" }
    );
    eprintln!("  Metadata failures: {:?}", config.meta_policy);
    eprintln!("  Request timeout: {:?}", config.request_timeout);
    eprintln!("\nPress Ctrl+C to stop\n");
}
