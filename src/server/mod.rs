// HTTP server for the charm store API
//
// Requests reach axum through a single catch-all route and are then
// dispatched by the store's own `Router` (see `routes.rs`).

mod config;
mod facets;
mod handle_archive;
mod handle_content;
mod handle_meta;
mod handle_status;
mod routes;
mod startup;
mod utils;

use crate::blobstore::BlobStore;
use crate::entity::EntityStore;
use crate::meta::MetaEngine;
use crate::reference::EntityReference;
use crate::router;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;

pub use config::ServerConfig;
pub use facets::default_registry;
pub use routes::{api_router, create_router};
pub use startup::{build_state, serve, start_server};
pub use utils::parse_duration;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<EntityStore>,
    pub blobs: Arc<BlobStore>,
    pub engine: Arc<MetaEngine>,
    pub api: Arc<router::Router<ServerState>>,
    pub config: ServerConfig,
    pub start_time: Instant,
}

impl ServerState {
    /// Resolve a possibly partial reference to the concrete entity id
    pub async fn resolve(&self, id: &EntityReference) -> Result<EntityReference> {
        let store = Arc::clone(&self.store);
        let id = id.clone();
        utils::run_blocking(move || store.resolve(&id)).await
    }
}
