// Status handler

use crate::error::StoreError;
use crate::router::{Reply, Request};
use crate::server::ServerState;
use anyhow::Result;
use axum::http::Method;
use serde_json::json;

/// GET `/status`
pub async fn serve_status(state: ServerState, req: Request) -> Result<Reply> {
    if req.method != Method::GET {
        return Err(StoreError::MethodNotAllowed(format!("{} not allowed on status", req.method)).into());
    }
    let uptime = state.start_time.elapsed().as_secs();
    let stats = state.store.stats();

    let response = json!({
        "server": {
            "version": state.config.version,
            "uptime_seconds": uptime,
            "meta_policy": state.config.meta_policy,
            "verify_hashes": state.config.verify_hashes,
            "request_timeout_seconds": state.config.request_timeout.as_secs(),
            "max_upload_size": state.config.max_upload_size,
        },
        "entities": {
            "count": state.store.count(),
        },
        "store": {
            "queries_executed": stats.queries_executed,
            "documents_written": stats.documents_written,
        },
        "meta": {
            "facets": state.engine.registry().names(),
        }
    });

    Reply::json(&response)
}
