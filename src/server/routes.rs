// Route setup and configuration

use crate::error::StoreError;
use crate::router::{error_response, Request, Router};
use crate::server::handle_archive::{serve_archive, serve_archive_file};
use crate::server::handle_content::{serve_icon, serve_readme};
use crate::server::handle_meta::{serve_bulk_meta, serve_meta};
use crate::server::handle_status::serve_status;
use crate::server::utils::decode_path;
use crate::server::ServerState;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::any;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

/// The store's handler tables
pub fn api_router(timeout: Duration) -> Result<Router<ServerState>> {
    Ok(Router::builder()
        .global("status", serve_status)?
        .global("meta/", serve_bulk_meta)?
        .id("archive", serve_archive)?
        .id("archive/", serve_archive_file)?
        .id("meta", serve_meta)?
        .id("meta/", serve_meta)?
        .id("readme", serve_readme)?
        .id("icon.svg", serve_icon)?
        .timeout(timeout)
        .build())
}

pub fn create_router(state: ServerState) -> axum::Router {
    let body_limit = state.config.max_upload_size;
    axum::Router::new()
        .route("/", any(handle_api))
        .route("/{*path}", any(handle_api))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

async fn handle_api(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let path = match decode_path(uri.path()) {
        Some(path) => path,
        None => return error_response(&StoreError::not_found("not found").into()),
    };
    let req = Request {
        method,
        path,
        query,
        headers,
        body,
    };
    let api = Arc::clone(&state.api);
    api.dispatch(state, req).await
}
