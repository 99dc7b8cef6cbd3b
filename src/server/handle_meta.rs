// Metadata endpoints: `<id>/meta/...` and the bulk `meta/...?id=...`

use crate::error::{is_not_found_error, StoreError};
use crate::params::MetaAnyResponse;
use crate::reference::EntityReference;
use crate::router::{Reply, Request};
use crate::server::ServerState;
use anyhow::Result;
use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use serde_json::Value;
use std::collections::BTreeMap;

/// Facet name that asks for several facets at once through `include=`
const ANY: &str = "any";

/// `<id>/meta`, `<id>/meta/any` and `<id>/meta/<facet>[/<key>]`
pub async fn serve_meta(state: ServerState, id: EntityReference, req: Request) -> Result<Reply> {
    let id = state.resolve(&id).await?;
    let facet = req.path.trim_end_matches('/').to_string();

    match (req.method.clone(), facet.as_str()) {
        (Method::GET, "") => Reply::json(&state.engine.registry().names()),
        (Method::GET, ANY) => {
            let includes = req.params("include");
            let meta = state.engine.meta_any(&id, &includes).await?;
            Reply::json(&MetaAnyResponse { id, meta })
        }
        (Method::GET, facet) => match state.engine.meta_one(&id, facet).await? {
            Some(value) => Reply::json(&value),
            None => Err(StoreError::not_found(format!("metadata {:?} not found for {}", facet, id)).into()),
        },
        (Method::PUT, facet) if !facet.is_empty() && facet != ANY => put_meta(&state, id, facet, &req).await,
        (method, _) => Err(StoreError::MethodNotAllowed(format!("{} not allowed on metadata", method)).into()),
    }
}

async fn put_meta(state: &ServerState, id: EntityReference, facet: &str, req: &Request) -> Result<Reply> {
    let (handler, key) = state
        .engine
        .registry()
        .lookup(facet)
        .ok_or_else(|| StoreError::not_found(format!("unknown metadata {:?}", facet)))?;
    let put = handler
        .put
        .clone()
        .ok_or_else(|| StoreError::MethodNotAllowed(format!("metadata {:?} cannot be updated", facet)))?;
    let value: Value = serde_json::from_slice(&req.body)
        .map_err(|e| StoreError::bad_request(format!("cannot unmarshal body: {}", e)))?;

    log::info!("[Meta] Updating {} of {}", facet, id);
    put(id, key.to_string(), value).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    Ok(Reply::Response(response))
}

/// `meta/<facet>?id=...&id=...`: one entry per id that resolves, keyed by
/// the id as the client wrote it
pub async fn serve_bulk_meta(state: ServerState, req: Request) -> Result<Reply> {
    if req.method != Method::GET {
        return Err(StoreError::MethodNotAllowed(format!("{} not allowed on bulk metadata", req.method)).into());
    }
    let facet = req.path.trim_end_matches('/').to_string();
    let raw_ids = req.params("id");
    if raw_ids.is_empty() {
        return Err(StoreError::bad_request("ids not specified").into());
    }

    let mut requested: Vec<(String, EntityReference)> = Vec::with_capacity(raw_ids.len());
    for raw in raw_ids {
        let id = match raw.parse::<EntityReference>() {
            Ok(id) => id,
            Err(e) => {
                log::debug!("[Meta] Skipping bulk id {:?}: {}", raw, e);
                continue;
            }
        };
        match state.resolve(&id).await {
            Ok(resolved) => requested.push((raw, resolved)),
            Err(e) if is_not_found_error(&e) => log::debug!("[Meta] Skipping bulk id {:?}: {}", raw, e),
            Err(e) => return Err(e),
        }
    }

    let mut ids: Vec<EntityReference> = requested.iter().map(|(_, id)| id.clone()).collect();
    ids.sort();
    ids.dedup();

    let mut response = BTreeMap::new();
    if facet == ANY {
        let includes = req.params("include");
        let results = state.engine.meta_bulk(&ids, &includes).await?;
        for (raw, id) in requested {
            let meta = results.get(&id).cloned().unwrap_or_default();
            response.insert(raw, serde_json::to_value(MetaAnyResponse { id, meta })?);
        }
    } else {
        let values = state.engine.meta_one_bulk(&ids, &facet).await?;
        for (raw, id) in requested {
            if let Some(value) = values.get(&id) {
                response.insert(raw, value.clone());
            }
        }
    }
    Reply::json(&response)
}
