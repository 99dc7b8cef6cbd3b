// Well-known archive files served through the entity's offset cache

use crate::blobstore::SeekReaderAt;
use crate::constants::{is_icon_file, is_readme_file, MAX_INSPECTED_FILE_SIZE};
use crate::entity::FileId;
use crate::error::StoreError;
use crate::reference::EntityReference;
use crate::router::{Reply, Request};
use crate::server::handle_archive::file_response;
use crate::server::utils::run_blocking;
use crate::server::ServerState;
use crate::zipfile::{ZipFileEntry, ZipIndex};
use anyhow::{Context, Result};
use axum::http::Method;
use std::sync::Arc;

/// Served for charms whose archive carries no icon
const DEFAULT_ICON: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="96" height="96" viewBox="0 0 96 96">
  <circle cx="48" cy="48" r="46" fill="#dd4814"/>
  <circle cx="48" cy="48" r="20" fill="#ffffff"/>
</svg>
"##;

/// GET `<id>/readme`
pub async fn serve_readme(state: ServerState, id: EntityReference, req: Request) -> Result<Reply> {
    check_get(&req)?;
    let id = state.resolve(&id).await?;
    let data = read_cached_file(&state, &id, FileId::Readme, is_readme_file)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("no README found in {}", id)))?;
    Ok(Reply::Response(file_response("text/plain; charset=utf-8", data)))
}

/// GET `<id>/icon.svg`
pub async fn serve_icon(state: ServerState, id: EntityReference, req: Request) -> Result<Reply> {
    check_get(&req)?;
    if id.is_bundle() {
        return Err(StoreError::not_found("icons not supported for bundles").into());
    }
    let id = state.resolve(&id).await?;
    let data = match read_cached_file(&state, &id, FileId::Icon, is_icon_file).await? {
        Some(data) => data,
        None => {
            log::debug!("[Archive] No icon in {}, serving default", id);
            DEFAULT_ICON.as_bytes().to_vec()
        }
    };
    Ok(Reply::Response(file_response("image/svg+xml", data)))
}

fn check_get(req: &Request) -> Result<()> {
    if req.method != Method::GET && req.method != Method::HEAD {
        return Err(StoreError::MethodNotAllowed(format!("{} not allowed", req.method)).into());
    }
    Ok(())
}

/// Read a well-known file of the entity's archive.
///
/// The first access walks the central directory and records the file's
/// location on the entity; later accesses seek straight to the data.
/// Returns `None` when the archive has no such file.
async fn read_cached_file(
    state: &ServerState,
    id: &EntityReference,
    file_id: FileId,
    is_wanted: fn(&str) -> bool,
) -> Result<Option<Vec<u8>>> {
    let store = Arc::clone(&state.store);
    let blobs = Arc::clone(&state.blobs);
    let id = id.clone();
    run_blocking(move || {
        let entity = store.find_entity(&id)?;
        let (file, size) = blobs
            .open(&entity.blob_hash)
            .with_context(|| format!("cannot open archive data for {}", id))?;
        let reader = SeekReaderAt::new(file);

        let entry = match entity.contents.get(&file_id) {
            Some(entry) => *entry,
            None => {
                let index = ZipIndex::read(&reader, size)
                    .with_context(|| format!("cannot read archive data for {}", id))?;
                let central = match index.find_file(is_wanted) {
                    Some(central) => central,
                    None => return Ok(None),
                };
                let entry = ZipFileEntry::locate(&reader, central)?;
                store.set_cached_file(&id, file_id, entry)?;
                log::debug!("[Archive] Cached {} location for {}", file_id.as_str(), id);
                entry
            }
        };
        entry.read_to_vec(&reader, MAX_INSPECTED_FILE_SIZE).map(Some)
    })
    .await
}
