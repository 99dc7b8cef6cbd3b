// Archive upload, download and inner-file handlers

use crate::blobstore::{BlobStore, SeekReaderAt};
use crate::charm;
use crate::entity::{Entity, EntityStore};
use crate::error::StoreError;
use crate::params::ArchiveUploadResponse;
use crate::reference::EntityReference;
use crate::router::{Reply, Request};
use crate::server::utils::{content_type_for, reader_body, run_blocking};
use crate::server::ServerState;
use crate::zipfile::{ZipFileEntry, ZipIndex};
use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// GET, POST or PUT `<id>/archive`
pub async fn serve_archive(state: ServerState, id: EntityReference, req: Request) -> Result<Reply> {
    match req.method {
        Method::GET | Method::HEAD => serve_get_archive(state, id).await,
        Method::POST => serve_upload(state, id, req, Allocation::NextRevision).await,
        Method::PUT => serve_upload(state, id, req, Allocation::Exact).await,
        _ => Err(StoreError::MethodNotAllowed(format!("{} not allowed on archive", req.method)).into()),
    }
}

async fn serve_get_archive(state: ServerState, id: EntityReference) -> Result<Reply> {
    let id = state.resolve(&id).await?;
    let (file, size) = open_blob(&state, &id).await?;

    let stream = ReaderStream::new(tokio::fs::File::from_std(file));
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(Reply::Response(response))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allocation {
    /// POST: the store picks the next free revision
    NextRevision,
    /// PUT: the client names the revision
    Exact,
}

async fn serve_upload(state: ServerState, id: EntityReference, req: Request, allocation: Allocation) -> Result<Reply> {
    if id.series.is_none() {
        return Err(StoreError::bad_request("series not specified").into());
    }
    match (allocation, id.revision) {
        (Allocation::NextRevision, Some(_)) => {
            return Err(StoreError::bad_request("revision specified, but should not be specified").into())
        }
        (Allocation::Exact, None) => return Err(StoreError::bad_request("revision not specified").into()),
        _ => {}
    }
    let hash = match req.param("hash") {
        Some(hash) if !hash.is_empty() => hash.to_string(),
        _ => return Err(StoreError::bad_request("hash parameter not specified").into()),
    };
    let size = req
        .content_length()
        .ok_or_else(|| StoreError::bad_request("Content-Length not specified"))?;

    log::info!("[Archive] Upload {} ({} bytes, hash {})", id, size, hash);
    let store = Arc::clone(&state.store);
    let blobs = Arc::clone(&state.blobs);
    let body = req.body;
    let entity = run_blocking(move || ingest(&store, &blobs, id, &hash, body, size, allocation)).await?;
    log::info!("[Archive] Stored {}", entity.id);

    Reply::json(&ArchiveUploadResponse { id: entity.id })
}

/// Store the blob, inspect it and record the entity; on failure remove the
/// blob again if this upload created it and nothing else uses it.
fn ingest(
    store: &EntityStore,
    blobs: &BlobStore,
    id: EntityReference,
    hash: &str,
    body: Bytes,
    size: u64,
    allocation: Allocation,
) -> Result<Entity> {
    let created = blobs
        .put(hash, body.as_ref(), size)
        .context("cannot put archive blob")?;

    let result = (|| -> Result<Entity> {
        let (file, blob_size) = blobs.open(hash).map_err(|e| blob_vanished(hash, e))?;
        let reader = SeekReaderAt::new(file);
        let mut entity = Entity::new(id.clone(), hash, blob_size as i64);
        charm::inspect_archive(&reader, blob_size, &mut entity)?;

        // Checked under the store's write lock, which rollback also holds.
        let blob_present = || {
            if blobs.exists(hash) {
                Ok(())
            } else {
                Err(blob_vanished(hash, StoreError::not_found("blob removed").into()))
            }
        };
        match allocation {
            Allocation::Exact => {
                store.insert_if(&entity, blob_present)?;
                Ok(entity)
            }
            Allocation::NextRevision => store.insert_next_revision_if(entity, blob_present),
        }
    })();

    if let Err(e) = &result {
        log::debug!("[Archive] Upload of {} failed: {:#}", id, e);
        if created {
            if let Err(remove_err) = store.remove_blob_if_unreferenced(hash, || blobs.remove(hash)) {
                log::warn!("[Archive] Cannot remove blob {} after failed upload: {:#}", hash, remove_err);
            }
        }
    }
    result
}

/// A blob this upload found in place was rolled back by a concurrent failed
/// upload of the same content. Reported as a 500 the client may retry.
fn blob_vanished(hash: &str, err: anyhow::Error) -> anyhow::Error {
    if crate::error::is_not_found_error(&err) {
        StoreError::Internal(format!("archive blob {} was removed during upload, retry", hash)).into()
    } else {
        err.context("cannot open newly created blob")
    }
}

/// GET `<id>/archive/<path>`: one file out of the archive
pub async fn serve_archive_file(state: ServerState, id: EntityReference, req: Request) -> Result<Reply> {
    if req.method != Method::GET && req.method != Method::HEAD {
        return Err(StoreError::MethodNotAllowed(format!("{} not allowed on archive files", req.method)).into());
    }
    let id = state.resolve(&id).await?;
    let (file, size) = open_blob(&state, &id).await?;
    let path = req.path;

    let (name, entry, length, file) = run_blocking(move || {
        let reader = SeekReaderAt::new(file);
        let index = ZipIndex::read(&reader, size).with_context(|| format!("cannot read archive data for {}", id))?;
        let central = index
            .find(&path)
            .ok_or_else(|| StoreError::not_found(format!("file {:?} not found in the archive", path)))?;
        if central.is_dir() {
            return Err(StoreError::Forbidden("directory listing not allowed".to_string()).into());
        }
        let entry = ZipFileEntry::locate(&reader, central)?;
        Ok((path, entry, central.uncompressed_size, reader.into_inner()))
    })
    .await?;

    let reader = entry.into_reader(file)?;
    let mut response = Response::new(reader_body(reader));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&name)));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    Ok(Reply::Response(response))
}

/// Body with explicit type and length
pub(crate) fn file_response(content_type: &'static str, data: Vec<u8>) -> Response {
    let len = data.len();
    let mut response = Response::new(Body::from(data));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response
}

async fn open_blob(state: &ServerState, id: &EntityReference) -> Result<(std::fs::File, u64)> {
    let store = Arc::clone(&state.store);
    let blobs = Arc::clone(&state.blobs);
    let id = id.clone();
    run_blocking(move || {
        let entity = store.find_entity(&id)?;
        blobs
            .open(&entity.blob_hash)
            .with_context(|| format!("cannot open archive data for {}", id))
    })
    .await
}
