// Metadata facets served under `meta/`
//
// Every facet reads entity fields through the engine's `Fetcher`, so facets
// requested together share one store query per entity.

use crate::blobstore::{BlobStore, SeekReaderAt};
use crate::constants::ENTITIES_COLLECTION;
use crate::entity::EntityStore;
use crate::error::StoreError;
use crate::meta::{Fetcher, MetaHandler, MetaRegistry};
use crate::params::ManifestFile;
use crate::reference::EntityReference;
use crate::server::utils::run_blocking;
use crate::zipfile::ZipIndex;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The facet set the server registers at startup
pub fn default_registry(store: Arc<EntityStore>, blobs: Arc<BlobStore>) -> Result<MetaRegistry> {
    let put_store = Arc::clone(&store);
    let put_key_store = Arc::clone(&store);

    let registry = MetaRegistry::builder()
        .register("archive-size", MetaHandler::bulk(archive_size))?
        .register("archive-upload-time", MetaHandler::single(archive_upload_time))?
        .register(
            "extra-info",
            MetaHandler::single(extra_info).with_put(move |id, _key, value| {
                put_extra_info(Arc::clone(&put_store), id, None, value)
            }),
        )?
        .register(
            "extra-info/",
            MetaHandler::single(extra_info_key).with_put(move |id, key, value| {
                put_extra_info(Arc::clone(&put_key_store), id, Some(key), value)
            }),
        )?
        .register(
            "manifest",
            MetaHandler::single(move |fetcher, id, _key| manifest(Arc::clone(&blobs), fetcher, id)),
        )?
        .register("charm-metadata", MetaHandler::single(charm_metadata))?
        .register("charm-config", MetaHandler::single(charm_config))?
        .register("charm-actions", MetaHandler::single(charm_actions))?
        .register("charm-related", MetaHandler::single(charm_related))?
        .register("bundle-metadata", MetaHandler::single(bundle_metadata))?
        .register("bundle-unit-count", MetaHandler::single(bundle_unit_count))?
        .register("bundle-machine-count", MetaHandler::single(bundle_machine_count))?
        .register("bundle-charms", MetaHandler::single(bundle_charms))?
        .register("id-revision", MetaHandler::single(id_revision))?
        .build();
    Ok(registry)
}

/// Archive sizes of every requested entity in one fetch
async fn archive_size(
    fetcher: Fetcher,
    ids: Vec<EntityReference>,
    _key: String,
) -> Result<BTreeMap<EntityReference, Value>> {
    let doc_ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let docs = fetcher.fetch_many(ENTITIES_COLLECTION, &doc_ids, &["size"]).await?;
    let mut sizes = BTreeMap::new();
    for (id, doc) in ids.into_iter().zip(docs) {
        if let Some(size) = doc.as_ref().and_then(|d| d.get("size")).and_then(Value::as_i64) {
            sizes.insert(id, json!({ "Size": size }));
        }
    }
    Ok(sizes)
}

async fn archive_upload_time(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    let time = fetcher.entity_field(&id, "uploadtime").await?;
    Ok(Some(json!({ "UploadTime": time })))
}

async fn extra_info(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    match fetcher.entity_field(&id, "extrainfo").await? {
        Value::Null => Ok(Some(json!({}))),
        info => Ok(Some(info)),
    }
}

async fn extra_info_key(fetcher: Fetcher, id: EntityReference, key: String) -> Result<Option<Value>> {
    match fetcher.entity_field(&id, "extrainfo").await? {
        Value::Object(mut info) => Ok(info.remove(&key)),
        _ => Ok(None),
    }
}

async fn put_extra_info(store: Arc<EntityStore>, id: EntityReference, key: Option<String>, value: Value) -> Result<()> {
    run_blocking(move || {
        store.set_extra_info(&id, key.as_deref(), value)?;
        Ok(())
    })
    .await
}

/// Files in the entity's archive with their uncompressed sizes
async fn manifest(blobs: Arc<BlobStore>, fetcher: Fetcher, id: EntityReference) -> Result<Option<Value>> {
    let hash = match fetcher.entity_field(&id, "blobhash").await? {
        Value::String(hash) => hash,
        _ => return Err(StoreError::Internal(format!("entity {} has no archive", id)).into()),
    };
    let files = run_blocking(move || {
        let (file, size) = blobs.open(&hash)?;
        let index = ZipIndex::read(&SeekReaderAt::new(file), size)
            .with_context(|| format!("cannot read archive data for {}", id))?;
        Ok(index
            .manifest()
            .into_iter()
            .map(|(name, size)| ManifestFile { name, size })
            .collect::<Vec<_>>())
    })
    .await?;
    Ok(Some(serde_json::to_value(files)?))
}

/// An optional document field, omitted when absent or when the facet
/// does not apply to this kind of entity
async fn optional_field(fetcher: &Fetcher, id: &EntityReference, field: &str, applies: bool) -> Result<Option<Value>> {
    if !applies {
        return Ok(None);
    }
    match fetcher.entity_field(id, field).await? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

async fn charm_metadata(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    optional_field(&fetcher, &id, "charmmeta", !id.is_bundle()).await
}

async fn charm_config(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    optional_field(&fetcher, &id, "charmconfig", !id.is_bundle()).await
}

async fn charm_actions(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    optional_field(&fetcher, &id, "charmactions", !id.is_bundle()).await
}

async fn charm_related(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    if id.is_bundle() {
        return Ok(None);
    }
    let mut doc = fetcher
        .entity(&id, &["charmprovidedinterfaces", "charmrequiredinterfaces"])
        .await?;
    let provides = doc.remove("charmprovidedinterfaces").unwrap_or_else(|| json!([]));
    let requires = doc.remove("charmrequiredinterfaces").unwrap_or_else(|| json!([]));
    Ok(Some(json!({ "Provides": provides, "Requires": requires })))
}

async fn bundle_metadata(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    optional_field(&fetcher, &id, "bundledata", id.is_bundle()).await
}

async fn bundle_unit_count(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    let count = optional_field(&fetcher, &id, "bundleunitcount", id.is_bundle()).await?;
    Ok(count.map(|n| json!({ "Count": n })))
}

async fn bundle_machine_count(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    let count = optional_field(&fetcher, &id, "bundlemachinecount", id.is_bundle()).await?;
    Ok(count.map(|n| json!({ "Count": n })))
}

async fn bundle_charms(fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    if !id.is_bundle() {
        return Ok(None);
    }
    let charms = optional_field(&fetcher, &id, "bundlecharms", true).await?;
    Ok(Some(charms.unwrap_or_else(|| json!([]))))
}

async fn id_revision(_fetcher: Fetcher, id: EntityReference, _key: String) -> Result<Option<Value>> {
    Ok(id.revision.map(|rev| json!({ "Revision": rev })))
}
