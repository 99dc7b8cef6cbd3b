// src/entity.rs
//! Entity documents and the store that holds them
//!
//! Documents live in named collections as JSON objects keyed by their `_id`.
//! The whole database is persisted to one JSON file after every write
//! (temp file + rename), so a crash never leaves a half-written file behind.

use crate::constants::ENTITIES_COLLECTION;
use crate::error::StoreError;
use crate::reference::EntityReference;
use crate::zipfile::ZipFileEntry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Well-known archive files whose zip location is cached on the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileId {
    Readme,
    Icon,
}

impl FileId {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileId::Readme => "readme",
            FileId::Icon => "icon",
        }
    }
}

/// One uploaded charm or bundle revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_id")]
    pub id: EntityReference,

    /// `id` with series and revision removed
    #[serde(rename = "baseurl")]
    pub base_url: EntityReference,

    /// Content address of the archive in the blob store
    #[serde(rename = "blobhash")]
    pub blob_hash: String,

    #[serde(rename = "size")]
    pub blob_size: i64,

    #[serde(rename = "uploadtime")]
    pub upload_time: DateTime<Utc>,

    /// Arbitrary JSON values attached after upload
    #[serde(rename = "extrainfo", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_info: BTreeMap<String, Value>,

    #[serde(rename = "charmmeta", default, skip_serializing_if = "Option::is_none")]
    pub charm_meta: Option<Value>,

    #[serde(rename = "charmconfig", default, skip_serializing_if = "Option::is_none")]
    pub charm_config: Option<Value>,

    #[serde(rename = "charmactions", default, skip_serializing_if = "Option::is_none")]
    pub charm_actions: Option<Value>,

    #[serde(rename = "charmprovidedinterfaces", default, skip_serializing_if = "Vec::is_empty")]
    pub charm_provided_interfaces: Vec<String>,

    #[serde(rename = "charmrequiredinterfaces", default, skip_serializing_if = "Vec::is_empty")]
    pub charm_required_interfaces: Vec<String>,

    #[serde(rename = "bundledata", default, skip_serializing_if = "Option::is_none")]
    pub bundle_data: Option<Value>,

    #[serde(rename = "bundlereadme", default, skip_serializing_if = "Option::is_none")]
    pub bundle_readme: Option<String>,

    /// Charm ids referenced by the bundle
    #[serde(rename = "bundlecharms", default, skip_serializing_if = "Vec::is_empty")]
    pub bundle_charms: Vec<String>,

    #[serde(rename = "bundlemachinecount", default, skip_serializing_if = "Option::is_none")]
    pub bundle_machine_count: Option<u64>,

    #[serde(rename = "bundleunitcount", default, skip_serializing_if = "Option::is_none")]
    pub bundle_unit_count: Option<u64>,

    /// Lazily filled zip locations of well-known files; always derivable from the blob
    #[serde(rename = "contents", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contents: BTreeMap<FileId, ZipFileEntry>,
}

impl Entity {
    /// A new entity with only the archive fields set
    pub fn new(id: EntityReference, blob_hash: &str, blob_size: i64) -> Self {
        Self {
            base_url: id.base(),
            id,
            blob_hash: blob_hash.to_string(),
            blob_size,
            upload_time: Utc::now(),
            extra_info: BTreeMap::new(),
            charm_meta: None,
            charm_config: None,
            charm_actions: None,
            charm_provided_interfaces: Vec::new(),
            charm_required_interfaces: Vec::new(),
            bundle_data: None,
            bundle_readme: None,
            bundle_charms: Vec::new(),
            bundle_machine_count: None,
            bundle_unit_count: None,
            contents: BTreeMap::new(),
        }
    }

    fn to_document(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self).context("Failed to serialize entity")? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("entity did not serialize to an object"),
        }
    }

    fn from_document(doc: &Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(doc.clone())).context("Failed to decode entity document")
    }
}

/// Backing-store access as the metadata engine sees it
pub trait DocumentStore: Send + Sync {
    /// Fetch the named top-level fields of one document in a single round trip.
    ///
    /// Returns `None` if the document does not exist; fields the document
    /// lacks are left out of the returned map.
    fn find_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[String],
    ) -> Result<Option<Map<String, Value>>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub queries_executed: u64,
    pub documents_written: u64,
}

type Collections = BTreeMap<String, BTreeMap<String, Map<String, Value>>>;

pub struct EntityStore {
    path: Option<PathBuf>,
    collections: RwLock<Collections>,
    queries_executed: AtomicU64,
    documents_written: AtomicU64,
}

impl EntityStore {
    /// Open the store persisted at `path`, starting empty if the file does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let collections: Collections = if path.exists() {
            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to open entity store: {}", path.display()))?;
            sonic_rs::from_slice(&data)
                .with_context(|| format!("Failed to parse entity store: {}", path.display()))?
        } else {
            Collections::new()
        };

        let count = collections
            .get(ENTITIES_COLLECTION)
            .map(|c| c.len())
            .unwrap_or(0);
        log::debug!("[EntityStore] Loaded {} entities from {}", count, path.display());

        Ok(Self {
            path: Some(path),
            collections: RwLock::new(collections),
            queries_executed: AtomicU64::new(0),
            documents_written: AtomicU64::new(0),
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            collections: RwLock::new(Collections::new()),
            queries_executed: AtomicU64::new(0),
            documents_written: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            documents_written: self.documents_written.load(Ordering::Relaxed),
        }
    }

    pub fn count(&self) -> usize {
        self.read()
            .get(ENTITIES_COLLECTION)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Load one concrete entity
    pub fn find_entity(&self, id: &EntityReference) -> Result<Entity> {
        self.record_query();
        let collections = self.read();
        let doc = collections
            .get(ENTITIES_COLLECTION)
            .and_then(|c| c.get(&id.to_string()))
            .ok_or_else(|| StoreError::not_found(format!("entity {} not found", id)))?;
        Entity::from_document(doc)
    }

    /// Resolve a possibly partial reference to the concrete id of the entity it
    /// denotes: the highest revision, and with no series given, the most
    /// recently uploaded match.
    pub fn resolve(&self, id: &EntityReference) -> Result<EntityReference> {
        self.record_query();
        let collections = self.read();
        let entities = match collections.get(ENTITIES_COLLECTION) {
            Some(entities) => entities,
            None => return Err(StoreError::not_found(format!("no matching charm or bundle for {}", id)).into()),
        };

        let mut best: Option<(DateTime<Utc>, u32, EntityReference)> = None;
        for doc in entities.values() {
            let entity = Entity::from_document(doc)?;
            let candidate = &entity.id;
            if candidate.user != id.user || candidate.name != id.name {
                continue;
            }
            if id.series.is_some() && candidate.series != id.series {
                continue;
            }
            if id.revision.is_some() && candidate.revision != id.revision {
                continue;
            }
            let revision = candidate.revision.unwrap_or(0);
            let better = match &best {
                None => true,
                Some((time, rev, _)) if id.series.is_some() => revision > *rev || (revision == *rev && entity.upload_time > *time),
                Some((time, rev, _)) => entity.upload_time > *time || (entity.upload_time == *time && revision > *rev),
            };
            if better {
                best = Some((entity.upload_time, revision, entity.id.clone()));
            }
        }

        best.map(|(_, _, id)| id)
            .ok_or_else(|| StoreError::not_found(format!("no matching charm or bundle for {}", id)).into())
    }

    /// Insert an entity under its exact (concrete) id
    pub fn insert(&self, entity: &Entity) -> Result<()> {
        self.insert_if(entity, || Ok(()))
    }

    /// Like [`insert`](Self::insert), but first runs `precondition` under the
    /// store's write lock; an error from it aborts the insert.
    pub fn insert_if<F>(&self, entity: &Entity, precondition: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if !entity.id.is_concrete() {
            anyhow::bail!("cannot insert entity with partial id {}", entity.id);
        }
        let mut collections = self.write();
        let key = entity.id.to_string();
        if collections
            .get(ENTITIES_COLLECTION)
            .is_some_and(|c| c.contains_key(&key))
        {
            return Err(StoreError::DuplicateUpload(format!("{} already exists", entity.id)).into());
        }
        precondition()?;
        let doc = entity.to_document()?;
        self.commit(&mut collections, &key, doc)
    }

    /// Insert `entity` at the next free revision of its (user, series, name),
    /// returning the concrete id. Allocation and insert share one write lock.
    pub fn insert_next_revision(&self, entity: Entity) -> Result<Entity> {
        self.insert_next_revision_if(entity, || Ok(()))
    }

    /// Like [`insert_next_revision`](Self::insert_next_revision) with a
    /// precondition checked under the write lock
    pub fn insert_next_revision_if<F>(&self, mut entity: Entity, precondition: F) -> Result<Entity>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut collections = self.write();

        let mut next = 0u32;
        if let Some(entities) = collections.get(ENTITIES_COLLECTION) {
            for doc in entities.values() {
                let existing = Entity::from_document(doc)?;
                if existing.id.user == entity.id.user
                    && existing.id.series == entity.id.series
                    && existing.id.name == entity.id.name
                {
                    if let Some(rev) = existing.id.revision {
                        next = next.max(rev + 1);
                    }
                }
            }
        }

        precondition()?;
        entity.id = entity.id.with_revision(next);
        entity.base_url = entity.id.base();
        let doc = entity.to_document()?;
        self.commit(&mut collections, &entity.id.to_string(), doc)?;
        Ok(entity)
    }

    /// Apply `update` to a stored entity and persist the result
    pub fn update_entity<F>(&self, id: &EntityReference, update: F) -> Result<Entity>
    where
        F: FnOnce(&mut Entity) -> Result<()>,
    {
        let mut collections = self.write();
        let key = id.to_string();
        let doc = collections
            .get(ENTITIES_COLLECTION)
            .and_then(|c| c.get(&key))
            .ok_or_else(|| StoreError::not_found(format!("entity {} not found", id)))?;
        let mut entity = Entity::from_document(doc)?;
        update(&mut entity)?;
        let doc = entity.to_document()?;
        self.commit(&mut collections, &key, doc)?;
        Ok(entity)
    }

    /// Record where a well-known file lives in the entity's archive.
    /// Overwrites freely: the value is derived from the immutable blob.
    pub fn set_cached_file(&self, id: &EntityReference, file: FileId, entry: ZipFileEntry) -> Result<()> {
        self.update_entity(id, |entity| {
            entity.contents.insert(file, entry);
            Ok(())
        })?;
        Ok(())
    }

    /// Set one extra-info key, or with `key == None` replace the whole map
    pub fn set_extra_info(&self, id: &EntityReference, key: Option<&str>, value: Value) -> Result<Entity> {
        self.update_entity(id, |entity| {
            match key {
                Some(key) => {
                    entity.extra_info.insert(key.to_string(), value);
                }
                None => match value {
                    Value::Object(map) => entity.extra_info = map.into_iter().collect(),
                    _ => return Err(StoreError::bad_request("extra-info must be a JSON object").into()),
                },
            }
            Ok(())
        })
    }

    /// True if any entity's archive is stored under `hash`
    pub fn references_blob(&self, hash: &str) -> bool {
        blob_referenced(&self.read(), hash)
    }

    /// Run `remove` only if no entity references `hash`, holding the write
    /// lock throughout so no insert can start using the blob meanwhile.
    /// Returns whether `remove` ran.
    pub fn remove_blob_if_unreferenced<F>(&self, hash: &str, remove: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let collections = self.write();
        if blob_referenced(&collections, hash) {
            return Ok(false);
        }
        remove()?;
        Ok(true)
    }

    /// All entities, ordered by id
    pub fn list(&self) -> Result<Vec<Entity>> {
        self.record_query();
        let collections = self.read();
        match collections.get(ENTITIES_COLLECTION) {
            Some(c) => c.values().map(Entity::from_document).collect(),
            None => Ok(Vec::new()),
        }
    }

    fn record_query(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.collections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Collections> {
        self.collections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put one entity document and save. The in-memory change is undone
    /// when the save fails, so memory never holds a document the file does not.
    fn commit(&self, collections: &mut Collections, key: &str, doc: Map<String, Value>) -> Result<()> {
        let previous = collections
            .entry(ENTITIES_COLLECTION.to_string())
            .or_default()
            .insert(key.to_string(), doc);

        if let Err(e) = self.save(collections) {
            let entities = collections.entry(ENTITIES_COLLECTION.to_string()).or_default();
            match previous {
                Some(previous) => {
                    entities.insert(key.to_string(), previous);
                }
                None => {
                    entities.remove(key);
                }
            }
            return Err(e);
        }
        self.documents_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Save atomically; called with the write lock held so saves never reorder
    fn save(&self, collections: &Collections) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let temp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(collections).context("Failed to serialize entity store")?;
        std::fs::write(&temp_path, json)
            .with_context(|| format!("Failed to write temp entity store: {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename entity store: {}", path.display()))?;
        Ok(())
    }
}

fn blob_referenced(collections: &Collections, hash: &str) -> bool {
    collections
        .get(ENTITIES_COLLECTION)
        .map(|c| {
            c.values()
                .any(|doc| doc.get("blobhash").and_then(Value::as_str) == Some(hash))
        })
        .unwrap_or(false)
}

impl DocumentStore for EntityStore {
    fn find_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[String],
    ) -> Result<Option<Map<String, Value>>> {
        self.record_query();
        let collections = self.read();
        let doc = match collections.get(collection).and_then(|c| c.get(id)) {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let projection = fields
            .iter()
            .filter_map(|f| doc.get(f).map(|v| (f.clone(), v.clone())))
            .collect();
        Ok(Some(projection))
    }
}
