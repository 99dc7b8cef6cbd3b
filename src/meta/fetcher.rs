// src/meta/fetcher.rs
//! The accessor facet handlers read documents through

use crate::constants::ENTITIES_COLLECTION;
use crate::error::StoreError;
use crate::reference::EntityReference;
use anyhow::Result;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

/// Fields wanted from one or more documents of a collection.
///
/// Sent by a [`Fetcher`] to the engine, answered once the engine flushes.
#[derive(Debug)]
pub struct FieldRequest {
    /// Handler unit that is now blocked on this request
    pub unit: usize,
    pub collection: String,
    pub doc_ids: Vec<String>,
    pub fields: Vec<String>,
    /// One projection per entry of `doc_ids`, `None` for a missing document
    pub reply: oneshot::Sender<Result<Vec<Option<Map<String, Value>>>, StoreError>>,
}

#[derive(Clone)]
pub struct Fetcher {
    unit: usize,
    tx: mpsc::UnboundedSender<FieldRequest>,
}

impl Fetcher {
    pub(crate) fn new(unit: usize, tx: mpsc::UnboundedSender<FieldRequest>) -> Self {
        Self { unit, tx }
    }

    /// Fields of several documents in one request; suspends until the next flush
    pub async fn fetch_many(
        &self,
        collection: &str,
        doc_ids: &[String],
        fields: &[&str],
    ) -> Result<Vec<Option<Map<String, Value>>>> {
        let (reply, rx) = oneshot::channel();
        let request = FieldRequest {
            unit: self.unit,
            collection: collection.to_string(),
            doc_ids: doc_ids.to_vec(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            reply,
        };
        self.tx
            .send(request)
            .map_err(|_| StoreError::Internal("metadata fetch abandoned".to_string()))?;
        let docs = rx
            .await
            .map_err(|_| StoreError::Internal("metadata fetch abandoned".to_string()))??;
        Ok(docs)
    }

    /// Fields of one document, `None` if it does not exist
    pub async fn fetch(
        &self,
        collection: &str,
        doc_id: &str,
        fields: &[&str],
    ) -> Result<Option<Map<String, Value>>> {
        let mut docs = self
            .fetch_many(collection, &[doc_id.to_string()], fields)
            .await?;
        Ok(docs.pop().flatten())
    }

    /// Fields of an entity document; a missing entity is `NotFound`
    pub async fn entity(&self, id: &EntityReference, fields: &[&str]) -> Result<Map<String, Value>> {
        self.fetch(ENTITIES_COLLECTION, &id.to_string(), fields)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("entity {} not found", id)).into())
    }

    /// A single entity field, `Null` when the entity lacks it
    pub async fn entity_field(&self, id: &EntityReference, field: &str) -> Result<Value> {
        let mut doc = self.entity(id, &[field]).await?;
        Ok(doc.remove(field).unwrap_or(Value::Null))
    }
}
