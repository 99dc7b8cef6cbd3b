// src/meta/registry.rs
//! Facet name → handler table, built once at startup and read-only afterwards

use super::fetcher::Fetcher;
use crate::reference::EntityReference;
use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Resolves a facet for one id. `Ok(None)` means the facet does not apply and is omitted.
pub type SingleFn =
    Arc<dyn Fn(Fetcher, EntityReference, String) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// Resolves a facet for many ids at once; ids missing from the map are omitted
pub type BulkFn = Arc<
    dyn Fn(Fetcher, Vec<EntityReference>, String) -> BoxFuture<'static, Result<BTreeMap<EntityReference, Value>>>
        + Send
        + Sync,
>;

/// Updates a facet from a JSON body
pub type PutFn = Arc<dyn Fn(EntityReference, String, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub enum MetaHandlerKind {
    Single(SingleFn),
    Bulk(BulkFn),
}

#[derive(Clone)]
pub struct MetaHandler {
    pub kind: MetaHandlerKind,
    pub put: Option<PutFn>,
}

impl MetaHandler {
    pub fn single<F, Fut>(f: F) -> Self
    where
        F: Fn(Fetcher, EntityReference, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        Self {
            kind: MetaHandlerKind::Single(Arc::new(move |fetcher, id, key| f(fetcher, id, key).boxed())),
            put: None,
        }
    }

    pub fn bulk<F, Fut>(f: F) -> Self
    where
        F: Fn(Fetcher, Vec<EntityReference>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BTreeMap<EntityReference, Value>>> + Send + 'static,
    {
        Self {
            kind: MetaHandlerKind::Bulk(Arc::new(move |fetcher, ids, key| f(fetcher, ids, key).boxed())),
            put: None,
        }
    }

    pub fn with_put<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(EntityReference, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.put = Some(Arc::new(move |id, key, value| f(id, key, value).boxed()));
        self
    }
}

#[derive(Default)]
pub struct MetaRegistryBuilder {
    handlers: BTreeMap<String, MetaHandler>,
}

impl MetaRegistryBuilder {
    /// Register `handler` under `name`. A name ending in `/` is key-scoped:
    /// `extra-info/` serves `extra-info/<key>` for any non-empty key.
    pub fn register(mut self, name: &str, handler: MetaHandler) -> Result<Self> {
        if name.is_empty() || name == "/" {
            anyhow::bail!("invalid metadata handler name {:?}", name);
        }
        if self.handlers.contains_key(name) {
            anyhow::bail!("metadata handler {:?} registered twice", name);
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(self)
    }

    pub fn build(self) -> MetaRegistry {
        MetaRegistry {
            handlers: self.handlers,
        }
    }
}

pub struct MetaRegistry {
    handlers: BTreeMap<String, MetaHandler>,
}

impl MetaRegistry {
    pub fn builder() -> MetaRegistryBuilder {
        MetaRegistryBuilder::default()
    }

    /// Find the handler for a requested facet, returning it with the key
    /// (empty for exact names, the text after `name/` for key-scoped ones).
    pub fn lookup<'a>(&self, facet: &'a str) -> Option<(&MetaHandler, &'a str)> {
        if let Some(handler) = self.handlers.get(facet) {
            if !facet.ends_with('/') {
                return Some((handler, ""));
            }
        }
        let slash = facet.find('/')?;
        let (prefix, key) = facet.split_at(slash + 1);
        if key.is_empty() {
            return None;
        }
        self.handlers.get(prefix).map(|h| (h, key))
    }

    /// Registered facet names, key-scoped ones without their trailing slash
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .keys()
            .map(|name| name.trim_end_matches('/').to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
