// src/meta/engine.rs
//! Concurrent facet resolution with request coalescing
//!
//! Every facet (per id, or once for a bulk handler) runs as its own task. The
//! tasks read documents through a [`Fetcher`], which parks them on a
//! [`FieldRequest`]. The coordinator loop in [`MetaEngine::run`] tracks which
//! tasks are still running and which of those are parked. Only when every
//! running task is parked does it flush: one `find_fields` per
//! (collection, document) with the union of the fields asked for, then every
//! parked task is woken with its share. The loop ends when no task is running.
//!
//! Dropping the future returned by any resolve method drops the `JoinSet`,
//! which aborts every facet task of that request.

use super::fetcher::{FieldRequest, Fetcher};
use super::registry::{BulkFn, MetaHandlerKind, MetaRegistry, SingleFn};
use crate::entity::DocumentStore;
use crate::error::{to_store_error, ErrorEnvelope, StoreError};
use crate::reference::EntityReference;
use anyhow::{Context, Result};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// What a failing facet does to a multi-facet request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MetaFailurePolicy {
    /// The error is reported in the facet's slot; the other facets still resolve
    #[default]
    PerFacet,
    /// The first failing (or unknown) facet fails the whole request
    FailFast,
}

/// Facet name → value for one id
pub type MetaResults = BTreeMap<String, Value>;

type FacetResult = Result<Option<Value>, StoreError>;

enum Unit {
    Single {
        id: EntityReference,
        facet: String,
        key: String,
        handler: SingleFn,
    },
    Bulk {
        ids: Vec<EntityReference>,
        facet: String,
        key: String,
        handler: BulkFn,
    },
}

/// One resolved (id, facet) slot
struct Outcome {
    id: EntityReference,
    facet: String,
    result: FacetResult,
}

impl Unit {
    fn facet(&self) -> &str {
        match self {
            Unit::Single { facet, .. } | Unit::Bulk { facet, .. } => facet,
        }
    }

    fn ids(&self) -> Vec<EntityReference> {
        match self {
            Unit::Single { id, .. } => vec![id.clone()],
            Unit::Bulk { ids, .. } => ids.clone(),
        }
    }

    async fn run(self, fetcher: Fetcher) -> Vec<(EntityReference, FacetResult)> {
        match self {
            Unit::Single { id, key, handler, .. } => {
                let result = handler(fetcher, id.clone(), key)
                    .await
                    .map_err(|e| to_store_error(&e));
                vec![(id, result)]
            }
            Unit::Bulk { ids, key, handler, .. } => match handler(fetcher, ids.clone(), key).await {
                Ok(mut values) => ids
                    .into_iter()
                    .map(|id| {
                        let value = values.remove(&id);
                        (id, Ok(value))
                    })
                    .collect(),
                Err(e) => {
                    let err = to_store_error(&e);
                    ids.into_iter().map(|id| (id, Err(err.clone()))).collect()
                }
            },
        }
    }
}

pub struct MetaEngine {
    registry: Arc<MetaRegistry>,
    store: Arc<dyn DocumentStore>,
    policy: MetaFailurePolicy,
}

impl MetaEngine {
    pub fn new(registry: Arc<MetaRegistry>, store: Arc<dyn DocumentStore>, policy: MetaFailurePolicy) -> Self {
        Self {
            registry,
            store,
            policy,
        }
    }

    pub fn registry(&self) -> &MetaRegistry {
        &self.registry
    }

    pub fn policy(&self) -> MetaFailurePolicy {
        self.policy
    }

    /// Resolve a single facet for one id. Errors always fail the call;
    /// `Ok(None)` means the facet does not apply to this entity.
    pub async fn meta_one(&self, id: &EntityReference, facet: &str) -> Result<Option<Value>> {
        let units = self.unit_for(std::slice::from_ref(id), facet)?;
        let mut outcomes = self.run(units, true).await?;
        match outcomes.pop() {
            Some(outcome) => Ok(outcome.result?),
            None => Ok(None),
        }
    }

    /// Resolve one facet for many ids. Ids that are not found are left out.
    pub async fn meta_one_bulk(&self, ids: &[EntityReference], facet: &str) -> Result<BTreeMap<EntityReference, Value>> {
        let units = self.unit_for(ids, facet)?;
        let mut values = BTreeMap::new();
        for outcome in self.run(units, false).await? {
            match outcome.result {
                Ok(Some(value)) => {
                    values.insert(outcome.id, value);
                }
                Ok(None) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(values)
    }

    /// `meta/any` for one id
    pub async fn meta_any(&self, id: &EntityReference, includes: &[String]) -> Result<MetaResults> {
        let mut results = self.meta_bulk(std::slice::from_ref(id), includes).await?;
        Ok(results.remove(id).unwrap_or_default())
    }

    /// `meta/any` for many ids, coalescing reads across all of them
    pub async fn meta_bulk(
        &self,
        ids: &[EntityReference],
        includes: &[String],
    ) -> Result<BTreeMap<EntityReference, MetaResults>> {
        let fail_fast = self.policy == MetaFailurePolicy::FailFast;
        let mut results: BTreeMap<EntityReference, MetaResults> =
            ids.iter().map(|id| (id.clone(), MetaResults::new())).collect();

        let mut units = Vec::new();
        let mut seen = HashSet::new();
        for include in includes {
            if !seen.insert(include.as_str()) {
                continue;
            }
            match self.unit_for(ids, include) {
                Ok(facet_units) => units.extend(facet_units),
                Err(e) if fail_fast => return Err(e),
                Err(e) => {
                    log::debug!("[Meta] Skipping include {:?}: {}", include, e);
                    let slot = error_slot(&to_store_error(&e));
                    for meta in results.values_mut() {
                        meta.insert(include.clone(), slot.clone());
                    }
                }
            }
        }

        for outcome in self.run(units, fail_fast).await? {
            let meta = results.entry(outcome.id).or_default();
            match outcome.result {
                Ok(Some(value)) => {
                    meta.insert(outcome.facet, value);
                }
                Ok(None) => {}
                Err(e) => {
                    meta.insert(outcome.facet, error_slot(&e));
                }
            }
        }
        Ok(results)
    }

    /// Units resolving `facet` for `ids`: one per id for single-id handlers,
    /// one in total for bulk handlers
    fn unit_for(&self, ids: &[EntityReference], facet: &str) -> Result<Vec<Unit>> {
        let (handler, key) = self
            .registry
            .lookup(facet)
            .ok_or_else(|| StoreError::not_found(format!("unknown metadata {:?}", facet)))?;
        let units = match &handler.kind {
            MetaHandlerKind::Single(f) => ids
                .iter()
                .map(|id| Unit::Single {
                    id: id.clone(),
                    facet: facet.to_string(),
                    key: key.to_string(),
                    handler: Arc::clone(f),
                })
                .collect(),
            MetaHandlerKind::Bulk(f) => vec![Unit::Bulk {
                ids: ids.to_vec(),
                facet: facet.to_string(),
                key: key.to_string(),
                handler: Arc::clone(f),
            }],
        };
        Ok(units)
    }

    /// Run every unit to completion, flushing field requests whenever all
    /// running units are blocked on one.
    async fn run(&self, units: Vec<Unit>, fail_fast: bool) -> Result<Vec<Outcome>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FieldRequest>();
        let mut tasks = JoinSet::new();
        let mut running = HashSet::new();

        for (n, unit) in units.into_iter().enumerate() {
            let fetcher = Fetcher::new(n, tx.clone());
            let facet = unit.facet().to_string();
            let ids = unit.ids();
            running.insert(n);
            tasks.spawn(async move {
                let results = match AssertUnwindSafe(unit.run(fetcher)).catch_unwind().await {
                    Ok(results) => results,
                    Err(_) => {
                        log::error!("[Meta] Handler for {:?} panicked", facet);
                        let err = StoreError::Internal(format!("metadata handler {:?} failed", facet));
                        ids.into_iter().map(|id| (id, Err(err.clone()))).collect()
                    }
                };
                (n, facet, results)
            });
        }
        drop(tx);

        let mut blocked: HashSet<usize> = HashSet::new();
        let mut pending: Vec<FieldRequest> = Vec::new();
        let mut outcomes = Vec::new();

        while !running.is_empty() {
            // No unit can make progress without a flush.
            if !pending.is_empty() && blocked.len() == running.len() {
                self.flush(std::mem::take(&mut pending)).await?;
                blocked.clear();
                continue;
            }

            tokio::select! {
                Some(request) = rx.recv() => {
                    if running.contains(&request.unit) {
                        blocked.insert(request.unit);
                    }
                    pending.push(request);
                }
                Some(joined) = tasks.join_next() => {
                    let (n, facet, results) = joined.context("metadata task failed")?;
                    running.remove(&n);
                    blocked.remove(&n);
                    for (id, result) in results {
                        if fail_fast {
                            if let Err(e) = result {
                                return Err(anyhow::Error::new(e)
                                    .context(format!("cannot get {:?} for {}", facet, id)));
                            }
                        }
                        outcomes.push(Outcome {
                            id,
                            facet: facet.clone(),
                            result,
                        });
                    }
                }
                else => break,
            }
        }

        Ok(outcomes)
    }

    /// Issue one query per (collection, document) and answer every request
    async fn flush(&self, requests: Vec<FieldRequest>) -> Result<()> {
        let mut groups: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for request in &requests {
            for doc_id in &request.doc_ids {
                groups
                    .entry((request.collection.clone(), doc_id.clone()))
                    .or_default()
                    .extend(request.fields.iter().cloned());
            }
        }
        log::debug!(
            "[Meta] Flushing {} field requests as {} queries",
            requests.len(),
            groups.len()
        );

        let store = Arc::clone(&self.store);
        let docs: HashMap<(String, String), Result<Option<Map<String, Value>>, StoreError>> =
            tokio::task::spawn_blocking(move || {
                groups
                    .into_iter()
                    .map(|((collection, doc_id), fields)| {
                        let fields: Vec<String> = fields.into_iter().collect();
                        let result = store
                            .find_fields(&collection, &doc_id, &fields)
                            .map_err(|e| to_store_error(&e));
                        ((collection, doc_id), result)
                    })
                    .collect()
            })
            .await
            .context("metadata flush failed")?;

        for request in requests {
            let reply = request
                .doc_ids
                .iter()
                .map(|doc_id| match docs.get(&(request.collection.clone(), doc_id.clone())) {
                    Some(Ok(Some(doc))) => Ok(Some(project(doc, &request.fields))),
                    Some(Ok(None)) | None => Ok(None),
                    Some(Err(e)) => Err(e.clone()),
                })
                .collect::<Result<Vec<_>, StoreError>>();
            // The requester may have been cancelled; nothing to do then.
            let _ = request.reply.send(reply);
        }
        Ok(())
    }
}

fn project(doc: &Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|f| doc.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

fn error_slot(err: &StoreError) -> Value {
    serde_json::to_value(ErrorEnvelope::from(err)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::registry::MetaHandler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Document store double that counts and records every query
    #[derive(Default)]
    struct CountingStore {
        docs: HashMap<String, Map<String, Value>>,
        calls: AtomicUsize,
        queries: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl CountingStore {
        fn with_docs(docs: &[(&str, Value)]) -> Self {
            Self {
                docs: docs
                    .iter()
                    .map(|(id, doc)| (id.to_string(), doc.as_object().unwrap().clone()))
                    .collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DocumentStore for CountingStore {
        fn find_fields(&self, _collection: &str, id: &str, fields: &[String]) -> Result<Option<Map<String, Value>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push((id.to_string(), fields.to_vec()));
            Ok(self.docs.get(id).map(|doc| project(doc, fields)))
        }
    }

    fn field_handler(field: &'static str) -> MetaHandler {
        MetaHandler::single(move |fetcher: Fetcher, id: EntityReference, _key| async move {
            Ok::<_, anyhow::Error>(Some(fetcher.entity_field(&id, field).await?))
        })
    }

    fn id(s: &str) -> EntityReference {
        s.parse().unwrap()
    }

    fn engine(store: Arc<CountingStore>, registry: MetaRegistry, policy: MetaFailurePolicy) -> MetaEngine {
        MetaEngine::new(Arc::new(registry), store, policy)
    }

    fn includes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_disjoint_fields_of_one_document_cost_one_query() {
        let store = Arc::new(CountingStore::with_docs(&[(
            "cs:precise/wordpress-0",
            json!({"size": 42, "blobhash": "abcd", "other": true}),
        )]));
        let registry = MetaRegistry::builder()
            .register("a", field_handler("size"))
            .unwrap()
            .register("b", field_handler("blobhash"))
            .unwrap()
            .build();
        let engine = engine(Arc::clone(&store), registry, MetaFailurePolicy::PerFacet);

        let meta = engine
            .meta_any(&id("cs:precise/wordpress-0"), &includes(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(meta.get("a"), Some(&json!(42)));
        assert_eq!(meta.get("b"), Some(&json!("abcd")));
        assert_eq!(store.calls(), 1);

        let queries = store.queries.lock().unwrap();
        assert_eq!(queries[0].1, vec!["blobhash".to_string(), "size".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_include_is_partial_success() {
        let store = Arc::new(CountingStore::with_docs(&[("cs:precise/wordpress-0", json!({"size": 42}))]));
        let registry = MetaRegistry::builder()
            .register("a", field_handler("size"))
            .unwrap()
            .build();
        let engine = engine(store, registry, MetaFailurePolicy::PerFacet);

        let meta = engine
            .meta_any(&id("cs:precise/wordpress-0"), &includes(&["a", "no-such-thing"]))
            .await
            .unwrap();
        assert_eq!(meta.get("a"), Some(&json!(42)));
        assert_eq!(meta["no-such-thing"]["Code"], "not found");
    }

    #[tokio::test]
    async fn test_failing_facet_per_facet_and_fail_fast() {
        let doc = [("cs:precise/wordpress-0", json!({"size": 42}))];
        let build = || {
            MetaRegistry::builder()
                .register("a", field_handler("size"))
                .unwrap()
                .register(
                    "broken",
                    MetaHandler::single(|_, _, _| async {
                        Err::<Option<Value>, anyhow::Error>(StoreError::Forbidden("not for you".into()).into())
                    }),
                )
                .unwrap()
                .build()
        };

        let per_facet = engine(Arc::new(CountingStore::with_docs(&doc)), build(), MetaFailurePolicy::PerFacet);
        let meta = per_facet
            .meta_any(&id("cs:precise/wordpress-0"), &includes(&["a", "broken"]))
            .await
            .unwrap();
        assert_eq!(meta.get("a"), Some(&json!(42)));
        assert_eq!(meta["broken"], json!({"Message": "not for you", "Code": "forbidden"}));

        let fail_fast = engine(Arc::new(CountingStore::with_docs(&doc)), build(), MetaFailurePolicy::FailFast);
        let err = fail_fast
            .meta_any(&id("cs:precise/wordpress-0"), &includes(&["a", "broken"]))
            .await
            .unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(StoreError::Forbidden(_))));

        let err = fail_fast
            .meta_any(&id("cs:precise/wordpress-0"), &includes(&["a", "unknown"]))
            .await
            .unwrap_err();
        assert!(crate::error::is_not_found_error(&err));
    }

    #[tokio::test]
    async fn test_sequential_reads_and_idle_handlers_terminate() {
        let store = Arc::new(CountingStore::with_docs(&[
            ("cs:precise/wordpress-0", json!({"size": 1, "next": "cs:precise/mysql-0"})),
            ("cs:precise/mysql-0", json!({"size": 2})),
        ]));
        let registry = MetaRegistry::builder()
            // Two dependent rounds of reads.
            .register(
                "chain",
                MetaHandler::single(|fetcher: Fetcher, id: EntityReference, _| async move {
                    let next = fetcher.entity_field(&id, "next").await?;
                    let next: EntityReference = next.as_str().unwrap_or_default().parse()?;
                    Ok::<_, anyhow::Error>(Some(fetcher.entity_field(&next, "size").await?))
                }),
            )
            .unwrap()
            // Never touches the store.
            .register(
                "constant",
                MetaHandler::single(|_, _, _| async { Ok::<_, anyhow::Error>(Some(json!("c"))) }),
            )
            .unwrap()
            // Does other async work before reading.
            .register(
                "slow",
                MetaHandler::single(|fetcher: Fetcher, id: EntityReference, _| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, anyhow::Error>(Some(fetcher.entity_field(&id, "size").await?))
                }),
            )
            .unwrap()
            .register("absent", MetaHandler::single(|_, _, _| async { Ok::<_, anyhow::Error>(None) }))
            .unwrap()
            .build();
        let engine = engine(Arc::clone(&store), registry, MetaFailurePolicy::PerFacet);

        let meta = tokio::time::timeout(
            Duration::from_secs(5),
            engine.meta_any(
                &id("cs:precise/wordpress-0"),
                &includes(&["chain", "constant", "slow", "absent"]),
            ),
        )
        .await
        .expect("aggregation deadlocked")
        .unwrap();

        assert_eq!(meta.get("chain"), Some(&json!(2)));
        assert_eq!(meta.get("constant"), Some(&json!("c")));
        assert_eq!(meta.get("slow"), Some(&json!(1)));
        assert!(!meta.contains_key("absent"));
    }

    /// Sets its flag when dropped
    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropped_aggregation_abandons_facet_tasks() {
        use std::sync::atomic::AtomicBool;

        let started = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let (handler_started, handler_dropped) = (Arc::clone(&started), Arc::clone(&dropped));
        let registry = MetaRegistry::builder()
            .register(
                "stuck",
                MetaHandler::single(move |_, _, _| {
                    let started = Arc::clone(&handler_started);
                    let guard = DropFlag(Arc::clone(&handler_dropped));
                    async move {
                        let _guard = guard;
                        started.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, anyhow::Error>(None)
                    }
                }),
            )
            .unwrap()
            .register("a", field_handler("size"))
            .unwrap()
            .build();
        let store = Arc::new(CountingStore::with_docs(&[("cs:precise/wordpress-0", json!({"size": 1}))]));
        let engine = engine(store, registry, MetaFailurePolicy::PerFacet);

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            engine.meta_any(&id("cs:precise/wordpress-0"), &includes(&["stuck", "a"])),
        )
        .await;
        assert!(result.is_err(), "aggregation should still be waiting on the stuck facet");
        assert!(started.load(Ordering::SeqCst));

        // Abort is delivered on the task's next poll.
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dropped.load(Ordering::SeqCst), "facet task outlived its request");
    }

    #[tokio::test]
    async fn test_bulk_coalesces_across_ids() {
        let store = Arc::new(CountingStore::with_docs(&[
            ("cs:precise/wordpress-0", json!({"size": 1, "blobhash": "aa"})),
            ("cs:precise/mysql-0", json!({"size": 2, "blobhash": "bb"})),
        ]));
        let registry = MetaRegistry::builder()
            .register("hash", field_handler("blobhash"))
            .unwrap()
            .register(
                "sizes",
                MetaHandler::bulk(|fetcher: Fetcher, ids: Vec<EntityReference>, _| async move {
                    let keys: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                    let docs = fetcher
                        .fetch_many(crate::constants::ENTITIES_COLLECTION, &keys, &["size"])
                        .await?;
                    let sizes: BTreeMap<EntityReference, Value> = ids
                        .into_iter()
                        .zip(docs)
                        .filter_map(|(id, doc)| doc.and_then(|d| d.get("size").cloned()).map(|v| (id, v)))
                        .collect();
                    Ok::<_, anyhow::Error>(sizes)
                }),
            )
            .unwrap()
            .build();
        let engine = engine(Arc::clone(&store), registry, MetaFailurePolicy::PerFacet);

        let ids = vec![id("cs:precise/wordpress-0"), id("cs:precise/mysql-0"), id("cs:precise/gone-0")];
        let results = engine.meta_bulk(&ids, &includes(&["hash", "sizes"])).await.unwrap();

        assert_eq!(results[&ids[0]]["sizes"], json!(1));
        assert_eq!(results[&ids[1]]["sizes"], json!(2));
        assert_eq!(results[&ids[1]]["hash"], json!("bb"));
        assert_eq!(results[&ids[2]]["hash"]["Code"], "not found");
        assert!(!results[&ids[2]].contains_key("sizes"));
        // One query per document, however many facets read it.
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let store = Arc::new(CountingStore::with_docs(&[("cs:precise/wordpress-0", json!({"size": 42}))]));
        let registry = MetaRegistry::builder()
            .register("a", field_handler("size"))
            .unwrap()
            .register(
                "boom",
                MetaHandler::single(|_, _, _| async {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<_, anyhow::Error>(None)
                }),
            )
            .unwrap()
            .build();
        let engine = engine(store, registry, MetaFailurePolicy::PerFacet);

        let meta = engine
            .meta_any(&id("cs:precise/wordpress-0"), &includes(&["a", "boom"]))
            .await
            .unwrap();
        assert_eq!(meta.get("a"), Some(&json!(42)));
        assert!(meta["boom"].get("Message").is_some());
    }

    #[tokio::test]
    async fn test_meta_one() {
        let store = Arc::new(CountingStore::with_docs(&[("cs:precise/wordpress-0", json!({"size": 42}))]));
        let registry = MetaRegistry::builder()
            .register("a", field_handler("size"))
            .unwrap()
            .build();
        let engine = engine(store, registry, MetaFailurePolicy::PerFacet);

        let value = engine.meta_one(&id("cs:precise/wordpress-0"), "a").await.unwrap();
        assert_eq!(value, Some(json!(42)));

        let err = engine.meta_one(&id("cs:precise/missing-0"), "a").await.unwrap_err();
        assert!(crate::error::is_not_found_error(&err));
        let err = engine.meta_one(&id("cs:precise/wordpress-0"), "zzz").await.unwrap_err();
        assert!(crate::error::is_not_found_error(&err));

        let values = engine
            .meta_one_bulk(&[id("cs:precise/wordpress-0"), id("cs:precise/missing-0")], "a")
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
    }
}
