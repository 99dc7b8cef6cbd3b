// src/meta/mod.rs
//! Metadata facets: registry, coalescing field fetcher, and the aggregation engine
//!
//! A facet handler never talks to the document store itself. It asks a
//! [`Fetcher`] for fields, and the [`MetaEngine`] that spawned it batches those
//! asks across every handler of the same request.

mod engine;
mod fetcher;
mod registry;

pub use engine::{MetaEngine, MetaFailurePolicy, MetaResults};
pub use fetcher::{FieldRequest, Fetcher};
pub use registry::{BulkFn, MetaHandler, MetaHandlerKind, MetaRegistry, MetaRegistryBuilder, PutFn, SingleFn};
