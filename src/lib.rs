// src/lib.rs
//! Charm and bundle archive store.
//!
//! Archives are kept in a content-addressed [`blobstore`], described by
//! [`entity`] documents, and served over HTTP by [`server`]. Requests are
//! dispatched by the store's own [`router`]; metadata is resolved by the
//! coalescing [`meta`] engine.

pub mod blobstore;
pub mod charm;
pub mod constants;
pub mod entity;
pub mod error;
pub mod meta;
pub mod params;
pub mod reference;
pub mod router;
pub mod runtime;
pub mod server;
pub mod zipfile;

pub use entity::{Entity, EntityStore};
pub use error::StoreError;
pub use reference::EntityReference;
