//! Global constants and helpers for data-directory layout, server defaults, and well-known archive files
use std::path::{Path, PathBuf};

/// Binary name used in logs and the status endpoint
pub const BINARY_NAME: &str = "charmstore";

/// Package version from Cargo.toml (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Data Directory Layout
// ============================================================================

/// Directory (relative to the data dir) holding content-addressed blobs
pub const BLOB_DIR: &str = "blobs";

/// File (relative to the data dir) holding the persisted entity documents
pub const ENTITIES_FILE: &str = "entities.json";

/// Name of the collection holding one document per uploaded entity
pub const ENTITIES_COLLECTION: &str = "entities";

/// Resolves the blob directory for a data directory
pub fn blob_dir(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(BLOB_DIR)
}

/// Resolves the entity document file for a data directory
pub fn entities_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(ENTITIES_FILE)
}

// ============================================================================
// Server Defaults
// ============================================================================

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default upper bound for an uploaded archive body (256 MiB)
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 256 * 1024 * 1024;

// ============================================================================
// References
// ============================================================================

/// Series used for bundles; every other series denotes a charm
pub const BUNDLE_SERIES: &str = "bundle";

/// Prefix of the canonical string form of a reference
pub const REFERENCE_SCHEMA: &str = "cs";

// ============================================================================
// Archive Contents
// ============================================================================

pub const CHARM_METADATA_FILE: &str = "metadata.yaml";
pub const CHARM_CONFIG_FILE: &str = "config.yaml";
pub const CHARM_ACTIONS_FILE: &str = "actions.yaml";
pub const BUNDLE_DATA_FILE: &str = "bundle.yaml";
pub const ICON_FILE: &str = "icon.svg";

/// Upper bound for a single inner file read into memory at ingestion time
pub const MAX_INSPECTED_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Returns true if the archive path names a top-level README file
pub fn is_readme_file(name: &str) -> bool {
    if name.contains('/') {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower == "readme" || lower.starts_with("readme.")
}

/// Returns true if the archive path names the top-level icon
pub fn is_icon_file(name: &str) -> bool {
    name == ICON_FILE
}
