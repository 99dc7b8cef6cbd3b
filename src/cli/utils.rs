// Shared utility functions for CLI commands

use anyhow::{Context, Result};
use charmstore::constants;
use charmstore::entity::EntityStore;
use std::path::Path;

/// Open the entity documents of a data directory without starting a server
pub fn open_entity_store(dir: &Path) -> Result<EntityStore> {
    let path = constants::entities_path(dir);
    if !path.exists() {
        anyhow::bail!(
            "No store found in {} (start '{} server' there first)",
            dir.display(),
            constants::BINARY_NAME
        );
    }
    EntityStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

/// Compact byte size: 512B, 1.5K, 2.3M, 1.2G
pub fn format_bytes_compact(bytes: u64) -> String {
    const UNITS: &[&str] = &["K", "M", "G", "T"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for u in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = u;
    }
    format!("{:.1}{}", value, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_compact() {
        assert_eq!(format_bytes_compact(512), "512B");
        assert_eq!(format_bytes_compact(1536), "1.5K");
        assert_eq!(format_bytes_compact(5 * 1024 * 1024), "5.0M");
    }
}
