// src/charm.rs
//! Charm and bundle archive inspection at upload time
//!
//! The archive is read straight from the blob through the zip layer and the
//! results are denormalised onto the [`Entity`] so metadata requests never
//! have to open the archive again.

use crate::blobstore::ReadAt;
use crate::constants::{
    is_readme_file, BUNDLE_DATA_FILE, CHARM_ACTIONS_FILE, CHARM_CONFIG_FILE, CHARM_METADATA_FILE,
    MAX_INSPECTED_FILE_SIZE,
};
use crate::entity::Entity;
use crate::error::StoreError;
use crate::reference::EntityReference;
use crate::zipfile::{ZipFileEntry, ZipIndex};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// Fill the charm or bundle fields of `entity` from its archive.
///
/// Failures are reported as `BadRequest` so the uploader sees why the archive
/// was refused.
pub fn inspect_archive<R: ReadAt + ?Sized>(reader: &R, size: u64, entity: &mut Entity) -> Result<()> {
    let kind = if entity.id.is_bundle() { "bundle" } else { "charm" };
    inspect(reader, size, entity).map_err(|e| {
        StoreError::bad_request(format!("cannot read {} archive: {:#}", kind, e)).into()
    })
}

fn inspect<R: ReadAt + ?Sized>(reader: &R, size: u64, entity: &mut Entity) -> Result<()> {
    let index = ZipIndex::read(reader, size)?;
    if entity.id.is_bundle() {
        inspect_bundle(reader, &index, entity)
    } else {
        inspect_charm(reader, &index, entity)
    }
}

fn inspect_charm<R: ReadAt + ?Sized>(reader: &R, index: &ZipIndex, entity: &mut Entity) -> Result<()> {
    let meta = read_yaml(reader, index, CHARM_METADATA_FILE)?
        .ok_or_else(|| anyhow::anyhow!("{} not found", CHARM_METADATA_FILE))?;
    let name = meta.get("name").and_then(Value::as_str).unwrap_or_default();
    if name.is_empty() {
        anyhow::bail!("{}: charm name missing", CHARM_METADATA_FILE);
    }

    entity.charm_provided_interfaces = relation_interfaces(&meta, "provides");
    entity.charm_required_interfaces = relation_interfaces(&meta, "requires");
    entity.charm_meta = Some(meta);
    entity.charm_config = read_yaml(reader, index, CHARM_CONFIG_FILE)?;
    entity.charm_actions = read_yaml(reader, index, CHARM_ACTIONS_FILE)?;
    Ok(())
}

fn inspect_bundle<R: ReadAt + ?Sized>(reader: &R, index: &ZipIndex, entity: &mut Entity) -> Result<()> {
    let data = read_yaml(reader, index, BUNDLE_DATA_FILE)?
        .ok_or_else(|| anyhow::anyhow!("{} not found", BUNDLE_DATA_FILE))?;
    let services = data
        .get("services")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow::anyhow!("{}: no services defined", BUNDLE_DATA_FILE))?;

    let mut charms = BTreeSet::new();
    let mut units = 0u64;
    let mut unplaced_units = 0u64;
    for (name, service) in services {
        let charm = service
            .get("charm")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("service {:?} has no charm", name))?;
        let reference: EntityReference = charm
            .parse()
            .with_context(|| format!("service {:?} has invalid charm {:?}", name, charm))?;
        charms.insert(reference.base().to_string());
        charms.insert(reference.to_string());

        let num_units = service.get("num_units").and_then(Value::as_u64).unwrap_or(0);
        units += num_units;
        let placed = service
            .get("to")
            .map(|to| !matches!(to, Value::Null) && to.as_array().map_or(true, |a| !a.is_empty()))
            .unwrap_or(false);
        if !placed {
            unplaced_units += num_units;
        }
    }

    // Declared machines, or one new machine per unit without a placement.
    let machines = match data.get("machines").and_then(Value::as_object) {
        Some(machines) => machines.len() as u64,
        None => unplaced_units,
    };

    entity.bundle_readme = match index.find_file(is_readme_file) {
        Some(entry) => {
            let bytes = ZipFileEntry::locate(reader, entry)?.read_to_vec(reader, MAX_INSPECTED_FILE_SIZE)?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => None,
    };
    entity.bundle_charms = charms.into_iter().collect();
    entity.bundle_unit_count = Some(units);
    entity.bundle_machine_count = Some(machines);
    entity.bundle_data = Some(data);
    Ok(())
}

/// Parse an optional YAML file of the archive into JSON
fn read_yaml<R: ReadAt + ?Sized>(reader: &R, index: &ZipIndex, name: &str) -> Result<Option<Value>> {
    let entry = match index.find(name) {
        Some(entry) if !entry.is_dir() => entry,
        _ => return Ok(None),
    };
    let bytes = ZipFileEntry::locate(reader, entry)?.read_to_vec(reader, MAX_INSPECTED_FILE_SIZE)?;
    let value: Value = serde_yaml::from_slice(&bytes).with_context(|| format!("cannot parse {}", name))?;
    Ok(Some(value))
}

/// Interface names of the `provides`/`requires` relations, sorted and deduplicated
fn relation_interfaces(meta: &Value, kind: &str) -> Vec<String> {
    let relations = match meta.get(kind).and_then(Value::as_object) {
        Some(relations) => relations,
        None => return Vec::new(),
    };
    let interfaces: BTreeSet<String> = relations
        .values()
        .filter_map(|relation| match relation {
            // Shorthand form: `website: http`
            Value::String(interface) => Some(interface.clone()),
            other => other.get("interface").and_then(Value::as_str).map(str::to_string),
        })
        .collect();
    interfaces.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zipfile::tests::make_zip;

    const WORDPRESS_META: &[u8] = b"name: wordpress
summary: Blog engine
description: Blog engine
provides:
  website:
    interface: http
  nrpe: local-monitors
requires:
  db:
    interface: mysql
  cache:
    interface: memcache
";

    #[test]
    fn test_inspect_charm() {
        let archive = make_zip(&[
            ("metadata.yaml", WORDPRESS_META, true),
            ("config.yaml", &b"options:\n  blog-title:\n    type: string\n    default: My Title\n"[..], false),
            ("hooks/install", &b"#!/bin/sh\n"[..], true),
        ]);
        let mut entity = Entity::new("cs:precise/wordpress-0".parse().unwrap(), "aa", archive.len() as i64);
        inspect_archive(&archive[..], archive.len() as u64, &mut entity).unwrap();

        assert_eq!(entity.charm_meta.as_ref().unwrap()["name"], "wordpress");
        assert_eq!(entity.charm_provided_interfaces, vec!["http", "local-monitors"]);
        assert_eq!(entity.charm_required_interfaces, vec!["memcache", "mysql"]);
        assert_eq!(
            entity.charm_config.as_ref().unwrap()["options"]["blog-title"]["default"],
            "My Title"
        );
        assert!(entity.charm_actions.is_none());
        assert!(entity.bundle_data.is_none());
    }

    #[test]
    fn test_inspect_charm_without_metadata() {
        let archive = make_zip(&[("README.md", &b"hello"[..], false)]);
        let mut entity = Entity::new("cs:precise/wordpress-0".parse().unwrap(), "aa", archive.len() as i64);
        let err = inspect_archive(&archive[..], archive.len() as u64, &mut entity).unwrap_err();
        let store_err = crate::error::classify(&err).unwrap();
        assert!(matches!(store_err, StoreError::BadRequest(_)));
        assert!(err.to_string().contains("cannot read charm archive"));
    }

    #[test]
    fn test_inspect_bundle() {
        let bundle = b"services:
  wordpress:
    charm: cs:precise/wordpress-3
    num_units: 2
  mysql:
    charm: cs:~bob/precise/mysql
    num_units: 1
    to: [\"0\"]
machines:
  \"0\": {}
  \"1\": {}
";
        let archive = make_zip(&[
            ("bundle.yaml", &bundle[..], true),
            ("README.md", &b"# A bundle\n"[..], true),
        ]);
        let mut entity = Entity::new("cs:bundle/wordpress-simple-0".parse().unwrap(), "aa", archive.len() as i64);
        inspect_archive(&archive[..], archive.len() as u64, &mut entity).unwrap();

        assert_eq!(entity.bundle_unit_count, Some(3));
        assert_eq!(entity.bundle_machine_count, Some(2));
        assert_eq!(entity.bundle_readme.as_deref(), Some("# A bundle\n"));
        assert_eq!(
            entity.bundle_charms,
            vec![
                "cs:precise/wordpress-3".to_string(),
                "cs:wordpress".to_string(),
                "cs:~bob/mysql".to_string(),
                "cs:~bob/precise/mysql".to_string(),
            ]
        );
    }

    #[test]
    fn test_bundle_readme_matches_cleaned_name() {
        let bundle = b"services:\n  wordpress:\n    charm: cs:precise/wordpress\n";
        let archive = make_zip(&[
            ("bundle.yaml", &bundle[..], true),
            ("./README.md", &b"# Dotted\n"[..], true),
        ]);
        let mut entity = Entity::new("cs:bundle/dotted-0".parse().unwrap(), "aa", archive.len() as i64);
        inspect_archive(&archive[..], archive.len() as u64, &mut entity).unwrap();
        assert_eq!(entity.bundle_readme.as_deref(), Some("# Dotted\n"));
    }

    #[test]
    fn test_inspect_bundle_unplaced_units_count_machines() {
        let bundle = b"services:\n  wordpress:\n    charm: cs:precise/wordpress\n    num_units: 4\n";
        let archive = make_zip(&[("bundle.yaml", &bundle[..], false)]);
        let mut entity = Entity::new("cs:bundle/wp-0".parse().unwrap(), "aa", archive.len() as i64);
        inspect_archive(&archive[..], archive.len() as u64, &mut entity).unwrap();
        assert_eq!(entity.bundle_unit_count, Some(4));
        assert_eq!(entity.bundle_machine_count, Some(4));
        assert!(entity.bundle_readme.is_none());
    }
}
