// Inspect command - read a local archive the way an upload would
use anyhow::{Context, Result};
use charmstore::blobstore::hash_bytes;
use charmstore::charm;
use charmstore::entity::Entity;
use charmstore::reference::EntityReference;
use charmstore::zipfile::ZipIndex;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
#[command(
    about = "Read a local charm or bundle archive",
    long_about = "Reads a charm or bundle archive from disk and prints what the store would
record for it on upload: hash, size, metadata, interfaces, bundle topology and
the archive manifest. Nothing is written to the store.",
    help_template = crate::clap_help!(
        examples: "  # Inspect a charm archive\n  \
                   {bin} inspect wordpress.zip --id precise/wordpress\n\n  \
                   # Inspect a bundle as JSON\n  \
                   {bin} inspect bundle.zip --id bundle/wiki --json"
    )
)]
pub struct InspectCommand {
    /// Archive file to inspect
    pub file: PathBuf,

    /// Reference the archive would be uploaded as; its series decides charm or bundle
    #[arg(long, default_value = "trusty/unknown")]
    pub id: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// List the archive's files too
    #[arg(long)]
    pub files: bool,
}

pub fn run(cmd: InspectCommand) -> Result<()> {
    let data = std::fs::read(&cmd.file).with_context(|| format!("Failed to read {}", cmd.file.display()))?;
    let id: EntityReference = cmd.id.parse()?;
    let hash = hash_bytes(&data);

    let mut entity = Entity::new(id, &hash, data.len() as i64);
    charm::inspect_archive(&data[..], data.len() as u64, &mut entity)?;
    let manifest = ZipIndex::read(&data[..], data.len() as u64)?.manifest();

    if cmd.json {
        let mut value = serde_json::to_value(&entity)?;
        if cmd.files {
            value["files"] = serde_json::json!(manifest
                .iter()
                .map(|(name, size)| serde_json::json!({ "Name": name, "Size": size }))
                .collect::<Vec<_>>());
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("File:     {}", cmd.file.display());
    println!("Id:       {}", entity.id);
    println!("Hash:     {}", entity.blob_hash);
    println!("Size:     {}", super::utils::format_bytes_compact(data.len() as u64));
    println!("Files:    {}", manifest.len());

    if entity.id.is_bundle() {
        println!("Charms:   {}", entity.bundle_charms.len());
        for charm in &entity.bundle_charms {
            println!("  {}", charm);
        }
        if let Some(units) = entity.bundle_unit_count {
            println!("Units:    {}", units);
        }
        if let Some(machines) = entity.bundle_machine_count {
            println!("Machines: {}", machines);
        }
        println!("Readme:   {}", if entity.bundle_readme.is_some() { "yes" } else { "no" });
    } else {
        let name = entity
            .charm_meta
            .as_ref()
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("");
        println!("Name:     {}", name);
        println!("Provides: {}", entity.charm_provided_interfaces.join(", "));
        println!("Requires: {}", entity.charm_required_interfaces.join(", "));
        println!("Config:   {}", if entity.charm_config.is_some() { "yes" } else { "no" });
        println!("Actions:  {}", if entity.charm_actions.is_some() { "yes" } else { "no" });
    }

    if cmd.files {
        println!();
        for (name, size) in &manifest {
            println!("{:>10}  {}", size, name);
        }
    }

    Ok(())
}
