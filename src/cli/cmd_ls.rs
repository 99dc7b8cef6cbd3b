use anyhow::Result;
use charmstore::entity::Entity;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
#[command(
    about = "List stored entities (machine-readable)",
    after_help = "Examples:\n  \
            # List all entities\n  \
            charmstore ls\n\n  \
            # Human-readable sizes\n  \
            charmstore ls -H\n\n  \
            # Last 10 uploads\n  \
            charmstore ls -n 10\n\n  \
            # Custom format\n  \
            charmstore ls --format \"id,hash_short,size_h\"\n\n  \
            # Scripting examples\n  \
            charmstore ls --no-header | cut -f1        # Just ids\n  \
            charmstore ls --separator \",\" > store.csv  # Export to CSV"
)]
pub struct LsCommand {
    /// Show only the last N uploads (0 = all)
    #[arg(short = 'n', long, default_value = "0")]
    pub last: usize,

    /// Output format: id,base,kind,hash,hash_short,date,size,size_h,revision,extra
    #[arg(long, default_value = "id,hash,date,size")]
    pub format: String,

    /// Omit header row
    #[arg(long)]
    pub no_header: bool,

    /// Field separator (default: tab)
    #[arg(long, default_value = "\t")]
    pub separator: String,

    /// Print human-readable sizes (e.g., 1.5K, 2.3M)
    #[arg(short = 'H', long = "human-readable")]
    pub human_readable: bool,
}

pub fn run(cmd: LsCommand, dir: PathBuf) -> Result<()> {
    let store = super::utils::open_entity_store(&dir)?;

    // Oldest upload first, like a log
    let mut entities = store.list()?;
    entities.sort_by(|a, b| a.upload_time.cmp(&b.upload_time).then_with(|| a.id.cmp(&b.id)));

    let entities = if cmd.last > 0 && cmd.last < entities.len() {
        entities.split_off(entities.len() - cmd.last)
    } else {
        entities
    };

    let fields: Vec<&str> = cmd
        .format
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if !cmd.no_header {
        println!("{}", fields.join(&cmd.separator));
    }
    for entity in &entities {
        let values: Vec<String> = fields
            .iter()
            .map(|f| field_value(entity, f, cmd.human_readable))
            .collect();
        println!("{}", values.join(&cmd.separator));
    }

    Ok(())
}

fn field_value(entity: &Entity, field: &str, human_readable: bool) -> String {
    match field {
        "id" => entity.id.to_string(),
        "base" => entity.base_url.to_string(),
        "kind" => (if entity.id.is_bundle() { "bundle" } else { "charm" }).to_string(),
        "hash" => entity.blob_hash.clone(),
        "hash_short" => entity.blob_hash.chars().take(12).collect(),
        "date" | "time" => entity.upload_time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "size" if human_readable => super::utils::format_bytes_compact(entity.blob_size.max(0) as u64),
        "size" => entity.blob_size.to_string(),
        "size_h" => super::utils::format_bytes_compact(entity.blob_size.max(0) as u64),
        "revision" => entity.id.revision.map(|r| r.to_string()).unwrap_or_default(),
        "extra" => entity.extra_info.len().to_string(),
        _ => String::new(),
    }
}
