// Server command - start HTTP server
use anyhow::{Context, Result};
use charmstore::constants;
use charmstore::meta::MetaFailurePolicy;
use charmstore::runtime::ServerRuntime;
use charmstore::server::{start_server, ServerConfig};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Runtime;

fn parse_duration_for_clap(s: &str) -> Result<Duration, String> {
    charmstore::server::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Args)]
#[command(
    about = "Start HTTP server",
    long_about = "Start an HTTP server that accepts charm and bundle archive uploads and
serves archives, files inside them and metadata about them.

Archives are stored by SHA-256 under <dir>/blobs and entity documents in
<dir>/entities.json. Both are created on first start.

Metadata requests for several facets (meta/any?include=...) are resolved
concurrently and their store reads coalesced. By default a failing facet is
reported in its own slot; --fail-fast-meta fails the whole request instead.",
    help_template = crate::clap_help!(
        examples: "  # Start server on default port (8080)\n  \
                   {bin} server\n\n  \
                   # Custom host, port and data directory\n  \
                   {bin} -C /var/lib/charmstore server --host 0.0.0.0 --port 3000\n\n  \
                   # Verify uploaded hashes, 10s request timeout\n  \
                   {bin} server --verify-hashes --timeout 10s"
    )
)]
pub struct ServerCommand {
    /// HTTP server port
    #[arg(long, default_value_t = constants::DEFAULT_PORT, help_heading = "Server Options")]
    pub port: u16,

    /// HTTP server host
    #[arg(long, default_value = constants::DEFAULT_HOST, help_heading = "Server Options")]
    pub host: String,

    /// Per-request timeout (e.g. 30s, 2m)
    #[arg(long, default_value = "30s", value_parser = parse_duration_for_clap, help_heading = "Server Options")]
    pub timeout: Duration,

    /// Largest accepted archive upload in bytes
    #[arg(long, default_value_t = constants::DEFAULT_MAX_UPLOAD_SIZE, help_heading = "Server Options")]
    pub max_upload_size: usize,

    /// Recompute the SHA-256 of every upload and reject mismatches
    #[arg(long, help_heading = "Store Options")]
    pub verify_hashes: bool,

    /// How meta/any reports failing facets
    #[arg(long, value_enum, default_value_t = MetaFailurePolicy::PerFacet, help_heading = "Store Options")]
    pub meta_policy: MetaFailurePolicy,

    /// Shorthand for --meta-policy fail-fast
    #[arg(long, help_heading = "Store Options")]
    pub fail_fast_meta: bool,
}

pub fn run(cmd: ServerCommand, dir: PathBuf) -> Result<()> {
    let rt = Runtime::new().context("Failed to create tokio runtime")?;

    let mut config = ServerConfig::new(dir);
    config.host = cmd.host;
    config.port = cmd.port;
    config.request_timeout = cmd.timeout;
    config.max_upload_size = cmd.max_upload_size;
    config.verify_hashes = cmd.verify_hashes;
    config.meta_policy = if cmd.fail_fast_meta {
        MetaFailurePolicy::FailFast
    } else {
        cmd.meta_policy
    };

    let runtime = ServerRuntime::new();
    rt.block_on(start_server(config, &runtime, true))
}
