use anyhow::Result;
use clap::{Parser, Subcommand, ValueHint};
use std::path::PathBuf;

// CLI Commands (cmd_ prefix)
mod cmd_inspect;
mod cmd_ls;
mod cmd_server;

// Helper modules (no cmd_ prefix)
mod logger;
mod utils;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format custom help template with grouped commands
fn format_help_template() -> &'static str {
    concat!(
        "{about-with-newline}\n\n",
        "{usage-heading}\n  {usage}\n\n",
        "Options:\n{options}\n\n",
        "Store:\n",
        "  ls        List stored entities (machine-readable)\n",
        "  inspect   Read a local charm or bundle archive\n",
        "\n",
        "Server:\n",
        "  server    Start HTTP server\n",
        "\n",
        "See 'charmstore <COMMAND> --help' for more information on a specific command.\n"
    )
}

#[derive(Parser)]
#[command(bin_name = "charmstore")]
#[command(version = VERSION)]
#[command(about = concat!("charmstore v", env!("CARGO_PKG_VERSION"), " - Charm and bundle archive store"))]
#[command(long_about = concat!(
    "charmstore v", env!("CARGO_PKG_VERSION"), " - Charm and bundle archive store\n\n",
    "Stores versioned charm and bundle archives by content hash and serves\n",
    "their files and metadata over HTTP. Metadata for many facets and ids\n",
    "can be requested in one call."
))]
#[command(author)]
#[command(propagate_version = true)]
#[command(help_template = format_help_template())]
pub struct Cli {
    /// Data directory
    #[arg(short = 'C', long = "dir", global = true, default_value = ".", value_hint = ValueHint::DirPath)]
    dir: PathBuf,

    /// Only print errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Enable verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Ls(cmd_ls::LsCommand),
    Inspect(cmd_inspect::InspectCommand),
    Server(cmd_server::ServerCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbosity flags
    logger::init_logger(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Ls(cmd) => cmd_ls::run(cmd, cli.dir)?,
        Commands::Inspect(cmd) => cmd_inspect::run(cmd)?,
        Commands::Server(cmd) => cmd_server::run(cmd, cli.dir)?,
    }

    Ok(())
}

/// Macro to create clap help templates with examples
/// This works around the limitation that {bin} doesn't work in after_help
#[macro_export]
macro_rules! clap_help {
    (examples: $examples:literal) => {{
        const BIN: &str = env!("CARGO_PKG_NAME");
        concat!(
            "{about-with-newline}\n",
            "{usage-heading} {usage}\n\n",
            "{all-args}\n\n",
            "Examples:\n",
            $examples
        ).replace("{bin}", BIN)
    }};
}
