// Logging setup for the CLI
use std::io::Write;

/// Dependencies whose debug output drowns out the store's own
const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "h2", "tower_http", "tokio", "mio"];

/// Initialize env_logger. `RUST_LOG`, when set, overrides everything here.
pub fn init_logger(verbose: bool, quiet: bool) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }

    let default_level = if quiet {
        log::LevelFilter::Error
    } else {
        // Server lifecycle and uploads are logged at info
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level).format(|buf, record| {
        if record.level() <= log::Level::Warn || record.level() >= log::Level::Debug {
            writeln!(buf, "[{}] {}", record.level(), record.args())
        } else {
            writeln!(buf, "{}", record.args())
        }
    });

    if verbose && !quiet {
        builder.filter_module("charmstore", log::LevelFilter::Debug);
        for module in NOISY_MODULES {
            builder.filter_module(module, log::LevelFilter::Info);
        }
    }

    builder.init();
}
