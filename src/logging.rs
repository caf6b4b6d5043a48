//! Diagnostic output of the supervisor.
//!
//! Everything goes to stderr through `tracing`; stdout belongs to the
//! supervised payload, which inherits it. `RUST_LOG` takes precedence over the
//! command line flags.
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub fn level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::WARN;
    }
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn init(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level(verbose, quiet).to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
