//! Logging setup
//!
//! Diagnostics go to stderr through `tracing`. `RUST_LOG` overrides the
//! level picked from the flags.

use tracing_subscriber::EnvFilter;

/// Level name for the given flags; `--debug` beats `--verbose`
pub fn level_for(verbose: bool, debug: bool) -> &'static str {
    if debug {
        "trace"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool, debug: bool, color: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose, debug)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(color)
        .with_target(debug)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
