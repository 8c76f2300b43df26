//! Tracing setup for processes embedding the dispatcher.

use tracing_subscriber::EnvFilter;

fn filter(verbose: bool) -> EnvFilter {
    // RUST_LOG wins over the verbosity flag.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Install a human-readable subscriber. Returns false if one was already installed.
pub fn init_tracing(verbose: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .try_init()
        .is_ok()
}

/// Install a subscriber emitting one JSON object per event.
pub fn init_json_tracing(verbose: bool) -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(verbose))
        .try_init()
        .is_ok()
}
