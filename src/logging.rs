//! Diagnostic logging.
//!
//! Progress lines go to stdout through [`crate::output`]; tracing events
//! (cache decisions, stale entries, failures) go to stderr so they never mix
//! with piped output. `RUST_LOG` takes precedence over the verbosity flag.

use std::io;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "simple_assets=debug,info"
    } else {
        "warn"
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(verbose: bool) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
}
