//! Structured logging setup.
//!
//! Log lines go to stderr through `tracing_subscriber`'s fmt layer. The
//! filter is read from `LOG_LEVEL` (e.g. `LOG_LEVEL=soundboard=debug`),
//! falling back to `info`, or `debug` when `--verbose` is given.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

pub fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(LOG_LEVEL_ENV)
        .from_env_lossy()
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .try_init();
}
