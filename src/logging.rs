//! Logging setup for the binary.
//!
//! The library crates log through the `log` facade; the subscriber installed
//! here picks those records up through the `tracing-log` bridge.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{AppError, AppResult};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Filter directive for the given `-v` count.
pub fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => DEFAULT_FILTER,
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(json: bool, verbose: u8) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbose)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| AppError::Logging(e.to_string()))
}
