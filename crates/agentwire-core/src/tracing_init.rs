//! Tracing/logging bootstrap for `agentwire` binaries and embedders.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Install the global tracing subscriber.
///
/// * `default_filter` -- filter used when `RUST_LOG` is unset or invalid
///   (e.g. `"agentwire_runtime=info"`).
/// * `log_json` -- emit one JSON object per event instead of the
///   human-readable format.
///
/// Fails if a global subscriber is already installed, which lets library
/// embedders keep their own subscriber.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Logs go to stderr so stdout stays free for command output.
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("tracing subscriber already set: {e}")))
}
