//! Error types for the `agentwire` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `agentwire` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// CLI binary could not be located
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The agent CLI was not found in any of the searched locations.
#[derive(Debug, Error)]
#[error("Agent CLI not found (searched: {})", format_searched(.searched))]
pub struct DiscoveryError {
    pub searched: Vec<PathBuf>,
}

fn format_searched(searched: &[PathBuf]) -> String {
    if searched.is_empty() {
        return "PATH".to_string();
    }
    let mut out = String::from("PATH");
    for path in searched {
        out.push_str(", ");
        out.push_str(&path.display().to_string());
    }
    out
}
