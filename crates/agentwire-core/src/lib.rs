//! `agentwire` Core Library
//!
//! Shared functionality for driving an external agent CLI over stream-json:
//! - Speculative NDJSON decoding into typed protocol messages
//! - Command-line building and CLI binary discovery
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod command;
pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use command::{
    AgentOptions, CommandSpec, PermissionMode, build_command, discover, resolve_cli_path,
};
pub use config::Config;
pub use error::{Error, Result};
