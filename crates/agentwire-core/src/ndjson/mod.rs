//! Stream-json protocol for the agent CLI.
//!
//! This module turns the CLI's stdout into canonical message types. The
//! [`StreamDecoder`] accumulates arbitrary byte fragments and speculatively
//! parses complete JSON values out of them; [`parse_value`] validates one
//! value against the closed set of message tags.

mod decoder;
mod error;
mod parser;
mod types;

pub use decoder::{MAX_BUFFER_SIZE, StreamDecoder};
pub use error::DecodeError;
pub use parser::{parse_line, parse_value};
pub use types::*;
