//! Query handles and turn execution.

mod exec;
mod handle;

pub(crate) use exec::{TurnEnd, drain_turn, execute};
pub use handle::{DEFAULT_STREAM_CAPACITY, QueryError, QueryHandle, QueryStatus};
