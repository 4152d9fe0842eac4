//! Per-session message queues with a single-concurrency worker each.

mod manager;
mod session;
mod types;
mod worker;

pub use manager::QueueManager;
pub use types::{MessageStatus, QueueError, QueueStats, QueuedMessage};
