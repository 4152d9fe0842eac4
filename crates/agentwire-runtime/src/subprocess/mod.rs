//! Agent subprocess management.

mod process;

pub use process::{AgentProcess, GRACE_PERIOD, ProcessError, ProcessState};
