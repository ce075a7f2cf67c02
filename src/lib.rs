//! Crabswarm - Agent-to-Agent (A2A) orchestration engine.
//!
//! Discovers remote agents, decomposes a request into a task graph,
//! dispatches sub-tasks over JSON-RPC (sync and streaming), and merges
//! the terminal results into a single response message.

pub mod a2a;
pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::{A2aError, ErrorKind, Result};

/// Crate version, reported on agent cards and the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
