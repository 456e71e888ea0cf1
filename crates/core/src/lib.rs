// Core types and execution engine for RustMake workflows

pub mod actions;
pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use error::{GraphError, NodeError, RunError};
pub use types::*;
