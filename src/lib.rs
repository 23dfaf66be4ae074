//! VSM context node
//!
//! Wires the context-mesh crate into a runnable process: configuration
//! loading, logging setup and an in-process cluster of context managers.

pub mod config;
pub mod logging;
pub mod node;

// Re-export everything from the context-mesh crate
pub use context_mesh as context;
