//! Replicated Context Store and Gossip Synchronization
//!
//! This crate keeps named, semi-structured contexts consistent across the
//! nodes of a control platform without coordination:
//! - Conflict-free context state (version counter, OR-Set, LWW register)
//! - Vector clocks and a monotonic timestamp source
//! - Periodic gossip fan-out of full snapshots to live peers
//! - Change notifications and pluggable persistence of resolved contexts

pub mod clock;
pub mod codec;
pub mod config;
pub mod crdt;
pub mod error;
pub mod gossip;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod notifier;
pub mod persistence;
pub mod store;
pub mod transport;

#[cfg(test)]
mod tests;

/// Flat key/value view of one context
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

// Re-export commonly used types
pub use clock::{ClockOrdering, MonotonicClock, NodeId, VectorClock};
pub use config::{ContextMeshConfig, PersistenceConfig};
pub use crdt::ContextState;
pub use error::{ContextError, ContextResult, PersistenceError, TransportError};
pub use manager::ContextManager;
pub use message::{ContextUpdate, MeshMessage, SyncPayload, CONTEXT_TOPIC};
pub use metrics::MetricsSnapshot;
pub use persistence::{create_persistence, ContextPersistence, PersistedContext};
pub use transport::{Frame, LocalBus, LocalTransport, Transport};
