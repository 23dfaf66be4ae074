//! Error types for the context mesh.
//!
//! Only caller-supplied input errors surface from merges. Persistence and
//! transport failures are logged by the manager and never fail a merge.

use thiserror::Error;

use crate::clock::NodeId;

pub type ContextResult<T> = Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid context for '{context_id}': expected an object, got {found}")]
    InvalidContext {
        context_id: String,
        found: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Context manager already started")]
    AlreadyStarted,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(NodeId),

    #[error("Inbox for {0} already subscribed")]
    AlreadySubscribed(NodeId),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
