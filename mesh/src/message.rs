//! Wire messages exchanged on the context topic.
//!
//! Sync messages carry the raw CRDT triples rather than resolved maps so that
//! the receiver merges structurally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    clock::{NodeId, VectorClock},
    crdt::ContextState,
    error::TransportResult,
    transport::Frame,
    ContextMap,
};

/// Topic carrying every context mesh message
pub const CONTEXT_TOPIC: &str = "vsm.context.crdt";

/// A node's full replicated state plus its vector clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub from_node: NodeId,
    pub vector_clock: VectorClock,
    pub contexts: BTreeMap<String, ContextState>,
}

/// Notification published after a merge changed a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdate {
    pub context_id: String,
    pub context: ContextMap,
    pub origin_node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    SyncRequest(SyncPayload),
    SyncResponse(SyncPayload),
    ContextUpdate(ContextUpdate),
}

impl MeshMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_frame(&self) -> TransportResult<Frame> {
        Ok(Frame::new(CONTEXT_TOPIC, self.to_bytes()?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest(_) => "sync_request",
            Self::SyncResponse(_) => "sync_response",
            Self::ContextUpdate(_) => "context_update",
        }
    }
}
