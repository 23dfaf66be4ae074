use serde::{Deserialize, Serialize};

use crate::{clock::NodeId, ContextMap};

/// Value held by a [`LwwRegister`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterValue {
    pub value: ContextMap,
    pub timestamp: u64,
    pub node_id: NodeId,
}

/// Last-Writer-Wins register over a whole context snapshot.
///
/// An incoming value replaces the stored one only when its
/// `(timestamp, node_id)` pair is strictly greater; an exact tie keeps the
/// existing value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LwwRegister {
    current: Option<RegisterValue>,
}

impl LwwRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a write. Returns true if it became the current value.
    pub fn set(&mut self, value: ContextMap, timestamp: u64, node_id: NodeId) -> bool {
        self.offer(RegisterValue {
            value,
            timestamp,
            node_id,
        })
    }

    pub fn get(&self) -> Option<&RegisterValue> {
        self.current.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.current.as_ref().map_or(0, |current| current.timestamp)
    }

    pub fn merge(&mut self, other: &LwwRegister) -> bool {
        match &other.current {
            Some(incoming) => self.offer(incoming.clone()),
            None => false,
        }
    }

    fn offer(&mut self, incoming: RegisterValue) -> bool {
        let newer = match &self.current {
            None => true,
            Some(current) => {
                (incoming.timestamp, &incoming.node_id) > (current.timestamp, &current.node_id)
            }
        };
        if newer {
            self.current = Some(incoming);
        }
        newer
    }
}
