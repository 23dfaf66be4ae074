//! Element codec
//!
//! Converts a flat context map into identity-tagged elements and folds live
//! elements back into a flat map.

use crate::{
    clock::{MonotonicClock, NodeId},
    crdt::{Element, ElementId},
    ContextMap,
};

/// Stamps writes from one node with timestamps and fresh element ids
#[derive(Debug, Clone)]
pub struct ElementCodec {
    node_id: NodeId,
}

impl ElementCodec {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }

    /// One element per field, all sharing a single timestamp from `clock`
    pub fn encode(&self, map: &ContextMap, clock: &MonotonicClock) -> Vec<Element> {
        let timestamp = clock.tick();
        self.encode_at(map, timestamp)
    }

    pub fn encode_at(&self, map: &ContextMap, timestamp: u64) -> Vec<Element> {
        map.iter()
            .map(|(key, value)| Element {
                key: key.clone(),
                value: value.clone(),
                timestamp,
                node_id: self.node_id.clone(),
                element_id: ElementId::new(),
            })
            .collect()
    }
}

/// Fold elements into a flat map. When several elements share a key, the one
/// with the greatest `(timestamp, node_id, element_id)` wins, independent of
/// iteration order.
pub fn fold<'a>(elements: impl IntoIterator<Item = &'a Element>) -> ContextMap {
    let mut ordered: Vec<&Element> = elements.into_iter().collect();
    ordered.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let mut map = ContextMap::new();
    for element in ordered {
        map.insert(element.key.clone(), element.value.clone());
    }
    map
}
