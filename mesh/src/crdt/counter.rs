use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::NodeId;

/// Grow-only per-node version counter for one context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionCounter {
    counts: BTreeMap<NodeId, u64>,
}

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count for `node` and return the new value
    pub fn increment(&mut self, node: &NodeId) -> u64 {
        let entry = self.counts.entry(node.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn get(&self, node: &NodeId) -> u64 {
        self.counts.get(node).copied().unwrap_or(0)
    }

    /// Sum over all nodes
    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    /// True if some node's count here is ahead of `seen`
    pub fn advances(&self, seen: &VersionCounter) -> bool {
        self.counts
            .iter()
            .any(|(node, &count)| count > seen.get(node))
    }

    /// Pointwise maximum. Returns true if any entry grew.
    pub fn merge(&mut self, other: &VersionCounter) -> bool {
        let mut changed = false;
        for (node, &count) in &other.counts {
            let entry = self.counts.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
                changed = true;
            }
        }
        changed
    }
}
