use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{NodeId, VectorClock};

// ============================================================================
// Elements - Identity-Tagged Key/Value Entries
// ============================================================================

/// Globally unique element identity.
///
/// Re-adding the same key/value pair produces a distinguishable element, so a
/// removal only ever affects the additions the remover actually observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(Uuid);

impl ElementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for ElementId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single versioned field write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub key: String,
    pub value: Value,
    pub timestamp: u64,
    pub node_id: NodeId,
    pub element_id: ElementId,
}

impl Element {
    /// Total order used when folding live elements: later writes win
    pub(crate) fn order_key(&self) -> (u64, &NodeId, ElementId) {
        (self.timestamp, &self.node_id, self.element_id)
    }
}

/// Permanent removal marker for one observed element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub element: Element,
    /// Node that performed the removal
    pub removed_by: NodeId,
    /// `removed_by`'s vector clock entry at removal time
    pub removed_tick: u64,
}

impl Tombstone {
    fn dot(&self) -> (u64, &NodeId) {
        (self.removed_tick, &self.removed_by)
    }
}

// ============================================================================
// OR-Set - Observed-Remove Set of Elements
// ============================================================================

/// Observed-Remove Set.
///
/// Live elements are `additions - removals`, computed on every read. Tombstones
/// are only dropped by [`OrSet::compact`] once every known replica has seen them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OrSetWire", into = "OrSetWire")]
pub struct OrSet {
    additions: BTreeMap<ElementId, Element>,
    removals: BTreeMap<ElementId, Tombstone>,
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element. Returns false if the element was already known.
    pub fn add(&mut self, element: Element) -> bool {
        if self.additions.contains_key(&element.element_id) {
            return false;
        }
        self.additions.insert(element.element_id, element);
        true
    }

    /// Live elements in no particular order
    pub fn live(&self) -> impl Iterator<Item = &Element> {
        self.additions
            .values()
            .filter(|element| !self.removals.contains_key(&element.element_id))
    }

    pub fn is_removed(&self, id: &ElementId) -> bool {
        self.removals.contains_key(id)
    }

    /// Tombstone every live element whose key is in `keys`.
    ///
    /// Only elements already present locally are affected; additions this
    /// replica has not seen yet stay live once they arrive.
    pub fn remove_observed(&mut self, keys: &[&str], removed_by: &NodeId, tick: u64) -> usize {
        let observed: Vec<Element> = self
            .live()
            .filter(|element| keys.contains(&element.key.as_str()))
            .cloned()
            .collect();

        let removed = observed.len();
        for element in observed {
            self.removals.insert(
                element.element_id,
                Tombstone {
                    element,
                    removed_by: removed_by.clone(),
                    removed_tick: tick,
                },
            );
        }
        removed
    }

    /// Union of additions and removals. Returns true if anything was new.
    pub fn merge(&mut self, other: &OrSet) -> bool {
        let mut changed = false;

        for element in other.additions.values() {
            changed |= self.add(element.clone());
        }

        for tombstone in other.removals.values() {
            changed |= self.insert_tombstone(tombstone.clone());
        }

        changed
    }

    /// When two replicas removed the same element, keep the earliest removal
    /// dot so the choice does not depend on merge order.
    fn insert_tombstone(&mut self, tombstone: Tombstone) -> bool {
        let id = tombstone.element.element_id;
        match self.removals.get(&id) {
            None => {
                self.additions
                    .entry(id)
                    .or_insert_with(|| tombstone.element.clone());
                self.removals.insert(id, tombstone);
                true
            }
            Some(existing) if tombstone.dot() < existing.dot() => {
                self.removals.insert(id, tombstone);
                true
            }
            Some(_) => false,
        }
    }

    /// Drop tombstones (and their additions) whose removal every replica
    /// covered by `watermark` has already observed.
    pub fn compact(&mut self, watermark: &VectorClock) -> usize {
        let stable: Vec<ElementId> = self
            .removals
            .iter()
            .filter(|(_, tombstone)| watermark.get(&tombstone.removed_by) >= tombstone.removed_tick)
            .map(|(id, _)| *id)
            .collect();

        for id in &stable {
            self.removals.remove(id);
            self.additions.remove(id);
        }
        stable.len()
    }

    pub fn additions_len(&self) -> usize {
        self.additions.len()
    }

    pub fn tombstones_len(&self) -> usize {
        self.removals.len()
    }

    /// Largest timestamp carried by any element
    pub fn max_timestamp(&self) -> u64 {
        self.additions
            .values()
            .map(|element| element.timestamp)
            .max()
            .unwrap_or(0)
    }
}

/// Wire form: both halves travel as plain element lists
#[derive(Serialize, Deserialize)]
struct OrSetWire {
    #[serde(default)]
    additions: Vec<Element>,
    #[serde(default)]
    removals: Vec<Tombstone>,
}

impl From<OrSetWire> for OrSet {
    fn from(wire: OrSetWire) -> Self {
        let mut set = OrSet::new();
        for element in wire.additions {
            set.add(element);
        }
        for tombstone in wire.removals {
            set.insert_tombstone(tombstone);
        }
        set
    }
}

impl From<OrSet> for OrSetWire {
    fn from(set: OrSet) -> Self {
        Self {
            additions: set.additions.into_values().collect(),
            removals: set.removals.into_values().collect(),
        }
    }
}
