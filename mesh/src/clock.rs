use std::{
    cmp::Ordering as CmpOrdering,
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// ============================================================================
// Node Identity - Stable Per-Process Identity
// ============================================================================

/// Node ID, an opaque string that is unique per running process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh node ID
    pub fn generate() -> Self {
        Self(format!("node-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Vector Clock - Causal Ordering Across Replicas
// ============================================================================

/// Result of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Less,
    Greater,
    Equal,
    Concurrent,
}

/// Per-node logical tick counts.
///
/// A node only ever increments its own entry; entries for other nodes grow
/// through [`VectorClock::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the entry for `node` and return the new tick
    pub fn tick(&mut self, node: &NodeId) -> u64 {
        let entry = self.entries.entry(node.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Tick count recorded for `node` (0 when never seen)
    pub fn get(&self, node: &NodeId) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Pointwise maximum over the union of entries
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &ticks) in &other.entries {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(ticks);
        }
    }

    /// Pointwise minimum over the union of entries. Missing entries count as 0.
    pub fn meet(&self, other: &VectorClock) -> VectorClock {
        let entries = self
            .entries
            .keys()
            .chain(other.entries.keys())
            .map(|node| (node.clone(), self.get(node).min(other.get(node))))
            .filter(|(_, ticks)| *ticks > 0)
            .collect();
        VectorClock { entries }
    }

    /// Compare causality. Used for diagnostics; merges are never rejected.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            match self.get(node).cmp(&other.get(node)) {
                CmpOrdering::Less => less = true,
                CmpOrdering::Greater => greater = true,
                CmpOrdering::Equal => {}
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Less,
            (false, true) => ClockOrdering::Greater,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Entries in node order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.entries.iter().map(|(node, ticks)| (node, *ticks))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Monotonic Clock - Element and Register Timestamps
// ============================================================================

/// Furthest ahead of the local wall clock an observed timestamp may move us
pub const MAX_CLOCK_DRIFT_MICROS: u64 = 24 * 60 * 60 * 1_000_000;

/// Per-process timestamp source, microseconds since the epoch.
///
/// Never returns the same value twice and never goes backwards, even when the
/// wall clock does. Observing a remote timestamp moves the clock past it so
/// that local writes made after a sync win over what was seen. Observations
/// are capped at [`MAX_CLOCK_DRIFT_MICROS`] ahead of the wall clock.
#[derive(Debug)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl Clone for MonotonicClock {
    fn clone(&self) -> Self {
        Self {
            last: AtomicU64::new(self.last.load(Ordering::SeqCst)),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Return a timestamp strictly greater than any previously issued or observed
    pub fn tick(&self) -> u64 {
        let wall = wall_clock_micros();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(current.saturating_add(1));
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Advance the clock to at least `remote`, capped at the drift bound
    pub fn observe(&self, remote: u64) {
        let bound = wall_clock_micros().saturating_add(MAX_CLOCK_DRIFT_MICROS);
        if remote > bound {
            warn!(remote, bound, "Observed timestamp too far ahead, clamping");
        }
        self.last.fetch_max(remote.min(bound), Ordering::SeqCst);
    }

    /// Last issued or observed timestamp
    pub fn now(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_micros() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}
