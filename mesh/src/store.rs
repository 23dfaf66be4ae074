//! Context store: sole owner and mutator of replicated context state.
//!
//! Not thread-safe by itself; the manager serializes access through a lock.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    clock::{MonotonicClock, NodeId, VectorClock},
    codec::ElementCodec,
    crdt::{ContextState, VersionCounter},
    ContextMap,
};

#[derive(Debug)]
pub struct ContextStore {
    node_id: NodeId,
    codec: ElementCodec,
    clock: MonotonicClock,
    vector_clock: VectorClock,
    contexts: BTreeMap<String, ContextState>,
    /// Last time each context's state changed
    touched: HashMap<String, Instant>,
    /// Last vector clock reported by each peer
    peer_clocks: BTreeMap<NodeId, VectorClock>,
    /// Every peer ever seen live or heard from
    known_peers: BTreeSet<NodeId>,
    /// Version counters of contexts evicted for idleness
    evicted: HashMap<String, VersionCounter>,
}

impl ContextStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            codec: ElementCodec::new(node_id.clone()),
            node_id,
            clock: MonotonicClock::new(),
            vector_clock: VectorClock::new(),
            contexts: BTreeMap::new(),
            touched: HashMap::new(),
            peer_clocks: BTreeMap::new(),
            known_peers: BTreeSet::new(),
            evicted: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    /// Fresh monotonic timestamp
    pub fn next_timestamp(&self) -> u64 {
        self.clock.tick()
    }

    /// Move the timestamp source past `timestamp`
    pub fn observe_timestamp(&self, timestamp: u64) {
        self.clock.observe(timestamp);
    }

    /// Apply a local write of `map` to a context and return its resolved value.
    ///
    /// Bumps this node's version counter and vector clock entry, adds one
    /// element per field and offers the whole map to the register. An empty
    /// map changes nothing.
    pub fn merge_local(&mut self, context_id: &str, map: &ContextMap) -> ContextMap {
        if map.is_empty() {
            return self.get(context_id);
        }

        let timestamp = self.clock.tick();
        self.vector_clock.tick(&self.node_id);

        // A context written again after eviction keeps counting from where it
        // stopped, so peers that evicted it too see the write as new
        let evicted = self.evicted.remove(context_id);
        let state = self
            .contexts
            .entry(context_id.to_string())
            .or_insert_with(|| ContextState {
                version_counter: evicted.unwrap_or_default(),
                ..ContextState::default()
            });
        state.version_counter.increment(&self.node_id);
        for element in self.codec.encode_at(map, timestamp) {
            state.or_set.add(element);
        }
        state
            .lww_register
            .set(map.clone(), timestamp, self.node_id.clone());

        let resolved = state.resolve();
        self.touched.insert(context_id.to_string(), Instant::now());
        resolved
    }

    /// Tombstone the observed elements for `keys`.
    ///
    /// Returns the new resolved value, or `None` when nothing was observed for
    /// those keys. The register is left alone; resolution never overlays a
    /// key without a live element.
    pub fn remove(&mut self, context_id: &str, keys: &[&str]) -> Option<ContextMap> {
        let state = self.contexts.get_mut(context_id)?;

        let has_observed = state
            .or_set
            .live()
            .any(|element| keys.contains(&element.key.as_str()));
        if !has_observed {
            return None;
        }

        let tick = self.vector_clock.tick(&self.node_id);
        state.version_counter.increment(&self.node_id);
        let removed = state.or_set.remove_observed(keys, &self.node_id, tick);
        debug!(context_id = %context_id, removed, "Removed observed elements");

        self.touched.insert(context_id.to_string(), Instant::now());
        Some(state.resolve())
    }

    /// Structurally merge a peer's snapshot.
    ///
    /// Returns the resolved value of every context whose state changed. A
    /// context evicted here is only re-created once the peer's copy carries a
    /// write this node had not seen when it evicted.
    pub fn merge_remote(
        &mut self,
        from: &NodeId,
        remote_clock: &VectorClock,
        contexts: &BTreeMap<String, ContextState>,
    ) -> Vec<(String, ContextMap)> {
        let mut changed = Vec::new();
        self.known_peers.insert(from.clone());

        for (context_id, remote) in contexts {
            if *remote == ContextState::default() {
                continue;
            }
            if let Some(seen) = self.evicted.get(context_id) {
                if !remote.version_counter.advances(seen) {
                    continue;
                }
                self.evicted.remove(context_id);
            }
            self.clock.observe(remote.max_timestamp());

            let state = self.contexts.entry(context_id.clone()).or_default();
            if state.merge(remote) {
                changed.push((context_id.clone(), state.resolve()));
                self.touched.insert(context_id.clone(), Instant::now());
            }
        }

        self.vector_clock.merge(remote_clock);
        self.peer_clocks
            .entry(from.clone())
            .or_default()
            .merge(remote_clock);

        changed
    }

    /// Resolved value, empty when the context was never touched
    pub fn get(&self, context_id: &str) -> ContextMap {
        self.contexts
            .get(context_id)
            .map(ContextState::resolve)
            .unwrap_or_default()
    }

    pub fn state(&self, context_id: &str) -> Option<&ContextState> {
        self.contexts.get(context_id)
    }

    /// Resolved contexts matching every `field => expected` pair in `filter`
    pub fn list(&self, filter: &ContextMap) -> BTreeMap<String, ContextMap> {
        self.contexts
            .iter()
            .map(|(context_id, state)| (context_id, state.resolve()))
            .filter(|(_, resolved)| {
                filter
                    .iter()
                    .all(|(field, expected)| resolved.get(field) == Some(expected))
            })
            .map(|(context_id, resolved)| (context_id.clone(), resolved))
            .collect()
    }

    /// Raw state of every context, for the wire
    pub fn snapshot(&self) -> BTreeMap<String, ContextState> {
        self.contexts.clone()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn peer_clock(&self, peer: &NodeId) -> Option<&VectorClock> {
        self.peer_clocks.get(peer)
    }

    /// Drop tombstones that every known peer has already observed.
    ///
    /// Known peers are every node ever seen live, every node a snapshot came
    /// from and every writer in the local vector clock. The watermark is the
    /// pointwise minimum of the local clock and the last clock reported by
    /// each of them. Nothing is dropped while a known peer is unreachable or
    /// has not reported yet.
    pub fn compact(&mut self, live_peers: &[NodeId]) -> usize {
        self.known_peers.extend(live_peers.iter().cloned());
        let writers: Vec<NodeId> = self
            .vector_clock
            .iter()
            .map(|(node, _)| node.clone())
            .collect();
        self.known_peers.extend(writers);
        self.known_peers.remove(&self.node_id);

        let mut watermark = self.vector_clock.clone();
        for peer in &self.known_peers {
            if !live_peers.contains(peer) {
                debug!(peer = %peer, "Known peer is not live, keeping tombstones");
                return 0;
            }
            match self.peer_clocks.get(peer) {
                Some(clock) => watermark = watermark.meet(clock),
                None => return 0,
            }
        }

        self.contexts
            .values_mut()
            .map(|state| state.or_set.compact(&watermark))
            .sum()
    }

    /// Evict contexts whose state has not changed within `ttl`.
    ///
    /// The evicted context's version counter is remembered so a peer still
    /// holding the same state cannot bring it back.
    pub fn expire_idle(&mut self, ttl: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .touched
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= ttl)
            .map(|(context_id, _)| context_id.clone())
            .collect();

        for context_id in &expired {
            if let Some(state) = self.contexts.remove(context_id) {
                self.evicted
                    .insert(context_id.clone(), state.version_counter);
            }
            self.touched.remove(context_id);
        }
        expired
    }
}
