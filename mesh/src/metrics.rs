//! Counters for merge, gossip and persistence activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Diagnostic counters for one context manager
#[derive(Debug, Default)]
pub struct ContextMetrics {
    local_merges: AtomicU64,
    remote_merges: AtomicU64,
    removals: AtomicU64,
    notifications: AtomicU64,
    gossip_rounds: AtomicU64,
    sync_requests_sent: AtomicU64,
    peers_skipped: AtomicU64,
    malformed_messages: AtomicU64,
    persistence_writes: AtomicU64,
    persistence_failures: AtomicU64,
    tombstones_compacted: AtomicU64,
    contexts_expired: AtomicU64,
}

impl ContextMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_local_merge(&self) {
        self.local_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Record contexts changed by one inbound sync
    pub fn record_remote_merges(&self, changed: usize) {
        self.remote_merges
            .fetch_add(changed as u64, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gossip_round(&self, sent: usize, skipped: usize) {
        self.gossip_rounds.fetch_add(1, Ordering::Relaxed);
        self.sync_requests_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        self.peers_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn record_sync_sent(&self) {
        self.sync_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_skipped(&self) {
        self.peers_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_write(&self, success: bool) {
        if success {
            self.persistence_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_compaction(&self, dropped: usize) {
        self.tombstones_compacted
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn record_expired(&self, expired: usize) {
        self.contexts_expired
            .fetch_add(expired as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_merges: self.local_merges.load(Ordering::Relaxed),
            remote_merges: self.remote_merges.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            gossip_rounds: self.gossip_rounds.load(Ordering::Relaxed),
            sync_requests_sent: self.sync_requests_sent.load(Ordering::Relaxed),
            peers_skipped: self.peers_skipped.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            persistence_writes: self.persistence_writes.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            tombstones_compacted: self.tombstones_compacted.load(Ordering::Relaxed),
            contexts_expired: self.contexts_expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ContextMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub local_merges: u64,
    pub remote_merges: u64,
    pub removals: u64,
    pub notifications: u64,
    pub gossip_rounds: u64,
    pub sync_requests_sent: u64,
    pub peers_skipped: u64,
    pub malformed_messages: u64,
    pub persistence_writes: u64,
    pub persistence_failures: u64,
    pub tombstones_compacted: u64,
    pub contexts_expired: u64,
}
