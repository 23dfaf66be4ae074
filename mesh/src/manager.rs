//! Context manager
//!
//! Caller-facing API over the context store. Local and remote merges are
//! serialized through one lock. Persistence records and local notifications
//! are queued under that lock so they follow merge order; network I/O happens
//! after it is released.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    clock::{NodeId, VectorClock},
    config::ContextMeshConfig,
    error::{ContextError, ContextResult},
    gossip::GossipSynchronizer,
    message::{ContextUpdate, MeshMessage, SyncPayload, CONTEXT_TOPIC},
    metrics::{ContextMetrics, MetricsSnapshot},
    notifier::BroadcastNotifier,
    persistence::{self, ContextPersistence, PersistedContext},
    store::ContextStore,
    transport::{Frame, Transport},
    ContextMap,
};

pub struct ContextManager {
    node_id: NodeId,
    config: ContextMeshConfig,
    store: RwLock<ContextStore>,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn ContextPersistence>,
    persist_tx: mpsc::UnboundedSender<PersistedContext>,
    persist_rx: Mutex<Option<mpsc::UnboundedReceiver<PersistedContext>>>,
    notifier: BroadcastNotifier,
    metrics: Arc<ContextMetrics>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("node_id", &self.node_id)
            .field("contexts", &self.store.read().len())
            .field("persistence", &self.persistence.backend_name())
            .finish()
    }
}

impl ContextManager {
    /// Create a manager for the node the transport delivers for.
    ///
    /// Background work (gossip, inbound handling, persistence writes) starts
    /// with [`ContextManager::start`].
    pub fn new(
        config: ContextMeshConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn ContextPersistence>,
    ) -> ContextResult<Arc<Self>> {
        config.validate().map_err(ContextError::Config)?;

        let node_id = transport.local_node().clone();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let notifier = BroadcastNotifier::new(config.notification_capacity, transport.clone());

        info!(
            node = %node_id,
            persistence = persistence.backend_name(),
            gossip_interval_ms = config.gossip_interval_ms,
            "Creating context manager"
        );

        Ok(Arc::new(Self {
            store: RwLock::new(ContextStore::new(node_id.clone())),
            node_id,
            config,
            transport,
            persistence,
            persist_tx,
            persist_rx: Mutex::new(Some(persist_rx)),
            notifier,
            metrics: Arc::new(ContextMetrics::new()),
        }))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &ContextMeshConfig {
        &self.config
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.store.read().vector_clock().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Receive every context update this node applies
    pub fn subscribe(&self) -> broadcast::Receiver<ContextUpdate> {
        self.notifier.subscribe()
    }

    // ========================================================================
    // Caller API
    // ========================================================================

    /// Merge a partial context from a local caller and return the resolved value.
    ///
    /// `context` must be an object; anything else is rejected. An empty object
    /// is accepted and changes nothing. `metadata` is only logged.
    pub async fn merge_context(
        &self,
        context_id: &str,
        context: Value,
        metadata: Option<ContextMap>,
    ) -> ContextResult<ContextMap> {
        let map = match context {
            Value::Object(map) => map,
            other => {
                return Err(ContextError::InvalidContext {
                    context_id: context_id.to_string(),
                    found: value_kind(&other),
                })
            }
        };

        if map.is_empty() {
            return Ok(self.get_context(context_id));
        }

        let (resolved, update) = {
            let mut store = self.store.write();
            let resolved = store.merge_local(context_id, &map);
            let update = self.stage_change(&store, context_id, &resolved, &self.node_id);
            (resolved, update)
        };
        self.metrics.record_local_merge();
        debug!(
            context_id = %context_id,
            fields = map.len(),
            metadata = ?metadata,
            "Merged local context update"
        );

        self.notifier.publish_remote(update).await;
        Ok(resolved)
    }

    /// Current resolved value, empty for unknown contexts
    pub fn get_context(&self, context_id: &str) -> ContextMap {
        self.store.read().get(context_id)
    }

    /// Resolved contexts whose fields match every entry in `filter`
    pub fn list_contexts(&self, filter: &ContextMap) -> BTreeMap<String, ContextMap> {
        self.store.read().list(filter)
    }

    /// Observed-remove of `keys` from a context. Keys never seen locally are
    /// left alone.
    pub async fn remove(&self, context_id: &str, keys: &[&str]) -> ContextMap {
        let removed = {
            let mut store = self.store.write();
            store.remove(context_id, keys).map(|resolved| {
                let update = self.stage_change(&store, context_id, &resolved, &self.node_id);
                (resolved, update)
            })
        };
        match removed {
            Some((resolved, update)) => {
                self.metrics.record_removal();
                self.notifier.publish_remote(update).await;
                resolved
            }
            None => self.get_context(context_id),
        }
    }

    /// Send this node's snapshot to one peer. Returns false if the peer could
    /// not be reached; the next gossip round will try again.
    pub async fn sync_with_node(&self, peer: &NodeId) -> bool {
        let frame = match self.sync_frame(false) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode sync request");
                return false;
            }
        };

        match self.transport.send(peer, frame).await {
            Ok(()) => {
                self.metrics.record_sync_sent();
                debug!(peer = %peer, "Sent sync request");
                true
            }
            Err(e) => {
                self.metrics.record_peer_skipped();
                debug!(peer = %peer, error = %e, "Skipping unreachable peer");
                false
            }
        }
    }

    /// Replay persisted contexts through the local merge path.
    ///
    /// Returns the number of records replayed. Replayed contexts are neither
    /// re-persisted nor broadcast. A backend that cannot be read is logged and
    /// counted as a persistence failure; the node then starts empty.
    pub async fn recover(&self) -> ContextResult<usize> {
        let mut records = match self.persistence.load_all().await {
            Ok(records) => records,
            Err(e) => {
                self.metrics.record_persistence_write(false);
                warn!(
                    node = %self.node_id,
                    backend = self.persistence.backend_name(),
                    error = %e,
                    "Failed to load persisted contexts, starting empty"
                );
                return Ok(0);
            }
        };
        records.sort_by_key(|record| record.saved_at);

        let mut store = self.store.write();
        for record in &records {
            store.observe_timestamp(record.saved_at);
            store.merge_local(&record.context_id, &record.context);
        }
        drop(store);

        info!(
            node = %self.node_id,
            recovered = records.len(),
            backend = self.persistence.backend_name(),
            "Recovered persisted contexts"
        );
        Ok(records.len())
    }

    // ========================================================================
    // Gossip
    // ========================================================================

    /// Spawn the gossip loop, the inbound message loop and the persistence
    /// writer. All stop when `shutdown` changes.
    pub fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<()>,
    ) -> ContextResult<Vec<JoinHandle<()>>> {
        let mut writer_queue = self.persist_rx.lock();
        let Some(queue) = writer_queue.take() else {
            return Err(ContextError::AlreadyStarted);
        };
        let inbox = match self.transport.subscribe() {
            Ok(inbox) => inbox,
            Err(e) => {
                *writer_queue = Some(queue);
                return Err(e.into());
            }
        };
        drop(writer_queue);

        let node = self.node_id.to_string();
        let writer = tokio::spawn(
            persistence::run_writer(
                self.persistence.clone(),
                queue,
                self.metrics.clone(),
                shutdown.clone(),
            )
            .instrument(info_span!("persistence_writer", node = %node)),
        );

        let synchronizer = GossipSynchronizer::new(Arc::clone(self));
        let gossip = tokio::spawn(synchronizer.event_loop(shutdown.clone()));

        let inbound = tokio::spawn(
            GossipSynchronizer::inbound_loop(Arc::clone(self), inbox, shutdown)
                .instrument(info_span!("context_inbound", node = %node)),
        );

        info!(node = %self.node_id, "Context manager started");
        Ok(vec![writer, gossip, inbound])
    }

    /// One fan-out: send a sync request to every live peer.
    ///
    /// Sends that fail or do not finish within the gossip interval are skipped
    /// until the next round. Returns how many requests were dispatched.
    pub async fn gossip_round(&self) -> usize {
        let peers = self.transport.live_peers();
        if peers.is_empty() {
            trace!("No live peers to gossip with");
            self.metrics.record_gossip_round(0, 0);
            return 0;
        }

        let frame = match self.sync_frame(false) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode sync request");
                return 0;
            }
        };

        let timeout = self.config.gossip_interval();
        let sends = peers.iter().map(|peer| {
            let frame = frame.clone();
            async move {
                let result =
                    tokio::time::timeout(timeout, self.transport.send(peer, frame)).await;
                match result {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "Skipping unreachable peer");
                        false
                    }
                    Err(_) => {
                        debug!(peer = %peer, "Sync request timed out");
                        false
                    }
                }
            }
        });
        let results = join_all(sends).await;

        let sent = results.iter().filter(|ok| **ok).count();
        self.metrics.record_gossip_round(sent, results.len() - sent);
        debug!(sent, peers = results.len(), "Gossip round dispatched");
        sent
    }

    /// Handle one inbound frame. Undecodable frames are dropped.
    pub async fn handle_frame(&self, frame: Frame) {
        if frame.topic != CONTEXT_TOPIC {
            trace!(topic = %frame.topic, "Ignoring frame on foreign topic");
            return;
        }

        let message = match MeshMessage::from_bytes(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_malformed_message();
                debug!(error = %e, "Dropping malformed mesh message");
                return;
            }
        };

        trace!(kind = message.kind(), "Received mesh message");
        match message {
            MeshMessage::SyncRequest(payload) => {
                if payload.from_node == self.node_id {
                    return;
                }
                let peer = payload.from_node.clone();
                self.apply_remote(payload).await;
                self.reply(&peer).await;
            }
            MeshMessage::SyncResponse(payload) => {
                if payload.from_node == self.node_id {
                    return;
                }
                self.apply_remote(payload).await;
            }
            MeshMessage::ContextUpdate(update) => {
                trace!(
                    context_id = %update.context_id,
                    origin = %update.origin_node,
                    "Ignoring peer context notification"
                );
            }
        }
    }

    /// Tombstone compaction and idle-context eviction
    pub fn run_maintenance(&self) {
        if self.config.compaction_enabled {
            let peers = self.transport.live_peers();
            let dropped = self.store.write().compact(&peers);
            if dropped > 0 {
                self.metrics.record_compaction(dropped);
                debug!(dropped, "Compacted stable tombstones");
            }
        }

        if let Some(ttl) = self.config.context_ttl() {
            let expired = self.store.write().expire_idle(ttl, Instant::now());
            if !expired.is_empty() {
                self.metrics.record_expired(expired.len());
                info!(expired = ?expired, "Evicted idle contexts");
            }
        }
    }

    async fn apply_remote(&self, payload: SyncPayload) {
        let updates: Vec<ContextUpdate> = {
            let mut store = self.store.write();
            let changed =
                store.merge_remote(&payload.from_node, &payload.vector_clock, &payload.contexts);
            changed
                .iter()
                .map(|(context_id, resolved)| {
                    self.stage_change(&store, context_id, resolved, &payload.from_node)
                })
                .collect()
        };
        self.metrics.record_remote_merges(updates.len());
        debug!(
            from = %payload.from_node,
            contexts = payload.contexts.len(),
            changed = updates.len(),
            "Merged remote snapshot"
        );

        for update in updates {
            self.notifier.publish_remote(update).await;
        }
    }

    async fn reply(&self, peer: &NodeId) {
        let frame = match self.sync_frame(true) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode sync response");
                return;
            }
        };
        if let Err(e) = self.transport.send(peer, frame).await {
            debug!(peer = %peer, error = %e, "Could not reply to sync request");
        }
    }

    fn sync_frame(&self, response: bool) -> ContextResult<Frame> {
        let payload = {
            let store = self.store.read();
            SyncPayload {
                from_node: self.node_id.clone(),
                vector_clock: store.vector_clock().clone(),
                contexts: store.snapshot(),
            }
        };
        let message = if response {
            MeshMessage::SyncResponse(payload)
        } else {
            MeshMessage::SyncRequest(payload)
        };
        Ok(message.to_frame()?)
    }

    /// Queue persistence and notify local subscribers for one change.
    ///
    /// Called with the store lock held so records and local notifications
    /// leave in merge order. Returns the update still to be published on the
    /// transport.
    fn stage_change(
        &self,
        store: &ContextStore,
        context_id: &str,
        resolved: &ContextMap,
        origin: &NodeId,
    ) -> ContextUpdate {
        let saved_at = store.next_timestamp();
        let record = PersistedContext {
            context_id: context_id.to_string(),
            context: resolved.clone(),
            saved_at,
        };
        if self.persist_tx.send(record).is_err() {
            self.metrics.record_persistence_write(false);
            warn!(context_id = %context_id, "Persistence writer is gone, dropping save");
        }

        let update = ContextUpdate {
            context_id: context_id.to_string(),
            context: resolved.clone(),
            origin_node: origin.clone(),
        };
        self.notifier.send_local(&update);
        self.metrics.record_notification();
        update
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
