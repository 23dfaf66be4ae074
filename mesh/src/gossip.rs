//! Gossip synchronizer
//!
//! Periodic fan-out of this node's snapshot to every live peer, plus the loop
//! that feeds inbound frames back into the manager.

use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing as log;
use tracing::instrument;

use crate::{manager::ContextManager, transport::Frame};

pub struct GossipSynchronizer {
    manager: Arc<ContextManager>,
}

impl GossipSynchronizer {
    pub fn new(manager: Arc<ContextManager>) -> Self {
        Self { manager }
    }

    /// Run gossip rounds every interval until `signal` changes.
    ///
    /// Maintenance (tombstone compaction, idle eviction) runs after each round.
    /// A round that overruns its interval delays the next one instead of
    /// stacking up.
    #[instrument(fields(node = %self.manager.node_id()), skip(self, signal))]
    pub async fn event_loop(self, mut signal: watch::Receiver<()>) {
        let period = self.manager.config().gossip_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        let mut round: u64 = 0;
        loop {
            tokio::select! {
                _ = signal.changed() => {
                    log::info!("Gossip loop shutting down after {} rounds", round);
                    break;
                }
                _ = interval.tick() => {
                    round += 1;
                    let sent = self.manager.gossip_round().await;
                    log::trace!(round, sent, "Gossip round complete");
                    self.manager.run_maintenance();
                }
            }
        }
    }

    /// Hand every inbound frame to the manager until `signal` changes or the
    /// transport closes the stream.
    pub async fn inbound_loop(
        manager: Arc<ContextManager>,
        mut inbox: mpsc::UnboundedReceiver<Frame>,
        mut signal: watch::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = signal.changed() => {
                    log::info!("Inbound loop shutting down");
                    break;
                }
                frame = inbox.recv() => match frame {
                    Some(frame) => manager.handle_frame(frame).await,
                    None => {
                        log::warn!("Transport inbox closed, stopping inbound loop");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        clock::NodeId, config::ContextMeshConfig, persistence::NoOpContextPersistence,
        transport::{LocalBus, LocalTransport, Transport},
    };

    fn config(interval_ms: u64) -> ContextMeshConfig {
        ContextMeshConfig {
            gossip_interval_ms: interval_ms,
            ..Default::default()
        }
    }

    fn manager(transport: LocalTransport, interval_ms: u64) -> Arc<ContextManager> {
        ContextManager::new(
            config(interval_ms),
            Arc::new(transport),
            Arc::new(NoOpContextPersistence::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_event_loop_stops_on_signal() {
        let bus = LocalBus::new();
        let n1 = manager(bus.join(NodeId::from("n1")), 10);
        let (tx, rx) = watch::channel(());

        let handle = tokio::spawn(GossipSynchronizer::new(n1.clone()).event_loop(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("gossip loop did not stop")
            .expect("gossip loop panicked");
        assert!(n1.metrics().gossip_rounds >= 1);
    }

    #[tokio::test]
    async fn test_inbound_loop_applies_sync_request() {
        let bus = LocalBus::new();
        let n1 = manager(bus.join(NodeId::from("n1")), 1000);
        let n2_transport = bus.join(NodeId::from("n2"));
        let n2_inbox = n2_transport.subscribe().unwrap();
        let n2 = manager(n2_transport, 1000);

        let (tx, rx) = watch::channel(());
        let handle = tokio::spawn(GossipSynchronizer::inbound_loop(n2.clone(), n2_inbox, rx));

        n1.merge_context("ctx", json!({"a": 1}), None).await.unwrap();
        assert!(n1.sync_with_node(&NodeId::from("n2")).await);

        for _ in 0..50 {
            if !n2.get_context("ctx").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(n2.get_context("ctx"), n1.get_context("ctx"));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("inbound loop did not stop")
            .expect("inbound loop panicked");
    }
}
