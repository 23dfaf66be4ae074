//! Broadcast notifier: fire-and-forget "context changed" events.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::{
    message::{ContextUpdate, MeshMessage},
    transport::Transport,
};

/// Publishes context updates to in-process subscribers and on the transport topic
pub struct BroadcastNotifier {
    local: broadcast::Sender<ContextUpdate>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for BroadcastNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastNotifier")
            .field("subscribers", &self.local.receiver_count())
            .finish()
    }
}

impl BroadcastNotifier {
    pub fn new(capacity: usize, transport: Arc<dyn Transport>) -> Self {
        let (local, _) = broadcast::channel(capacity);
        Self { local, transport }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextUpdate> {
        self.local.subscribe()
    }

    /// Deliver an update to in-process subscribers. Never blocks or fails;
    /// having no subscribers is normal.
    pub fn send_local(&self, update: &ContextUpdate) {
        if self.local.send(update.clone()).is_err() {
            trace!(context_id = %update.context_id, "No local subscribers for context update");
        }
    }

    /// Publish an update on the transport topic. Failures are logged only.
    pub async fn publish_remote(&self, update: ContextUpdate) {
        let frame = match MeshMessage::ContextUpdate(update).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode context update");
                return;
            }
        };
        if let Err(e) = self.transport.publish(frame).await {
            warn!(error = %e, "Failed to publish context update");
        }
    }
}
