//! Lifecycle event fan-out for the audit/quota collaborator.

use log::{debug, info};
use tokio::sync::broadcast;

use labvisor_protocol::LifecycleEvent;

/// Size of the broadcast channel for lifecycle events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Broadcasts [`LifecycleEvent`]s to every subscriber.
///
/// Slow subscribers lose the oldest events rather than stalling the
/// registry; the collaborator can always re-read session status.
pub struct EventHub {
    event_tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { event_tx }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Started { session_id, backend, .. } => {
                info!("Session {} started on {}", session_id, backend)
            }
            LifecycleEvent::Stopped {
                session_id,
                reason,
                usage_minutes,
                ..
            } => info!(
                "Session {} stopped ({}, {} min)",
                session_id, reason, usage_minutes
            ),
            LifecycleEvent::Expired { session_id, .. } => info!("Session {} expired", session_id),
            LifecycleEvent::Error {
                session_id,
                message,
                ..
            } => info!("Session {} errored: {}", session_id, message),
        }
        // No receivers is fine.
        if self.event_tx.send(event).is_err() {
            debug!("No lifecycle event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}
