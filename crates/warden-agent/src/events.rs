use tokio::sync::broadcast;

use warden_core::PoolEvent;

/// Fire-and-forget fan-out of lifecycle events.
///
/// Broadcast isolates subscribers from the emitter and from each other: a
/// slow, lagging or dropped receiver never affects delivery to the rest,
/// and emission never enters subscriber code.
#[derive(Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PoolEvent) {
        tracing::debug!(?event, "pool event");
        // Err means no subscribers; that is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
