use crate::events::Event;
use tokio::sync::broadcast;
use tracing::debug;

/// Fan-out of pipeline and execution events to observers (journal, API).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) -> Result<usize, broadcast::error::SendError<Event>> {
        self.tx.send(event)
    }

    /// Publish without caring whether anyone listens. Observers are optional,
    /// so having none is not an error for producers.
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("[BUS] Event dropped: no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
