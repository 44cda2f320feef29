use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per channel before slow receivers lag.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Observer channel owned by a single component.
///
/// Every current receiver sees every event. Publishing with no receivers is a
/// no-op, and a receiver that falls behind only loses its own backlog.
pub struct EventBus<E> {
    sender: Arc<broadcast::Sender<E>>,
}

impl<E: Clone + std::fmt::Debug> EventBus<E> {
    /// Channel buffering `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Send to every current receiver.
    pub fn publish(&self, event: E) {
        trace!(?event, "Publishing event");
        // send only fails when nobody is listening
        let _ = self.sender.send(event);
    }

    /// New receiver seeing events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + std::fmt::Debug> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}
