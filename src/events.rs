//! Observer plumbing shared by the client and the audio pipelines

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Fan-out of typed events to any number of subscribers.
///
/// Every subscriber gets its own unbounded channel, so a slow consumer never
/// makes the producer wait and never loses events. Subscribers that dropped
/// their receiver are pruned on the next [`EventBus::emit`].
pub struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<UnboundedSender<E>>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener.
    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn emit(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop all listeners. Their receivers observe end-of-stream.
    pub fn clear(&self) {
        let mut subscribers = self.subscribers.lock();
        debug!("Removing {} event listeners", subscribers.len());
        subscribers.clear();
    }
}
