use std::sync::{Arc, Mutex};

/// Fan-out of typed events over flume channels.
///
/// Every [`subscribe`](EventBus::subscribe) gets its own unbounded receiver
/// that sees all events published afterwards. Receivers that were dropped
/// are pruned on the next publish. Clones share the same subscriber list.
pub struct EventBus<T> {
    senders: Arc<Mutex<Vec<flume::Sender<T>>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().expect("event bus lock poisoned").push(tx);
        rx
    }

    pub fn publish(&self, event: T) {
        let mut senders = self.senders.lock().expect("event bus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().expect("event bus lock poisoned").len()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.senders.lock().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("EventBus")
            .field("subscribers", &subscribers)
            .finish()
    }
}
