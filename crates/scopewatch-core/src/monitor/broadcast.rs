//! Fan-out of delivered batches to any number of listeners

use crate::types::{CoalescedBatch, MonitorId};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of notifications a slow listener may lag behind
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// A batch delivered by one monitor
#[derive(Debug, Clone)]
pub struct MonitorNotification {
    pub monitor: MonitorId,
    pub events: Arc<CoalescedBatch>,
}

/// Pass-through broadcast sink for monitor batches
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<MonitorNotification>,
}

static SHARED: Lazy<EventBroadcaster> =
    Lazy::new(|| EventBroadcaster::new(DEFAULT_BROADCAST_CAPACITY));

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// The process-wide broadcaster monitors publish to by default
    pub fn shared() -> Self {
        SHARED.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorNotification> {
        self.tx.subscribe()
    }

    /// Publish a notification; having no listeners is not an error
    pub fn publish(&self, notification: MonitorNotification) -> usize {
        match self.tx.send(notification) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No broadcast listeners");
                0
            }
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventFlags, RawEvent};

    fn notification(path: &str) -> MonitorNotification {
        MonitorNotification {
            monitor: MonitorId::new(),
            events: Arc::new(CoalescedBatch::from(vec![RawEvent::new(
                path,
                EventFlags::ITEM_CREATED,
                1,
            )])),
        }
    }

    #[test]
    fn test_publish_without_listeners() {
        let broadcaster = EventBroadcaster::new(4);
        assert_eq!(broadcaster.publish(notification("/a")), 0);
    }

    #[tokio::test]
    async fn test_every_listener_receives_batch() {
        let broadcaster = EventBroadcaster::new(4);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        let sent = notification("/a");
        assert_eq!(broadcaster.publish(sent.clone()), 2);

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.monitor, sent.monitor);
        assert_eq!(b.events.paths(), sent.events.paths());
    }
}
