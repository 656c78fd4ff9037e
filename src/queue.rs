//! Bounded hand-off queues between producers and the uplink dispatcher.
//!
//! Producers never block: when a queue is full the new payload is dropped and
//! counted (drop-new). Capture threads call `offer` from outside the runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const DROP_WARN_EVERY: u64 = 1000;

/// Repeated drop warnings are logged for the first occurrence and every
/// thousandth after that.
pub(crate) fn warn_due(count: u64) -> bool {
    count == 1 || count % DROP_WARN_EVERY == 0
}

#[derive(Clone)]
pub struct OutboundQueue {
    name: &'static str,
    sender: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

pub fn bounded(name: &'static str, capacity: usize) -> (OutboundQueue, mpsc::Receiver<String>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let queue = OutboundQueue {
        name,
        sender,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (queue, receiver)
}

impl OutboundQueue {
    /// Returns false when the payload was not queued.
    pub fn offer(&self, payload: String) -> bool {
        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if warn_due(dropped) {
                    warn!("{} queue full, {} payloads dropped so far", self.name, dropped);
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{} queue closed, payload discarded", self.name);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_due_first_and_every_thousandth() {
        let due: Vec<u64> = (1..=3000).filter(|n| warn_due(*n)).collect();
        assert_eq!(due, vec![1, 1000, 2000, 3000]);
    }

    #[test]
    fn test_full_queue_drops_new_payloads() {
        let (queue, mut receiver) = bounded("events", 2);

        assert!(queue.offer("first".to_string()));
        assert!(queue.offer("second".to_string()));
        assert!(!queue.offer("third".to_string()));
        assert_eq!(queue.dropped(), 1);

        assert_eq!(receiver.try_recv().unwrap(), "first");
        assert_eq!(receiver.try_recv().unwrap(), "second");
        assert!(receiver.try_recv().is_err());

        assert!(queue.offer("fourth".to_string()));
        assert_eq!(receiver.try_recv().unwrap(), "fourth");
    }

    #[test]
    fn test_clones_share_drop_counter() {
        let (queue, _receiver) = bounded("heartbeat", 1);
        let other = queue.clone();

        assert!(queue.offer("a".to_string()));
        assert!(!other.offer("b".to_string()));
        assert!(!queue.offer("c".to_string()));
        assert_eq!(queue.dropped(), 2);
        assert_eq!(other.name(), "heartbeat");
    }

    #[test]
    fn test_closed_queue_is_not_counted_as_overflow() {
        let (queue, receiver) = bounded("events", 4);
        drop(receiver);

        assert!(!queue.offer("late".to_string()));
        assert_eq!(queue.dropped(), 0);
    }
}
