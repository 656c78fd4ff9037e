//! Per-flow attempt counting.
//!
//! Every eligible packet increments its flow's attempt count. Counts below the
//! threshold are silent, the attempt that reaches the threshold produces one
//! full event, and every later attempt produces a degraded event that keeps
//! the flow id and count but drops the addressing fields.

use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::hashing::FlowKey;

pub const DEFAULT_THRESHOLD: u64 = 5;
pub const DEFAULT_MAX_TRACKED_FLOWS: usize = 65_536;

/// Record streamed to the collector for a flow at or past the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    #[serde(rename = "ID")]
    pub id: String,
    pub src: String,
    pub dst: String,
    pub port: String,
    pub count: u64,
}

impl Event {
    fn promoted(key: FlowKey, source: IpAddr, destination: IpAddr, port: &str, count: u64) -> Self {
        Event {
            id: key.to_string(),
            src: source.to_string(),
            dst: destination.to_string(),
            port: port.to_string(),
            count,
        }
    }

    fn degraded(key: FlowKey, count: u64) -> Self {
        Event {
            id: key.to_string(),
            src: String::new(),
            dst: String::new(),
            port: String::new(),
            count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDecision {
    None,
    Promote(Event),
    Degrade(Event),
}

impl EventDecision {
    pub fn into_event(self) -> Option<Event> {
        match self {
            EventDecision::None => None,
            EventDecision::Promote(event) | EventDecision::Degrade(event) => Some(event),
        }
    }
}

/// Process-wide flow table shared by every capture loop.
///
/// Lookup, classification and increment happen under one lock, so concurrent
/// observers of the same flow never lose an update and the promotion is
/// emitted exactly once. The table holds at most `max_tracked_flows` entries;
/// the least recently seen flow is evicted first and restarts from one if it
/// shows up again.
pub struct FlowCounter {
    threshold: u64,
    flows: Mutex<LruCache<FlowKey, u64>>,
}

impl FlowCounter {
    pub fn new(threshold: u64, max_tracked_flows: usize) -> Self {
        let capacity = NonZeroUsize::new(max_tracked_flows).unwrap_or(NonZeroUsize::MIN);
        FlowCounter {
            threshold: threshold.max(1),
            flows: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn observe(&self, key: FlowKey, source: IpAddr, destination: IpAddr, port: &str) -> EventDecision {
        let count = {
            let mut flows = self.flows.lock();
            match flows.get_mut(&key) {
                Some(count) => {
                    *count += 1;
                    *count
                }
                None => {
                    flows.put(key, 1);
                    1
                }
            }
        };

        if count < self.threshold {
            EventDecision::None
        } else if count == self.threshold {
            EventDecision::Promote(Event::promoted(key, source, destination, port, count))
        } else {
            EventDecision::Degrade(Event::degraded(key, count))
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn tracked_flows(&self) -> usize {
        self.flows.lock().len()
    }
}
