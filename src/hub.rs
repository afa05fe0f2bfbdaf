//! Broadcast hub.
//!
//! Fans live state out to observers (the WebSocket edge being the canonical
//! one). Each event is serialised once; every subscriber owns a bounded
//! queue with a most-recent-wins drop policy, so one slow observer never
//! stalls the rest and is never disconnected for lagging.

use crate::model::{Alert, CommandRow};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubEventType {
    DeviceStatus,
    CommandUpdate,
    Alert,
}

/// Envelope pushed to subscribers: `{type, seq, ts, payload}`.
#[derive(Debug, Serialize)]
pub struct HubEvent<'a, P: Serialize> {
    #[serde(rename = "type")]
    pub event_type: HubEventType,
    pub seq: u64,
    pub ts: u64,
    pub payload: &'a P,
}

struct SubscriberQueue {
    label: String,
    queue: Mutex<VecDeque<Arc<str>>>,
    notify: Notify,
    dropped: AtomicU64,
    depth: usize,
}

struct HubInner {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    seq: AtomicU64,
    depth: usize,
}

#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                depth: queue_depth,
            }),
        }
    }

    pub fn subscribe(&self, label: &str) -> HubSubscription {
        let sub = Arc::new(SubscriberQueue {
            label: label.to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            depth: self.inner.depth,
        });
        self.inner
            .subscribers
            .lock()
            .expect("hub subscriber list poisoned")
            .push(Arc::clone(&sub));
        debug!(target: "stf_twin::hub", label, "observer subscribed");
        HubSubscription { queue: sub }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("hub subscriber list poisoned")
            .iter()
            .filter(|s| Arc::strong_count(s) > 1)
            .count()
    }

    pub fn publish_device_status<P: Serialize>(&self, ts: u64, payload: &P) {
        self.publish(HubEventType::DeviceStatus, ts, payload);
    }

    pub fn publish_command_update(&self, ts: u64, row: &CommandRow) {
        self.publish(HubEventType::CommandUpdate, ts, row);
    }

    pub fn publish_alert(&self, ts: u64, alert: &Alert) {
        self.publish(HubEventType::Alert, ts, alert);
    }

    fn publish<P: Serialize>(&self, event_type: HubEventType, ts: u64, payload: &P) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = HubEvent { event_type, seq, ts, payload };
        let serialized: Arc<str> = match serde_json::to_string(&event) {
            Ok(s) => Arc::from(s.as_str()),
            Err(e) => {
                debug!(target: "stf_twin::hub", error = %e, "unserialisable hub event dropped");
                return;
            }
        };

        let mut subs = self.inner.subscribers.lock().expect("hub subscriber list poisoned");
        // Prune queues whose subscription handle is gone.
        subs.retain(|s| Arc::strong_count(s) > 1);
        for sub in subs.iter() {
            let mut queue = sub.queue.lock().expect("hub queue poisoned");
            if queue.len() >= sub.depth {
                queue.pop_front();
                let n = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    target: "stf_twin::hub",
                    label = %sub.label,
                    dropped = n,
                    "subscriber queue full, dropped oldest event"
                );
            }
            queue.push_back(Arc::clone(&serialized));
            drop(queue);
            sub.notify.notify_one();
        }
    }
}

pub struct HubSubscription {
    queue: Arc<SubscriberQueue>,
}

impl HubSubscription {
    /// Next event, in publish order for this subscriber. Waits if the queue
    /// is empty.
    pub async fn recv(&self) -> Arc<str> {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Arc<str>> {
        self.queue.queue.lock().expect("hub queue poisoned").pop_front()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}
