use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tempo_core::{Message, SyncError};
use tracing::{debug, warn};

pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Subscriber callback. Identity is the `Arc` allocation, so registering a
/// clone of the same `Arc` twice on a topic is a no-op.
pub type Callback = Arc<dyn Fn(&Message) -> CallbackResult + Send + Sync>;

/// Returned by `subscribe`; the only way to unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Outcome of delivering one message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct Entry {
    id: u64,
    callback: Callback,
}

/// Topic-indexed subscription table.
pub struct EventDispatcher {
    topics: DashMap<String, Vec<Entry>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, topic: &str, callback: Callback) -> SubscriptionHandle {
        let mut entries = self.topics.entry(topic.to_string()).or_default();
        if let Some(existing) = entries.iter().find(|e| Arc::ptr_eq(&e.callback, &callback)) {
            debug!(topic, id = existing.id, "callback already subscribed");
            return SubscriptionHandle {
                topic: topic.to_string(),
                id: existing.id,
            };
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(Entry { id, callback });
        SubscriptionHandle {
            topic: topic.to_string(),
            id,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match self.topics.get_mut(&handle.topic) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|e| e.id != handle.id);
                entries.len() != before
            }
            None => false,
        };
        self.topics.remove_if(&handle.topic, |_, entries| entries.is_empty());
        removed
    }

    /// Deliver to every subscriber of `message.topic`, in registration order.
    ///
    /// A callback that errors or panics is logged and counted; the rest still
    /// receive the message.
    pub fn dispatch(&self, message: &Message) -> DispatchReport {
        // Snapshot so callbacks may (un)subscribe without deadlocking the shard.
        let entries: Vec<Entry> = match self.topics.get(&message.topic) {
            Some(entries) => entries.clone(),
            None => {
                debug!(topic = %message.topic, "no subscribers");
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        for entry in entries {
            match catch_unwind(AssertUnwindSafe(|| (entry.callback)(message))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        topic = %message.topic,
                        subscription = entry.id,
                        error = %e,
                        "subscriber failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(topic = %message.topic, subscription = entry.id, "subscriber panicked");
                }
            }
        }
        if report.failed > 0 {
            self.failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }

    /// Decode a raw text frame and dispatch it. Malformed frames are dropped.
    pub fn dispatch_frame(&self, frame: &str) -> Result<DispatchReport, SyncError> {
        match Message::decode(frame) {
            Ok(message) => Ok(self.dispatch(&message)),
            Err(err) => {
                warn!(error = %err, frame_len = frame.len(), "dropping malformed frame");
                Err(err)
            }
        }
    }

    pub fn clear(&self) {
        self.topics.clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|e| e.len()).unwrap_or(0)
    }

    /// Total callback failures since creation.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
