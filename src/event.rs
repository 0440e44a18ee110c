//! Lifecycle events broadcast by the bus
//!
//! Every event carries a key from [`events`] and a flat map of fields
//! (`task_id`, `queue`, `attempt`, ...). Emitting never blocks: subscribers
//! that fall behind the channel capacity miss events.

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// One lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// One of the keys in [`events`]
    pub key: String,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BusEvent {
    pub fn new(key: impl Into<String>, fields: HashMap<String, serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            fields,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event from `(field, value)` pairs
    pub fn with_fields<const N: usize>(
        key: impl Into<String>,
        fields: [(&str, serde_json::Value); N],
    ) -> Self {
        Self::new(
            key,
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}

/// Broadcast sender shared by every component of a bus
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BusEvent>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped silently when nobody listens
    pub fn emit(&self, event: BusEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events matching `filter` as an [`EventStream`]
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&BusEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<BusEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }
}

/// Filtered event subscription implementing `Stream<Item = BusEvent>`
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = BusEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<BusEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Keys of the events the bus emits
pub mod events {
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_LEASED: &str = "task.leased";
    pub const TASK_SUCCEEDED: &str = "task.succeeded";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRY: &str = "task.retry";
    pub const TASK_DEAD_LETTERED: &str = "task.dead_lettered";
    pub const TASK_REVOKED: &str = "task.revoked";
    pub const TASK_REQUEUED: &str = "task.requeued";

    pub const LEASE_EXPIRED: &str = "lease.expired";
    pub const QUEUE_PURGED: &str = "queue.purged";

    pub const WORKER_STARTED: &str = "worker.started";
    pub const WORKER_STOPPED: &str = "worker.stopped";
    pub const WORKER_SLOT_OVERRUN: &str = "worker.slot_overrun";

    pub const HEALTH_VERDICT_CHANGED: &str = "health.verdict_changed";
}
