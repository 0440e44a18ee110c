//! # taskbus
//!
//! Background task dispatch core: producers submit typed task envelopes, a
//! routing table maps each task type to a named queue, and worker pools lease
//! tasks from the broker in weighted priority order.
//!
//! ## Core (always compiled)
//!
//! - Task envelopes with attempt history and per-task attempt ceilings
//! - Leased delivery with visibility timeouts, owner checks and revocation
//! - Routing by task type with priority overrides
//! - Smooth weighted scheduling across `high`, `default` and `low` classes
//! - Retry with immediate, fixed or exponential backoff
//! - Dead letters with inspect, requeue and discard
//! - Health verdicts from queue depth, pending age, failure rate and heartbeats
//! - Persistent storage (pluggable `Storage` trait, `LocalStorage` included)
//! - Event system for task lifecycle notifications
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `server` | ✅ | `axum` | HTTP health endpoint, admin routes and broker surface |
//! | `remote` | ✅ | `reqwest` | `HttpBroker` and `AdminClient` for a bus in another process |
//! | `cli` | ✅ | `clap` | `taskbus` binary (serve and admin commands) |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskbus::{BusConfig, HandlerRegistry, QueueConfig, RouteRule, PriorityClass, TaskBus, TaskContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BusConfig::empty()
//!         .with_queue("mail", QueueConfig::new(PriorityClass::Default))
//!         .with_route(RouteRule::new("email.send", "mail"));
//!     let bus = TaskBus::connect(config).await?;
//!     bus.start().await;
//!
//!     let mut registry = HandlerRegistry::new();
//!     registry.register_fn("email.send", |ctx: TaskContext| async move {
//!         Ok(json!({"sent_to": ctx.payload()["to"]}))
//!     })?;
//!     let pool = bus.worker_pool(registry).build()?;
//!     pool.start().await;
//!
//!     let id = bus.submit("email.send", json!({"to": "a@example.com"}), Default::default()).await?;
//!     let result = bus.producer().wait_for(&id, std::time::Duration::from_secs(5)).await?;
//!     println!("{:?}", result.value);
//!
//!     pool.drain(std::time::Duration::from_secs(10)).await?;
//!     bus.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core modules (always compiled)
pub mod broker;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod event;
pub mod monitor;
pub mod producer;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod wire;
pub mod worker;

// Feature-gated modules
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "remote")]
pub mod remote;

// Core re-exports
pub use broker::{
    Broker, BrokerOptions, InMemoryBroker, Lease, LeaseDisposition, LeaseReaper, QueueSample,
    ReleaseReason, TaskResult, WorkerHeartbeat,
};
pub use bus::{TaskBus, TaskBusBuilder};
pub use config::{
    BusConfig, PriorityQueues, PriorityWeights, QueueConfig, RouteRule, RoutingConfig,
    WorkerConfig,
};
pub use dlq::{DeadLetter, DeadLetterHandler, DeadLetterQueue};
pub use envelope::{
    AttemptOutcome, AttemptRecord, PriorityClass, TaskEnvelope, TaskId, TaskStatus, WorkerId,
};
pub use error::{BusError, Result, TaskError};
pub use event::{events, BusEvent, EventEmitter, EventStream};
pub use monitor::{HealthMonitor, HealthSnapshot, MonitorConfig, QueueHealth, Verdict};
pub use producer::{Periodic, PeriodicHandle, Producer, SubmitOptions};
pub use retry::{RetryDecision, RetryPolicy};
pub use router::{Route, Router};
pub use scheduler::PriorityScheduler;
pub use storage::{LocalStorage, Storage};
pub use telemetry::{init_tracing, LogFormat};
pub use worker::{
    handler_fn, HandlerRegistry, TaskContext, TaskHandler, WorkerPool, WorkerPoolBuilder,
};

// Feature-gated re-exports
#[cfg(feature = "remote")]
pub use remote::{AdminClient, HttpBroker};

use serde::{Deserialize, Serialize};

/// Bus statistics snapshot
///
/// Point-in-time totals across all declared queues.
///
/// # Fields
///
/// * `total_pending` - Tasks waiting in queues, delayed ones included
/// * `total_leased` - Tasks currently held by workers
/// * `dead_letter_count` - Tasks parked in the dead-letter store
/// * `queues` - Per-queue samples with windowed outcome counters
///
/// # Example
///
/// ```rust,ignore
/// let stats = bus.stats().await?;
/// println!("{} pending, {} leased", stats.total_pending, stats.total_leased);
///
/// for queue in &stats.queues {
///     println!("{}: depth {} ({} failed in window)", queue.queue, queue.depth, queue.failed);
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub total_pending: usize,
    pub total_leased: usize,
    pub dead_letter_count: usize,
    pub queues: Vec<QueueSample>,
}

impl BusStats {
    /// Sample for one queue
    pub fn queue(&self, name: &str) -> Option<&QueueSample> {
        self.queues.iter().find(|q| q.queue == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_bus_stats_from_bus() {
        let config = BusConfig::empty()
            .with_queue("mail", QueueConfig::new(PriorityClass::Default))
            .with_queue("reports", QueueConfig::new(PriorityClass::Low))
            .with_route(RouteRule::new("email.send", "mail"));
        let bus = TaskBus::connect(config).await.unwrap();
        bus.submit("email.send", json!({}), SubmitOptions::default())
            .await
            .unwrap();

        let stats = bus.stats().await.unwrap();
        assert_eq!(stats.total_pending, 1);
        assert_eq!(stats.total_leased, 0);
        assert_eq!(stats.queues.len(), 2);
        assert_eq!(stats.queue("mail").unwrap().depth, 1);
        assert_eq!(stats.queue("reports").unwrap().depth, 0);
        assert!(stats.queue("missing").is_none());
    }

    #[test]
    fn test_bus_stats_default() {
        let stats = BusStats::default();
        assert_eq!(stats.total_pending, 0);
        assert_eq!(stats.total_leased, 0);
        assert!(stats.queues.is_empty());
    }

    #[test]
    fn test_bus_stats_serialization() {
        let stats = BusStats {
            total_pending: 5,
            total_leased: 2,
            dead_letter_count: 1,
            queues: Vec::new(),
        };

        let json = serde_json::to_string(&stats).unwrap();
        let parsed: BusStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total_pending, 5);
        assert_eq!(parsed.total_leased, 2);
        assert_eq!(parsed.dead_letter_count, 1);
    }
}
