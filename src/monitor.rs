//! Health monitor: queue depth, lease age and worker heartbeats
//!
//! The monitor only reads from the broker. Verdicts are telemetry for
//! operators and the `/health` endpoint; nothing here mutates queue state.

use crate::broker::{Broker, QueueSample, WorkerHeartbeat};
use crate::envelope::PriorityClass;
use crate::error::Result;
use crate::event::{events, BusEvent, EventEmitter};
use crate::BusStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Missed heartbeats after which a worker counts as stale
pub const STALE_AFTER_BEATS: u32 = 3;

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Sliding window for failure rates
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Oldest eligible task may wait this long before the queue is degraded
    #[serde(with = "humantime_serde")]
    pub pending_sla: Duration,
    /// Depth above which a queue is degraded
    pub depth_warning: usize,
    /// Depth above which a queue with no active workers is unhealthy
    pub depth_ceiling: usize,
    /// Failure share above which a queue is degraded
    pub failure_rate_threshold: f64,
    /// Finished attempts required before the failure rate counts
    pub min_samples: u64,
    /// Heartbeat age after which a worker is stale; tracks the worker
    /// heartbeat interval unless set explicitly
    #[serde(with = "humantime_serde")]
    pub heartbeat_ttl: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            window: Duration::from_secs(300),
            pending_sla: Duration::from_secs(300),
            depth_warning: 500,
            depth_ceiling: 1_000,
            failure_rate_threshold: 0.25,
            min_samples: 10,
            heartbeat_ttl: Duration::from_secs(10) * STALE_AFTER_BEATS,
        }
    }
}

impl MonitorConfig {
    /// Stale window of [`STALE_AFTER_BEATS`] missed beats at `interval`
    pub fn for_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_ttl = interval * STALE_AFTER_BEATS;
        self
    }
}

/// Health verdict, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Healthy => "healthy",
            Verdict::Degraded => "degraded",
            Verdict::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue health record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub queue: String,
    pub class: PriorityClass,
    pub depth: usize,
    pub eligible: usize,
    pub delayed: usize,
    pub leased: usize,
    pub oldest_pending_age_ms: u64,
    pub failure_rate: f64,
    pub succeeded: u64,
    pub failed: u64,
    /// Live workers consuming this queue
    pub active_workers: usize,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Heartbeat plus staleness as seen by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub stale: bool,
}

/// System-wide health record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    /// Worst queue verdict
    pub verdict: Verdict,
    pub total_pending: usize,
    pub total_leased: usize,
    pub dead_letter_count: usize,
    pub active_workers: usize,
    pub queues: Vec<QueueHealth>,
    pub workers: Vec<WorkerHealth>,
}

impl HealthSnapshot {
    pub fn queue(&self, name: &str) -> Option<&QueueHealth> {
        self.queues.iter().find(|q| q.queue == name)
    }
}

/// Health monitor
pub struct HealthMonitor {
    broker: Arc<dyn Broker>,
    config: MonitorConfig,
    events: Option<EventEmitter>,
    latest: RwLock<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, MonitorConfig::default())
    }

    /// Create a new health monitor with custom configuration
    pub fn with_config(broker: Arc<dyn Broker>, config: MonitorConfig) -> Self {
        Self {
            broker,
            config,
            events: None,
            latest: RwLock::new(None),
        }
    }

    /// Publish verdict changes on `events` (builder pattern)
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take a fresh sample from the broker
    pub async fn sample(&self) -> Result<HealthSnapshot> {
        let samples = self.broker.stats(self.config.window).await?;
        let heartbeats = self.broker.workers().await?;
        let dead_letter_count = self.broker.dead_letter_count().await?;
        Ok(self.assemble(samples, heartbeats, dead_letter_count, Utc::now()))
    }

    /// Most recent snapshot taken by the background loop
    pub async fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().await.clone()
    }

    /// Current statistics
    pub async fn stats(&self) -> Result<BusStats> {
        let queues = self.broker.stats(self.config.window).await?;
        let dead_letter_count = self.broker.dead_letter_count().await?;
        Ok(BusStats {
            total_pending: queues.iter().map(|q| q.depth).sum(),
            total_leased: queues.iter().map(|q| q.leased).sum(),
            dead_letter_count,
            queues,
        })
    }

    /// Start monitoring
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_health().await;
            }
        })
    }

    /// Sample, log and publish verdict changes
    pub async fn check_health(&self) {
        let snapshot = match self.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "taskbus.health: broker unreachable, cannot sample");
                return;
            }
        };

        for queue in &snapshot.queues {
            debug!(
                queue = %queue.queue,
                depth = queue.depth,
                leased = queue.leased,
                oldest_pending_ms = queue.oldest_pending_age_ms,
                failure_rate = queue.failure_rate,
                verdict = %queue.verdict,
                "taskbus.health: queue sampled"
            );
            if queue.verdict != Verdict::Healthy {
                warn!(
                    queue = %queue.queue,
                    verdict = %queue.verdict,
                    reasons = %queue.reasons.join("; "),
                    "taskbus.health: queue not healthy"
                );
            }
        }

        let previous = self.latest.read().await.as_ref().map(|s| s.verdict);
        if previous != Some(snapshot.verdict) {
            info!(
                from = previous.map(|v| v.as_str()).unwrap_or("unknown"),
                to = %snapshot.verdict,
                "taskbus.health: verdict changed"
            );
            if let Some(events) = &self.events {
                events.emit(BusEvent::with_fields(
                    events::HEALTH_VERDICT_CHANGED,
                    [
                        (
                            "from",
                            serde_json::json!(previous.map(|v| v.as_str())),
                        ),
                        ("to", serde_json::json!(snapshot.verdict.as_str())),
                    ],
                ));
            }
        }

        *self.latest.write().await = Some(snapshot);
    }

    fn assemble(
        &self,
        samples: Vec<QueueSample>,
        heartbeats: Vec<WorkerHeartbeat>,
        dead_letter_count: usize,
        now: DateTime<Utc>,
    ) -> HealthSnapshot {
        let ttl = self.config.heartbeat_ttl;

        let queues: Vec<QueueHealth> = samples
            .into_iter()
            .map(|sample| {
                let active_workers = heartbeats
                    .iter()
                    .filter(|hb| hb.serves(&sample.queue, now, ttl))
                    .count();
                let (verdict, reasons) = evaluate(&sample, active_workers, &self.config);
                QueueHealth {
                    failure_rate: sample.failure_rate(),
                    queue: sample.queue,
                    class: sample.class,
                    depth: sample.depth,
                    eligible: sample.eligible,
                    delayed: sample.delayed,
                    leased: sample.leased,
                    oldest_pending_age_ms: sample.oldest_pending_age_ms,
                    succeeded: sample.succeeded,
                    failed: sample.failed,
                    active_workers,
                    verdict,
                    reasons,
                }
            })
            .collect();

        let workers: Vec<WorkerHealth> = heartbeats
            .into_iter()
            .map(|heartbeat| WorkerHealth {
                stale: heartbeat.is_stale(now, ttl),
                heartbeat,
            })
            .collect();

        HealthSnapshot {
            generated_at: now,
            verdict: queues
                .iter()
                .map(|q| q.verdict)
                .max()
                .unwrap_or(Verdict::Healthy),
            total_pending: queues.iter().map(|q| q.depth).sum(),
            total_leased: queues.iter().map(|q| q.leased).sum(),
            dead_letter_count,
            active_workers: workers
                .iter()
                .filter(|w| !w.stale && !w.heartbeat.stopping)
                .count(),
            queues,
            workers,
        }
    }
}

/// Verdict for one queue sample, with the reasons behind it
pub fn evaluate(
    sample: &QueueSample,
    active_workers: usize,
    config: &MonitorConfig,
) -> (Verdict, Vec<String>) {
    let mut verdict = Verdict::Healthy;
    let mut reasons = Vec::new();

    if sample.depth > config.depth_ceiling && active_workers == 0 {
        verdict = Verdict::Unhealthy;
        reasons.push(format!(
            "depth {} exceeds ceiling {} with no active workers",
            sample.depth, config.depth_ceiling
        ));
    }

    let mut degrade = |reason: String| {
        verdict = verdict.max(Verdict::Degraded);
        reasons.push(reason);
    };

    if sample.oldest_pending_age() > config.pending_sla {
        degrade(format!(
            "oldest pending task waited {}s (sla {}s)",
            sample.oldest_pending_age().as_secs(),
            config.pending_sla.as_secs()
        ));
    }
    if sample.depth > config.depth_warning {
        degrade(format!(
            "depth {} exceeds warning {}",
            sample.depth, config.depth_warning
        ));
    }
    if sample.samples() >= config.min_samples.max(1)
        && sample.failure_rate() > config.failure_rate_threshold
    {
        degrade(format!(
            "failure rate {:.0}% over the last {}s",
            sample.failure_rate() * 100.0,
            config.window.as_secs()
        ));
    }
    if sample.eligible > 0 && active_workers == 0 {
        degrade("eligible tasks but no active workers".to_string());
    }

    (verdict, reasons)
}
