//! Worker pool: leases envelopes and runs their handlers
//!
//! A pool owns a fixed number of execution slots. A slot is acquired *before*
//! anything is leased, so a saturated pool stops pulling work and leaves it in
//! the broker for other workers. Which queue gets polled is decided by the
//! [`PriorityScheduler`]; what happens after a failure is decided by the
//! [`RetryPolicy`] of the task's queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::broker::{Broker, Lease, LeaseDisposition, ReleaseReason, TaskResult, WorkerHeartbeat};
use crate::config::{BusConfig, PriorityWeights, WorkerConfig};
use crate::envelope::{TaskEnvelope, TaskId, WorkerId};
use crate::error::{BusError, Result, TaskError};
use crate::event::{events, BusEvent, EventEmitter};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::router::Router;
use crate::scheduler::PriorityScheduler;
use crate::telemetry::SPAN_EXECUTE;

/// Dead-letter reason for envelopes whose attempts were all lost to lease expiry
pub const EXHAUSTED_BY_EXPIRY: &str = "attempts exhausted by lease expiry";

/// Dead-letter reason for revoked envelopes
pub const REVOKED: &str = "revoked";

const MAX_BROKER_BACKOFF: Duration = Duration::from_secs(5);

/// Calls made per broker operation while disposing of a finished task
const DISPOSAL_ATTEMPTS: u32 = 8;

fn disposal_backoff() -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_millis(50), MAX_BROKER_BACKOFF)
}

/// Business logic for one task type
///
/// Return [`TaskError::Transient`] to have the attempt retried with backoff,
/// [`TaskError::Permanent`] to dead-letter immediately.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> std::result::Result<serde_json::Value, TaskError>;
}

/// What a handler sees of its task
pub struct TaskContext {
    envelope: TaskEnvelope,
    broker: Arc<dyn Broker>,
    worker_id: WorkerId,
}

impl TaskContext {
    pub fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    pub fn task_id(&self) -> &str {
        &self.envelope.id
    }

    pub fn task_type(&self) -> &str {
        &self.envelope.task_type
    }

    /// 1-based attempt number of this execution
    pub fn attempt(&self) -> u32 {
        self.envelope.attempt
    }

    pub fn is_last_attempt(&self) -> bool {
        self.envelope.attempt >= self.envelope.max_attempts
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.envelope.payload
    }

    /// Decode the payload into the handler's input type
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, TaskError> {
        serde_json::from_value(self.envelope.payload.clone())
            .map_err(|e| TaskError::Serialization(e.to_string()))
    }

    /// Whether an operator revoked this task; long handlers should poll this
    pub async fn is_revoked(&self) -> bool {
        self.broker
            .is_revoked(&self.envelope.id)
            .await
            .unwrap_or(false)
    }
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, TaskError>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> std::result::Result<serde_json::Value, TaskError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Explicit task type → handler table, built at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; each task type may be registered once
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<()> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(BusError::ConfigError(format!(
                "handler for '{}' registered twice",
                task_type
            )));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        self.register(task_type, handler_fn(f))
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check the registry against the routing table for a worker polling `queues`.
    ///
    /// Every handler must have a route, every polled queue must be declared,
    /// and every task type routed to a polled queue must have a handler.
    pub fn validate(&self, router: &Router, queues: &[String]) -> Result<()> {
        for task_type in self.task_types() {
            if !router.is_routable(task_type) {
                return Err(BusError::ConfigError(format!(
                    "handler registered for '{}' but no route exists",
                    task_type
                )));
            }
        }

        for queue in queues {
            if router.queue(queue).is_none() {
                return Err(BusError::ConfigError(format!(
                    "worker polls undeclared queue '{}'",
                    queue
                )));
            }
            if let Some(missing) = router
                .task_types_for(queue)
                .into_iter()
                .find(|t| !self.contains(t))
            {
                return Err(BusError::ConfigError(format!(
                    "queue '{}' receives '{}' but no handler is registered",
                    queue, missing
                )));
            }
        }
        Ok(())
    }
}

/// A slot that ran past its budget
#[derive(Debug, Clone, PartialEq)]
pub struct SlotReport {
    pub task_id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct ActiveSlot {
    task_type: String,
    queue: String,
    started: Instant,
    overrun_reported: bool,
}

// Frees the slot bookkeeping even if the handler task is cancelled
struct SlotGuard<'a> {
    active: &'a DashMap<TaskId, ActiveSlot>,
    task_id: TaskId,
}

impl<'a> SlotGuard<'a> {
    fn enter(active: &'a DashMap<TaskId, ActiveSlot>, envelope: &TaskEnvelope) -> Self {
        active.insert(
            envelope.id.clone(),
            ActiveSlot {
                task_type: envelope.task_type.clone(),
                queue: envelope.queue_name.clone(),
                started: Instant::now(),
                overrun_reported: false,
            },
        );
        Self {
            active,
            task_id: envelope.id.clone(),
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.task_id);
    }
}

/// Builder for [`WorkerPool`]
pub struct WorkerPoolBuilder {
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    registry: HandlerRegistry,
    queues: Option<Vec<String>>,
    config: WorkerConfig,
    weights: PriorityWeights,
    visibility_timeout: Duration,
    retry: RetryPolicy,
    result_ttl: Duration,
    events: EventEmitter,
    worker_id: Option<WorkerId>,
}

impl WorkerPoolBuilder {
    pub fn new(broker: Arc<dyn Broker>, router: Arc<Router>, registry: HandlerRegistry) -> Self {
        let defaults = BusConfig::default();
        Self {
            broker,
            router,
            registry,
            queues: None,
            config: defaults.worker,
            weights: defaults.weights,
            visibility_timeout: defaults.visibility_timeout,
            retry: defaults.retry,
            result_ttl: defaults.result_ttl,
            events: EventEmitter::default(),
            worker_id: None,
        }
    }

    /// Take worker, weight, lease, retry and result settings from `config`
    pub fn with_bus_config(mut self, config: &BusConfig) -> Self {
        self.config = config.worker.clone();
        self.weights = config.weights;
        self.visibility_timeout = config.visibility_timeout;
        self.retry = config.retry.clone();
        self.result_ttl = config.result_ttl;
        self
    }

    /// Queues to poll; defaults to every queue with a statically routed handler
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<WorkerId>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    /// Validate against the routing table and build the pool
    pub fn build(self) -> Result<WorkerPool> {
        if self.config.slots == 0 {
            return Err(BusError::ConfigError(
                "worker slots must be at least 1".to_string(),
            ));
        }

        let queues = match self.queues {
            Some(queues) => queues,
            None => self
                .router
                .queues()
                .filter(|(name, _)| {
                    self.router
                        .task_types_for(name)
                        .iter()
                        .any(|t| self.registry.contains(t))
                })
                .map(|(name, _)| name.to_string())
                .collect(),
        };
        if queues.is_empty() {
            return Err(BusError::ConfigError("worker polls no queues".to_string()));
        }
        self.registry.validate(&self.router, &queues)?;

        let scheduler = PriorityScheduler::new(
            self.weights,
            queues.iter().filter_map(|q| {
                self.router
                    .queue(q)
                    .map(|config| (q.clone(), config.class))
            }),
        );

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let id = self.worker_id.unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}-{}", hostname, &suffix[..8])
        });
        let (shutdown, _) = watch::channel(false);

        Ok(WorkerPool {
            inner: Arc::new(PoolInner {
                id,
                hostname,
                slots: Arc::new(Semaphore::new(self.config.slots)),
                broker: self.broker,
                router: self.router,
                registry: self.registry,
                queues,
                config: self.config,
                visibility_timeout: self.visibility_timeout,
                retry: self.retry,
                result_ttl: self.result_ttl,
                events: self.events,
                scheduler: Mutex::new(scheduler),
                active: DashMap::new(),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                shutdown,
                started_at: Utc::now(),
                background: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct PoolInner {
    id: WorkerId,
    hostname: String,
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    registry: HandlerRegistry,
    queues: Vec<String>,
    config: WorkerConfig,
    visibility_timeout: Duration,
    retry: RetryPolicy,
    result_ttl: Duration,
    events: EventEmitter,
    scheduler: Mutex<PriorityScheduler>,
    slots: Arc<Semaphore>,
    active: DashMap<TaskId, ActiveSlot>,
    processed: AtomicU64,
    failed: AtomicU64,
    shutdown: watch::Sender<bool>,
    started_at: DateTime<Utc>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Worker pool
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn builder(
        broker: Arc<dyn Broker>,
        router: Arc<Router>,
        registry: HandlerRegistry,
    ) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(broker, router, registry)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn queues(&self) -> &[String] {
        &self.inner.queues
    }

    /// Slots currently executing a handler
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Successfully completed tasks
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    /// Failed attempts
    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Current liveness record
    pub fn heartbeat(&self) -> WorkerHeartbeat {
        self.inner.heartbeat()
    }

    /// Start polling, the slot watchdog and heartbeats
    pub async fn start(&self) {
        let mut background = self.inner.background.lock().await;
        if !background.is_empty() || self.is_shutting_down() {
            return;
        }

        background.push(tokio::spawn(poll_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));
        background.push(tokio::spawn(watchdog_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));
        background.push(tokio::spawn(heartbeat_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));

        info!(
            worker_id = %self.inner.id,
            queues = %self.inner.queues.join(","),
            slots = self.inner.config.slots,
            "taskbus.worker: started"
        );
        self.inner.events.emit(BusEvent::with_fields(
            events::WORKER_STARTED,
            [
                ("worker_id", serde_json::json!(self.inner.id)),
                ("queues", serde_json::json!(self.inner.queues)),
            ],
        ));
    }

    /// Stop leasing new work; in-flight handlers keep running
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }

        info!(
            worker_id = %self.inner.id,
            active = self.active_count(),
            "taskbus.worker: shutting down"
        );
        if let Err(e) = self.inner.broker.heartbeat(self.inner.heartbeat()).await {
            warn!(worker_id = %self.inner.id, error = %e, "taskbus.worker: final heartbeat failed");
        }
        self.inner.events.emit(BusEvent::with_fields(
            events::WORKER_STOPPED,
            [("worker_id", serde_json::json!(self.inner.id))],
        ));
    }

    /// Shut down and wait for every slot to finish
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        self.shutdown().await;

        let permits = u32::try_from(self.inner.config.slots).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.inner.slots.acquire_many(permits)).await {
            Ok(_) => {
                for handle in self.inner.background.lock().await.drain(..) {
                    handle.abort();
                }
                info!(worker_id = %self.inner.id, "taskbus.worker: drained");
                Ok(())
            }
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Report slots running past the budget; each slot is reported once
    pub fn check_slots(&self) -> Vec<SlotReport> {
        self.inner.check_slots()
    }

    /// Lease and run at most one task on the calling task.
    ///
    /// Returns `false` when nothing was eligible.
    pub async fn run_once(&self) -> Result<bool> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BusError::ShutdownInProgress)?;
        match self.inner.lease_next().await? {
            Some(lease) => {
                self.inner.process(lease, permit).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn poll_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Backpressure: no free slot, no lease
        let permit = tokio::select! {
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }

        match inner.lease_next().await {
            Ok(Some(lease)) => {
                failures = 0;
                let worker = inner.clone();
                tokio::spawn(async move { worker.process(lease, permit).await });
            }
            Ok(None) => {
                failures = 0;
                drop(permit);
                idle(&mut shutdown, inner.config.poll_interval).await;
            }
            Err(e) => {
                drop(permit);
                failures = failures.saturating_add(1);
                let backoff = inner
                    .config
                    .poll_interval
                    .saturating_mul(2u32.saturating_pow(failures.min(16)))
                    .min(MAX_BROKER_BACKOFF);
                warn!(
                    worker_id = %inner.id,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "taskbus.worker: lease failed, backing off"
                );
                idle(&mut shutdown, backoff).await;
            }
        }
    }
    debug!(worker_id = %inner.id, "taskbus.worker: poll loop stopped");
}

async fn watchdog_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let period = (inner.config.slot_budget / 4).clamp(Duration::from_millis(10), Duration::from_secs(5));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        inner.check_slots();
    }
}

async fn heartbeat_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = inner.broker.heartbeat(inner.heartbeat()).await {
            debug!(worker_id = %inner.id, error = %e, "taskbus.worker: heartbeat failed");
        }
    }
}

async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

impl PoolInner {
    fn heartbeat(&self) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: self.id.clone(),
            hostname: self.hostname.clone(),
            queues: self.queues.clone(),
            slots: self.config.slots,
            active: self.active.len(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            route_version: self.router.version().to_string(),
            started_at: self.started_at,
            last_seen: Utc::now(),
            stopping: *self.shutdown.borrow(),
        }
    }

    fn retry_for(&self, queue: &str) -> &RetryPolicy {
        self.router
            .queue(queue)
            .and_then(|q| q.retry.as_ref())
            .unwrap_or(&self.retry)
    }

    async fn lease_next(&self) -> Result<Option<Lease>> {
        let order = self.scheduler.lock().await.next_cycle();
        for queue in order {
            if let Some(lease) = self
                .broker
                .lease(&queue, &self.id, self.visibility_timeout)
                .await?
            {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    async fn process(&self, lease: Lease, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        let envelope = lease.envelope;

        match lease.disposition {
            LeaseDisposition::Execute => self.execute(envelope).await,
            LeaseDisposition::Revoked => {
                info!(task_id = %envelope.id, "taskbus.task: revoked, not executing");
                self.events.emit(BusEvent::with_fields(
                    events::TASK_REVOKED,
                    [("task_id", serde_json::json!(envelope.id))],
                ));
                self.bury(&envelope, REVOKED).await;
            }
            LeaseDisposition::Exhausted => self.bury(&envelope, EXHAUSTED_BY_EXPIRY).await,
        }
    }

    async fn execute(&self, envelope: TaskEnvelope) {
        let started = Instant::now();
        debug!(
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            queue = %envelope.queue_name,
            attempt = envelope.attempt,
            "taskbus.task: leased"
        );
        self.events.emit(BusEvent::with_fields(
            events::TASK_LEASED,
            [
                ("task_id", serde_json::json!(envelope.id)),
                ("task_type", serde_json::json!(envelope.task_type)),
                ("queue", serde_json::json!(envelope.queue_name)),
                ("attempt", serde_json::json!(envelope.attempt)),
            ],
        ));

        let span = tracing::info_span!(
            SPAN_EXECUTE,
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            attempt = envelope.attempt
        );
        let outcome = {
            let _slot = SlotGuard::enter(&self.active, &envelope);
            self.run_handler(&envelope).instrument(span).await
        };

        match outcome {
            Ok(value) => self.complete(&envelope, value, started.elapsed()).await,
            Err(error) => self.fail(&envelope, error).await,
        }
    }

    async fn run_handler(&self, envelope: &TaskEnvelope) -> Result<serde_json::Value> {
        let Some(handler) = self.registry.get(&envelope.task_type) else {
            return Err(BusError::HandlerError(format!(
                "no handler for '{}' on worker {}",
                envelope.task_type, self.id
            )));
        };

        let ctx = TaskContext {
            envelope: envelope.clone(),
            broker: self.broker.clone(),
            worker_id: self.id.clone(),
        };

        // A panicking handler counts as a transient failure
        match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(result) => result.map_err(BusError::from),
            Err(e) if e.is_panic() => Err(BusError::HandlerError("handler panicked".to_string())),
            Err(e) => Err(BusError::HandlerError(format!("handler aborted: {}", e))),
        }
    }

    /// Run one broker call, retrying with backoff while the broker is unavailable
    ///
    /// Any other error, or the last unavailable one, is returned to the caller.
    async fn with_broker_retry<T, F, Fut>(&self, op: &str, task_id: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = disposal_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(BusError::BrokerUnavailable(reason)) if attempt < DISPOSAL_ATTEMPTS => {
                    let delay = backoff.delay_for_attempt(attempt);
                    debug!(
                        task_id = %task_id,
                        op = op,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "taskbus.worker: broker unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn complete(&self, envelope: &TaskEnvelope, value: serde_json::Value, elapsed: Duration) {
        let result = TaskResult::succeeded(envelope, value, self.result_ttl);
        if let Err(e) = self
            .with_broker_retry("store_result", &envelope.id, || {
                self.broker.store_result(result.clone())
            })
            .await
        {
            warn!(task_id = %envelope.id, error = %e, "taskbus.task: storing result failed");
        }
        if let Err(e) = self
            .with_broker_retry("acknowledge", &envelope.id, || {
                self.broker.acknowledge(&envelope.id)
            })
            .await
        {
            // The lease will expire and the task may run again
            warn!(task_id = %envelope.id, error = %e, "taskbus.task: acknowledge failed");
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        info!(
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            attempt = envelope.attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            "taskbus.task: succeeded"
        );
        self.events.emit(BusEvent::with_fields(
            events::TASK_SUCCEEDED,
            [
                ("task_id", serde_json::json!(envelope.id)),
                ("task_type", serde_json::json!(envelope.task_type)),
                ("attempt", serde_json::json!(envelope.attempt)),
            ],
        ));
    }

    async fn fail(&self, envelope: &TaskEnvelope, error: BusError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(BusEvent::with_fields(
            events::TASK_FAILED,
            [
                ("task_id", serde_json::json!(envelope.id)),
                ("attempt", serde_json::json!(envelope.attempt)),
                ("error", serde_json::json!(error.to_string())),
            ],
        ));

        match self.retry_for(&envelope.queue_name).decide(envelope, &error) {
            RetryDecision::Retry { delay } => {
                info!(
                    task_id = %envelope.id,
                    retry_attempt = envelope.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "taskbus.retry: retrying task"
                );
                let reason = ReleaseReason::Failed {
                    error: error.to_string(),
                };
                let released = self
                    .with_broker_retry("release", &envelope.id, || {
                        self.broker
                            .release(&envelope.id, &self.id, delay, reason.clone())
                    })
                    .await;
                match released {
                    Ok(()) => self.events.emit(BusEvent::with_fields(
                        events::TASK_RETRY,
                        [
                            ("task_id", serde_json::json!(envelope.id)),
                            ("attempt", serde_json::json!(envelope.attempt)),
                            ("delay_ms", serde_json::json!(delay.as_millis() as u64)),
                        ],
                    )),
                    Err(e) => {
                        // Left to lease expiry, which retries without the backoff
                        warn!(task_id = %envelope.id, error = %e, "taskbus.retry: release failed");
                    }
                }
            }
            RetryDecision::DeadLetter { reason } => self.bury(envelope, &reason).await,
        }
    }

    async fn bury(&self, envelope: &TaskEnvelope, reason: &str) {
        if let Err(e) = self
            .with_broker_retry("dead_letter", &envelope.id, || {
                self.broker.dead_letter_task(&envelope.id, &self.id, reason)
            })
            .await
        {
            warn!(task_id = %envelope.id, error = %e, "taskbus.dead_letter: move failed");
            return;
        }

        warn!(
            task_id = %envelope.id,
            task_type = %envelope.task_type,
            attempts = envelope.attempt,
            reason = %reason,
            "taskbus.dead_letter: task dead-lettered"
        );
        let result = TaskResult::dead_lettered(envelope, reason, self.result_ttl);
        if let Err(e) = self
            .with_broker_retry("store_result", &envelope.id, || {
                self.broker.store_result(result.clone())
            })
            .await
        {
            warn!(task_id = %envelope.id, error = %e, "taskbus.task: storing result failed");
        }
        self.events.emit(BusEvent::with_fields(
            events::TASK_DEAD_LETTERED,
            [
                ("task_id", serde_json::json!(envelope.id)),
                ("task_type", serde_json::json!(envelope.task_type)),
                ("reason", serde_json::json!(reason)),
            ],
        ));
    }

    fn check_slots(&self) -> Vec<SlotReport> {
        let budget = self.config.slot_budget;
        let mut reports = Vec::new();

        for mut entry in self.active.iter_mut() {
            let elapsed = entry.started.elapsed();
            if entry.overrun_reported || elapsed <= budget {
                continue;
            }
            entry.overrun_reported = true;
            reports.push(SlotReport {
                task_id: entry.key().clone(),
                task_type: entry.task_type.clone(),
                queue: entry.queue.clone(),
                elapsed,
            });
        }

        for report in &reports {
            warn!(
                worker_id = %self.id,
                task_id = %report.task_id,
                task_type = %report.task_type,
                elapsed_ms = report.elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "taskbus.worker: slot over budget"
            );
            self.events.emit(BusEvent::with_fields(
                events::WORKER_SLOT_OVERRUN,
                [
                    ("worker_id", serde_json::json!(self.id)),
                    ("task_id", serde_json::json!(report.task_id)),
                    ("task_type", serde_json::json!(report.task_type)),
                    ("elapsed_ms", serde_json::json!(report.elapsed.as_millis() as u64)),
                ],
            ));
        }
        reports
    }
}
