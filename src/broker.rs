//! Broker adapter: queue storage with lease semantics
//!
//! The [`Broker`] trait is the only seam between the dispatch core and the
//! transport. [`InMemoryBroker`] is the in-process implementation (optionally
//! backed by [`Storage`]); [`crate::remote::HttpBroker`] speaks to a broker
//! hosted by `taskbus serve`.
//!
//! # Lease model
//!
//! A lease hands exclusive ownership of a pending envelope to one worker until
//! its visibility timeout. Acknowledging removes the envelope; releasing returns
//! it to pending with a `not_before` delay; an expired lease is reclaimed by the
//! [`LeaseReaper`] with its attempt counter unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::envelope::{add_duration, AttemptOutcome, PriorityClass, TaskEnvelope, TaskId, TaskStatus};
use crate::error::{BusError, Result};
use crate::event::{events, BusEvent, EventEmitter};
use crate::router::Route;
use crate::storage::Storage;

/// What the lease holder must do with the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseDisposition {
    /// Run the handler
    Execute,
    /// Revoked before execution; dead-letter without running
    Revoked,
    /// Attempt budget consumed by expired leases; dead-letter without running
    Exhausted,
}

/// A leased envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub envelope: TaskEnvelope,
    pub disposition: LeaseDisposition,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.envelope.lease.as_ref().map(|l| l.expires_at)
    }
}

/// Why a lease is being returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The attempt failed and will be retried
    Failed { error: String },
    /// The visibility timeout elapsed
    Expired,
}

impl ReleaseReason {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            ReleaseReason::Failed { error } => AttemptOutcome::Failed {
                error: error.clone(),
            },
            ReleaseReason::Expired => AttemptOutcome::Expired,
        }
    }
}

/// Terminal outcome kept for producers, expiring after the result TTL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_type: String,
    /// `succeeded` or `dead_lettered`
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn succeeded(envelope: &TaskEnvelope, value: serde_json::Value, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            task_id: envelope.id.clone(),
            task_type: envelope.task_type.clone(),
            status: TaskStatus::Succeeded,
            value: Some(value),
            error: None,
            attempts: envelope.attempt,
            finished_at: now,
            expires_at: add_duration(now, ttl),
        }
    }

    pub fn dead_lettered(envelope: &TaskEnvelope, error: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            task_id: envelope.id.clone(),
            task_type: envelope.task_type.clone(),
            status: TaskStatus::DeadLettered,
            value: None,
            error: Some(error.into()),
            attempts: envelope.attempt,
            finished_at: now,
            expires_at: add_duration(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Liveness record published by each worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub queues: Vec<String>,
    pub slots: usize,
    /// Slots currently executing
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    /// Routing table revision the worker was deployed with
    #[serde(default)]
    pub route_version: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Set on the final heartbeat of a graceful shutdown
    #[serde(default)]
    pub stopping: bool,
}

impl WorkerHeartbeat {
    /// No heartbeat for longer than `ttl`
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        add_duration(self.last_seen, ttl) < now
    }

    /// Alive and consuming from `queue`
    pub fn serves(&self, queue: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        !self.stopping && !self.is_stale(now, ttl) && self.queues.iter().any(|q| q == queue)
    }
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSample {
    pub queue: String,
    pub class: PriorityClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Pending envelopes, eligible or delayed
    pub depth: usize,
    pub eligible: usize,
    pub delayed: usize,
    pub leased: usize,
    /// Longest time an eligible envelope has waited for a lease
    pub oldest_pending_age_ms: u64,
    /// Outcomes inside the sampling window
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueSample {
    pub fn oldest_pending_age(&self) -> Duration {
        Duration::from_millis(self.oldest_pending_age_ms)
    }

    pub fn samples(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Failed share of finished attempts; zero when nothing finished
    pub fn failure_rate(&self) -> f64 {
        match self.samples() {
            0 => 0.0,
            n => self.failed as f64 / n as f64,
        }
    }
}

/// Transport abstraction
///
/// Every call may fail with [`BusError::BrokerUnavailable`]; callers treat that
/// as a reason to retry the broker call, never as a task failure.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Register a queue's class and in-flight ceiling. Queues are also created
    /// implicitly on first enqueue.
    async fn declare_queue(
        &self,
        name: &str,
        class: PriorityClass,
        concurrency: Option<usize>,
    ) -> Result<()>;

    /// Append a pending envelope to its queue
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()>;

    /// Lease the oldest eligible envelope of `queue`, or `None` when the queue
    /// is empty, everything is delayed, or the ceiling is reached
    async fn lease(
        &self,
        queue: &str,
        owner: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>>;

    /// Remove a finished envelope; unknown ids are ignored
    async fn acknowledge(&self, id: &str) -> Result<()>;

    /// Return a leased envelope to pending, eligible after `delay`
    async fn release(
        &self,
        id: &str,
        owner: &str,
        delay: Duration,
        reason: ReleaseReason,
    ) -> Result<()>;

    /// Move a leased envelope into the dead letter queue
    async fn dead_letter_task(&self, id: &str, owner: &str, error: &str) -> Result<()>;

    /// Drop every pending envelope of `queue`; leased envelopes are untouched
    async fn purge(&self, queue: &str, confirm: bool) -> Result<usize>;

    /// Return expired leases to pending with their attempt unchanged
    async fn reclaim_expired(&self) -> Result<Vec<TaskId>>;

    /// Mark a task so that its next lease is handed out as revoked
    async fn revoke(&self, id: &str) -> Result<()>;

    async fn is_revoked(&self, id: &str) -> Result<bool>;

    /// Current envelope, live or dead-lettered
    async fn get(&self, id: &str) -> Result<Option<TaskEnvelope>>;

    /// Per-queue samples with outcomes counted over `window`
    async fn stats(&self, window: Duration) -> Result<Vec<QueueSample>>;

    async fn store_result(&self, result: TaskResult) -> Result<()>;

    async fn result(&self, id: &str) -> Result<Option<TaskResult>>;

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<()>;

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    async fn dead_letter(&self, id: &str) -> Result<Option<DeadLetter>>;

    async fn dead_letter_count(&self) -> Result<usize> {
        Ok(self.dead_letters().await?.len())
    }

    /// Atomically move a dead letter back to pending on `route` with a fresh
    /// attempt budget
    async fn requeue_dead_letter(&self, id: &str, route: &Route) -> Result<TaskEnvelope>;

    /// Drop a dead letter; `false` if it did not exist
    async fn discard_dead_letter(&self, id: &str) -> Result<bool>;
}

/// Tuning for [`InMemoryBroker`]
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub dead_letter_capacity: usize,
    /// How long outcomes are kept for windowed stats
    pub outcome_retention: Duration,
    /// How long a revocation marker outlives its request
    pub revocation_ttl: Duration,
    /// Heartbeats older than this are forgotten
    pub heartbeat_retention: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            dead_letter_capacity: 10_000,
            outcome_retention: Duration::from_secs(3600),
            revocation_ttl: Duration::from_secs(24 * 3600),
            heartbeat_retention: Duration::from_secs(3600),
        }
    }
}

/// `t - d`, saturating at the distant past
fn sub_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

struct QueueState {
    class: PriorityClass,
    concurrency: Option<usize>,
    /// Enqueue order; released envelopes go to the back
    pending: VecDeque<TaskId>,
    leased: HashSet<TaskId>,
    /// `(finished_at, succeeded)`
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
}

impl QueueState {
    fn new(class: PriorityClass) -> Self {
        Self {
            class,
            concurrency: None,
            pending: VecDeque::new(),
            leased: HashSet::new(),
            outcomes: VecDeque::new(),
        }
    }

    fn record(&mut self, now: DateTime<Utc>, succeeded: bool, retention: Duration) {
        self.outcomes.push_back((now, succeeded));
        let horizon = sub_duration(now, retention);
        while matches!(self.outcomes.front(), Some((at, _)) if *at < horizon) {
            self.outcomes.pop_front();
        }
    }

    fn at_ceiling(&self) -> bool {
        matches!(self.concurrency, Some(ceiling) if self.leased.len() >= ceiling)
    }
}

#[derive(Default)]
struct BrokerState {
    tasks: HashMap<TaskId, TaskEnvelope>,
    queues: BTreeMap<String, QueueState>,
    revoked: HashMap<TaskId, DateTime<Utc>>,
    results: HashMap<TaskId, TaskResult>,
    workers: HashMap<String, WorkerHeartbeat>,
    closed: bool,
}

impl BrokerState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BusError::BrokerUnavailable("broker is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn queue_mut(&mut self, name: &str, class: PriorityClass) -> &mut QueueState {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(class))
    }

    /// Check that `id` is leased by `owner` and return its envelope
    fn leased_by(&mut self, id: &str, owner: &str) -> Result<&mut TaskEnvelope> {
        let envelope = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| BusError::TaskNotFound(id.to_string()))?;
        match &envelope.lease {
            Some(lease) if envelope.status == TaskStatus::Leased && lease.owner == owner => {
                Ok(envelope)
            }
            _ => Err(BusError::LeaseExpired(id.to_string())),
        }
    }
}

/// In-process broker
///
/// All state sits behind one async mutex, so lease, acknowledge and release
/// are atomic with respect to each other. With [`Storage`] attached every
/// mutation is written through before the call returns.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    dead_letters: DeadLetterQueue,
    storage: Option<Arc<dyn Storage>>,
    options: BrokerOptions,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_options(BrokerOptions::default())
    }

    pub fn with_options(options: BrokerOptions) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            dead_letters: DeadLetterQueue::new(options.dead_letter_capacity),
            storage: None,
            options,
        }
    }

    /// Open a persistent broker, restoring envelopes and dead letters.
    ///
    /// Envelopes that were leased when the previous process stopped are
    /// returned to pending as if their lease had expired.
    pub async fn open(options: BrokerOptions, storage: Arc<dyn Storage>) -> Result<Self> {
        let mut broker = Self::with_options(options);
        let now = Utc::now();

        let mut restored = 0usize;
        let mut reclaimed = Vec::new();
        {
            let mut state = broker.state.lock().await;
            for mut envelope in storage.load_envelopes().await? {
                if envelope.status == TaskStatus::Leased {
                    envelope.release(now, Duration::ZERO, AttemptOutcome::Expired)?;
                    reclaimed.push(envelope.clone());
                }
                if envelope.status != TaskStatus::Pending {
                    continue;
                }
                let id = envelope.id.clone();
                state
                    .queue_mut(&envelope.queue_name, envelope.priority_class)
                    .pending
                    .push_back(id.clone());
                state.tasks.insert(id, envelope);
                restored += 1;
            }
        }
        for envelope in &reclaimed {
            storage.save_envelope(envelope).await?;
        }

        let letters = storage.load_dead_letters().await?;
        let dead = letters.len();
        for letter in letters {
            broker.dead_letters.push(letter).await;
        }

        tracing::info!(
            restored,
            reclaimed = reclaimed.len(),
            dead_letters = dead,
            "taskbus.broker: state restored from storage"
        );
        broker.storage = Some(storage);
        Ok(broker)
    }

    /// Refuse all further calls with [`BusError::BrokerUnavailable`]
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    pub async fn reopen(&self) {
        self.state.lock().await.closed = false;
    }

    async fn persist(&self, envelope: &TaskEnvelope) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_envelope(envelope).await {
                tracing::warn!(task_id = %envelope.id, error = %e, "taskbus.storage: write failed");
            }
        }
    }

    async fn forget(&self, id: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_envelope(id).await {
                tracing::warn!(task_id = %id, error = %e, "taskbus.storage: remove failed");
            }
        }
    }

    async fn push_dead_letter(&self, letter: DeadLetter) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_dead_letter(&letter).await {
                tracing::warn!(task_id = %letter.task_id, error = %e, "taskbus.storage: write failed");
            }
        }
        if let Some(evicted) = self.dead_letters.push(letter).await {
            tracing::warn!(
                task_id = %evicted.task_id,
                "taskbus.dead_letter: capacity reached, oldest entry evicted"
            );
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.remove_dead_letter(&evicted.task_id).await {
                    tracing::warn!(
                        task_id = %evicted.task_id,
                        error = %e,
                        "taskbus.storage: removing evicted dead letter failed"
                    );
                }
            }
        }
    }

    fn prune(&self, state: &mut BrokerState, now: DateTime<Utc>) {
        state.results.retain(|_, r| !r.is_expired(now));
        let revocation_ttl = self.options.revocation_ttl;
        state
            .revoked
            .retain(|_, at| add_duration(*at, revocation_ttl) > now);
        let heartbeat_retention = self.options.heartbeat_retention;
        state
            .workers
            .retain(|_, hb| add_duration(hb.last_seen, heartbeat_retention) > now);
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(
        &self,
        name: &str,
        class: PriorityClass,
        concurrency: Option<usize>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let queue = state.queue_mut(name, class);
        queue.class = class;
        queue.concurrency = concurrency;
        Ok(())
    }

    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        if envelope.status != TaskStatus::Pending {
            return Err(BusError::Other(format!(
                "cannot enqueue task {} in status {}",
                envelope.id, envelope.status
            )));
        }
        if state.tasks.contains_key(&envelope.id) {
            return Err(BusError::Other(format!("task {} is already enqueued", envelope.id)));
        }

        if let Some(storage) = &self.storage {
            storage
                .save_envelope(&envelope)
                .await
                .map_err(|e| BusError::BrokerUnavailable(format!("storage: {}", e)))?;
        }

        let id = envelope.id.clone();
        state
            .queue_mut(&envelope.queue_name, envelope.priority_class)
            .pending
            .push_back(id.clone());
        state.tasks.insert(id, envelope);
        Ok(())
    }

    async fn lease(
        &self,
        queue: &str,
        owner: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();

        let BrokerState {
            tasks,
            queues,
            revoked,
            ..
        } = &mut *state;

        let Some(queue_state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        if queue_state.at_ceiling() {
            return Ok(None);
        }

        let position = queue_state
            .pending
            .iter()
            .position(|id| tasks.get(id).is_some_and(|e| e.is_eligible(now)));
        let Some(id) = position.and_then(|p| queue_state.pending.remove(p)) else {
            return Ok(None);
        };
        let Some(envelope) = tasks.get_mut(&id) else {
            return Ok(None);
        };

        let disposition = if revoked.contains_key(&id) {
            envelope.take_for_disposal(owner, now, visibility_timeout)?;
            LeaseDisposition::Revoked
        } else if envelope.is_exhausted() {
            envelope.take_for_disposal(owner, now, visibility_timeout)?;
            LeaseDisposition::Exhausted
        } else {
            envelope.begin_attempt(owner, now, visibility_timeout)?;
            LeaseDisposition::Execute
        };
        queue_state.leased.insert(id);

        let envelope = envelope.clone();
        self.persist(&envelope).await;
        Ok(Some(Lease {
            envelope,
            disposition,
        }))
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();

        let Some(envelope) = state.tasks.get_mut(id) else {
            return Ok(());
        };
        // A pending envelope was reclaimed after lease expiry; a late
        // acknowledgement still completes it
        if envelope.status == TaskStatus::Leased {
            envelope.transition(TaskStatus::Succeeded)?;
        }
        let Some(envelope) = state.tasks.remove(id) else {
            return Ok(());
        };
        let retention = self.options.outcome_retention;
        if let Some(queue) = state.queues.get_mut(&envelope.queue_name) {
            if queue.leased.remove(id) {
                queue.record(now, true, retention);
            } else {
                queue.pending.retain(|p| p != id);
            }
        }

        self.forget(id).await;
        Ok(())
    }

    async fn release(
        &self,
        id: &str,
        owner: &str,
        delay: Duration,
        reason: ReleaseReason,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();

        let envelope = state.leased_by(id, owner)?;
        envelope.release(now, delay, reason.outcome())?;
        let snapshot = envelope.clone();

        let retention = self.options.outcome_retention;
        let queue = state.queue_mut(&snapshot.queue_name, snapshot.priority_class);
        queue.leased.remove(id);
        queue.pending.push_back(id.to_string());
        if matches!(reason, ReleaseReason::Failed { .. }) {
            queue.record(now, false, retention);
        }

        self.persist(&snapshot).await;
        Ok(())
    }

    async fn dead_letter_task(&self, id: &str, owner: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();

        state.leased_by(id, owner)?.bury(error, now)?;
        let Some(envelope) = state.tasks.remove(id) else {
            return Err(BusError::TaskNotFound(id.to_string()));
        };

        let retention = self.options.outcome_retention;
        if let Some(queue) = state.queues.get_mut(&envelope.queue_name) {
            queue.leased.remove(id);
            queue.record(now, false, retention);
        }
        state.revoked.remove(id);

        self.forget(id).await;
        self.push_dead_letter(DeadLetter::new(envelope, error)).await;
        Ok(())
    }

    async fn purge(&self, queue: &str, confirm: bool) -> Result<usize> {
        if !confirm {
            return Err(BusError::NotConfirmed(format!(
                "purging queue '{}' drops all pending tasks",
                queue
            )));
        }

        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let pending: Vec<TaskId> = match state.queues.get_mut(queue) {
            Some(q) => q.pending.drain(..).collect(),
            None => return Ok(0),
        };
        for id in &pending {
            state.tasks.remove(id);
            self.forget(id).await;
        }

        tracing::warn!(queue = %queue, purged = pending.len(), "taskbus.broker: queue purged");
        Ok(pending.len())
    }

    async fn reclaim_expired(&self) -> Result<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();

        let mut reclaimed = Vec::new();
        {
            let BrokerState { tasks, queues, .. } = &mut *state;
            for queue in queues.values_mut() {
                let expired: Vec<TaskId> = queue
                    .leased
                    .iter()
                    .filter(|id| tasks.get(*id).map_or(true, |e| e.lease_expired(now)))
                    .cloned()
                    .collect();
                for id in expired {
                    queue.leased.remove(&id);
                    if let Some(envelope) = tasks.get_mut(&id) {
                        envelope.release(now, Duration::ZERO, AttemptOutcome::Expired)?;
                        queue.pending.push_back(id.clone());
                        reclaimed.push(envelope.clone());
                    }
                }
            }
        }
        self.prune(&mut state, now);

        for envelope in &reclaimed {
            self.persist(envelope).await;
        }
        Ok(reclaimed.into_iter().map(|e| e.id).collect())
    }

    async fn revoke(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.revoked.insert(id.to_string(), Utc::now());
        Ok(())
    }

    async fn is_revoked(&self, id: &str) -> Result<bool> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.revoked.contains_key(id))
    }

    async fn get(&self, id: &str) -> Result<Option<TaskEnvelope>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        if let Some(envelope) = state.tasks.get(id) {
            return Ok(Some(envelope.clone()));
        }
        Ok(self.dead_letters.get(id).await.map(|l| l.envelope))
    }

    async fn stats(&self, window: Duration) -> Result<Vec<QueueSample>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();
        let since = sub_duration(now, window);

        let samples = state
            .queues
            .iter()
            .map(|(name, queue)| {
                let mut eligible = 0;
                let mut oldest = Duration::ZERO;
                for envelope in queue.pending.iter().filter_map(|id| state.tasks.get(id)) {
                    if envelope.not_before <= now {
                        eligible += 1;
                        oldest = oldest.max((now - envelope.not_before).to_std().unwrap_or_default());
                    }
                }
                let (succeeded, failed) = queue
                    .outcomes
                    .iter()
                    .filter(|(at, _)| *at >= since)
                    .fold((0u64, 0u64), |(s, f), (_, ok)| if *ok { (s + 1, f) } else { (s, f + 1) });

                QueueSample {
                    queue: name.clone(),
                    class: queue.class,
                    concurrency: queue.concurrency,
                    depth: queue.pending.len(),
                    eligible,
                    delayed: queue.pending.len() - eligible,
                    leased: queue.leased.len(),
                    oldest_pending_age_ms: u64::try_from(oldest.as_millis()).unwrap_or(u64::MAX),
                    succeeded,
                    failed,
                }
            })
            .collect();
        Ok(samples)
    }

    async fn store_result(&self, result: TaskResult) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.results.insert(result.task_id.clone(), result);
        Ok(())
    }

    async fn result(&self, id: &str) -> Result<Option<TaskResult>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        let now = Utc::now();
        Ok(state.results.get(id).filter(|r| !r.is_expired(now)).cloned())
    }

    async fn heartbeat(&self, mut heartbeat: WorkerHeartbeat) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        heartbeat.last_seen = Utc::now();
        state.workers.insert(heartbeat.worker_id.clone(), heartbeat);
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        let mut workers: Vec<WorkerHeartbeat> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.state.lock().await.ensure_open()?;
        Ok(self.dead_letters.list().await)
    }

    async fn dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.state.lock().await.ensure_open()?;
        Ok(self.dead_letters.get(id).await)
    }

    async fn dead_letter_count(&self) -> Result<usize> {
        self.state.lock().await.ensure_open()?;
        Ok(self.dead_letters.len().await)
    }

    async fn requeue_dead_letter(&self, id: &str, route: &Route) -> Result<TaskEnvelope> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let letter = self
            .dead_letters
            .get(id)
            .await
            .ok_or_else(|| BusError::TaskNotFound(id.to_string()))?;

        let mut envelope = letter.envelope;
        envelope.reset_for_requeue(route.queue.clone(), route.class, route.version.clone())?;
        envelope.max_attempts = route.max_attempts.max(1);
        self.dead_letters.remove(id).await;

        state
            .queue_mut(&route.queue, route.class)
            .pending
            .push_back(envelope.id.clone());
        state.tasks.insert(envelope.id.clone(), envelope.clone());

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_dead_letter(id).await {
                tracing::warn!(task_id = %id, error = %e, "taskbus.storage: remove failed");
            }
        }
        self.persist(&envelope).await;
        Ok(envelope)
    }

    async fn discard_dead_letter(&self, id: &str) -> Result<bool> {
        self.state.lock().await.ensure_open()?;
        let removed = self.dead_letters.remove(id).await.is_some();
        if removed {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.remove_dead_letter(id).await {
                    tracing::warn!(task_id = %id, error = %e, "taskbus.storage: remove failed");
                }
            }
        }
        Ok(removed)
    }
}

/// Periodically returns expired leases to pending
pub struct LeaseReaper {
    broker: Arc<dyn Broker>,
    interval: Duration,
    events: EventEmitter,
}

impl LeaseReaper {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration, events: EventEmitter) -> Self {
        Self {
            broker,
            interval,
            events,
        }
    }

    /// One reclamation pass
    pub async fn sweep(&self) -> Result<Vec<TaskId>> {
        let reclaimed = self.broker.reclaim_expired().await?;
        for id in &reclaimed {
            tracing::warn!(task_id = %id, "taskbus.lease: visibility timeout elapsed, task reclaimed");
            self.events.emit(BusEvent::with_fields(
                events::LEASE_EXPIRED,
                [("task_id", serde_json::json!(id))],
            ));
        }
        Ok(reclaimed)
    }

    /// Start sweeping in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::debug!(error = %e, "taskbus.lease: sweep skipped");
                }
            }
        })
    }
}
