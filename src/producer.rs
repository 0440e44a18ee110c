//! Producer API: route, wrap and enqueue
//!
//! Producers never see execution failures. They get an id back, and can later
//! read the result record, wait for it, or revoke the task.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::{Broker, TaskResult};
use crate::envelope::{PriorityClass, TaskEnvelope, TaskId};
use crate::error::{BusError, Result};
use crate::event::{events, BusEvent, EventEmitter};
use crate::router::Router;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Per-submit overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitOptions {
    /// Send to the queue registered for this class instead of the static route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_override: Option<PriorityClass>,
    /// Send to this declared queue; wins over `priority_override`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Not eligible before now + delay
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, class: PriorityClass) -> Self {
        self.priority_override = Some(class);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Submits tasks through the router into the broker
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    events: EventEmitter,
    shutting_down: Arc<AtomicBool>,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, router: Arc<Router>, events: EventEmitter) -> Self {
        Self {
            broker,
            router,
            events,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag with the owning bus
    pub(crate) fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutting_down = flag;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Build the envelope a submit would enqueue, without enqueueing it
    pub fn envelope(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: &SubmitOptions,
    ) -> Result<TaskEnvelope> {
        let route = self.router.route_with(
            task_type,
            options.priority_override,
            options.queue.as_deref(),
        )?;

        let max_attempts = options.max_attempts.unwrap_or(route.max_attempts);
        if max_attempts == 0 {
            return Err(BusError::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let mut envelope = TaskEnvelope::new(task_type, payload, route.queue, route.class)
            .with_max_attempts(max_attempts)
            .with_route_version(route.version);
        if let Some(delay) = options.delay {
            envelope = envelope.with_delay(delay);
        }
        Ok(envelope)
    }

    /// Route and enqueue a task, returning its id
    pub async fn submit(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BusError::ShutdownInProgress);
        }

        let envelope = match self.envelope(task_type, payload, &options) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(task_type = %task_type, error = %e, "taskbus.producer: submit rejected");
                return Err(e);
            }
        };
        let id = envelope.id.clone();
        let queue = envelope.queue_name.clone();
        let not_before = envelope.not_before;

        self.broker.enqueue(envelope).await?;

        tracing::debug!(
            task_id = %id,
            task_type = %task_type,
            queue = %queue,
            not_before = %not_before,
            "taskbus.producer: submitted"
        );
        self.events.emit(BusEvent::with_fields(
            events::TASK_SUBMITTED,
            [
                ("task_id", serde_json::json!(id)),
                ("task_type", serde_json::json!(task_type)),
                ("queue", serde_json::json!(queue)),
            ],
        ));
        Ok(id)
    }

    /// Submit a typed payload
    pub async fn submit_json<T: Serialize>(
        &self,
        task_type: &str,
        payload: &T,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        let payload = serde_json::to_value(payload)?;
        self.submit(task_type, payload, options).await
    }

    /// Live or dead-lettered envelope
    pub async fn get(&self, id: &str) -> Result<Option<TaskEnvelope>> {
        self.broker.get(id).await
    }

    /// Result record, if the task finished and the record has not expired
    pub async fn result(&self, id: &str) -> Result<Option<TaskResult>> {
        self.broker.result(id).await
    }

    /// Poll for the result record until it appears or `timeout` elapses
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Result<TaskResult> {
        let poll = async {
            loop {
                if let Some(result) = self.broker.result(id).await? {
                    return Ok(result);
                }
                tokio::time::sleep(RESULT_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }

    /// Revoke a task. Cancellation is advisory: a pending task is dead-lettered
    /// at lease time, a running handler sees it through `is_revoked`.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        if self.broker.get(id).await?.is_none() {
            return Err(BusError::TaskNotFound(id.to_string()));
        }
        self.broker.revoke(id).await?;

        tracing::info!(task_id = %id, "taskbus.producer: task revoked");
        self.events.emit(BusEvent::with_fields(
            events::TASK_REVOKED,
            [("task_id", serde_json::json!(id))],
        ));
        Ok(())
    }
}

/// Resubmits a task on a timer
///
/// Every cycle is a fresh envelope with its own id and attempt counter, so a
/// failing cycle never eats into the next one's retries.
pub struct Periodic {
    producer: Producer,
    task_type: String,
    payload: serde_json::Value,
    options: SubmitOptions,
    every: Duration,
}

impl Periodic {
    pub fn new(
        producer: Producer,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        every: Duration,
    ) -> Self {
        Self {
            producer,
            task_type: task_type.into(),
            payload,
            options: SubmitOptions::default(),
            every,
        }
    }

    pub fn with_options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }

    /// Start submitting; the first submission happens immediately
    pub fn start(self) -> Result<PeriodicHandle> {
        if self.every.is_zero() {
            return Err(BusError::ConfigError(
                "periodic interval must be non-zero".to_string(),
            ));
        }
        // Fail fast on a bad route instead of logging it every cycle
        self.producer
            .envelope(&self.task_type, self.payload.clone(), &self.options)?;

        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut submitted = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                match self
                    .producer
                    .submit(&self.task_type, self.payload.clone(), self.options.clone())
                    .await
                {
                    Ok(_) => submitted += 1,
                    Err(BusError::ShutdownInProgress) => break,
                    Err(e) => {
                        tracing::warn!(
                            task_type = %self.task_type,
                            error = %e,
                            "taskbus.producer: periodic submit failed"
                        );
                    }
                }
            }
            submitted
        });

        Ok(PeriodicHandle { stop, handle })
    }
}

/// Running [`Periodic`]
pub struct PeriodicHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl PeriodicHandle {
    /// Stop the timer and return how many tasks were submitted
    pub async fn stop(self) -> u64 {
        self.stop.send_replace(true);
        self.handle.await.unwrap_or(0)
    }
}
