//! Dead letter queue for terminally failed tasks
//!
//! [`DeadLetterQueue`] is the storage used by the broker. [`DeadLetterHandler`]
//! is the operator-facing surface: list, inspect, requeue and discard.
//! Requeue is always an explicit action; nothing here retries on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::envelope::{TaskEnvelope, TaskId};
use crate::error::{BusError, Result};
use crate::event::{events, BusEvent, EventEmitter};
use crate::router::Router;

/// A task that exhausted its retries or failed permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub task_type: String,
    /// Queue the task was leased from
    pub queue_name: String,
    /// Final failure reason
    pub error: String,
    /// Attempts consumed
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// Original payload and full attempt history
    pub envelope: TaskEnvelope,
}

impl DeadLetter {
    pub fn new(envelope: TaskEnvelope, error: impl Into<String>) -> Self {
        Self {
            task_id: envelope.id.clone(),
            task_type: envelope.task_type.clone(),
            queue_name: envelope.queue_name.clone(),
            error: error.into(),
            attempts: envelope.attempt,
            failed_at: Utc::now(),
            envelope,
        }
    }
}

/// Bounded store of dead letters; the oldest entry is evicted at capacity
#[derive(Clone)]
pub struct DeadLetterQueue {
    letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with a maximum size
    pub fn new(max_size: usize) -> Self {
        Self {
            letters: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Push a dead letter, returning the evicted entry if the queue was full
    pub async fn push(&self, letter: DeadLetter) -> Option<DeadLetter> {
        let mut letters = self.letters.lock().await;

        let evicted = if letters.len() >= self.max_size {
            letters.pop_front()
        } else {
            None
        };

        letters.push_back(letter);
        evicted
    }

    /// List all dead letters, oldest first (returns a copy)
    pub async fn list(&self) -> Vec<DeadLetter> {
        let letters = self.letters.lock().await;
        letters.iter().cloned().collect()
    }

    /// Look up a dead letter by task id
    pub async fn get(&self, task_id: &str) -> Option<DeadLetter> {
        let letters = self.letters.lock().await;
        letters.iter().find(|l| l.task_id == task_id).cloned()
    }

    /// Remove a dead letter by task id
    pub async fn remove(&self, task_id: &str) -> Option<DeadLetter> {
        let mut letters = self.letters.lock().await;
        let index = letters.iter().position(|l| l.task_id == task_id)?;
        letters.remove(index)
    }

    /// Get the number of dead letters
    pub async fn len(&self) -> usize {
        let letters = self.letters.lock().await;
        letters.len()
    }
}

/// Administrative operations over the broker's dead letters
#[derive(Clone)]
pub struct DeadLetterHandler {
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    events: EventEmitter,
}

impl DeadLetterHandler {
    pub fn new(broker: Arc<dyn Broker>, router: Arc<Router>, events: EventEmitter) -> Self {
        Self {
            broker,
            router,
            events,
        }
    }

    pub async fn list(&self) -> Result<Vec<DeadLetter>> {
        self.broker.dead_letters().await
    }

    pub async fn inspect(&self, task_id: &str) -> Result<DeadLetter> {
        self.broker
            .dead_letter(task_id)
            .await?
            .ok_or_else(|| BusError::TaskNotFound(task_id.to_string()))
    }

    /// Put a dead letter back into circulation with a fresh attempt budget.
    ///
    /// The task type is routed again, so a routing change made since the
    /// failure applies to the requeued task. Unroutable task types stay in the
    /// dead letter queue.
    pub async fn requeue(&self, task_id: &str) -> Result<TaskEnvelope> {
        let letter = self.inspect(task_id).await?;
        let route = self.router.route(&letter.task_type)?;
        let envelope = self.broker.requeue_dead_letter(task_id, &route).await?;

        tracing::info!(
            task_id = %task_id,
            queue = %envelope.queue_name,
            "taskbus.dead_letter: requeued by operator"
        );
        self.events.emit(BusEvent::with_fields(
            events::TASK_REQUEUED,
            [
                ("task_id", serde_json::json!(task_id)),
                ("task_type", serde_json::json!(envelope.task_type)),
                ("queue", serde_json::json!(envelope.queue_name)),
            ],
        ));
        Ok(envelope)
    }

    /// Drop a dead letter permanently
    pub async fn discard(&self, task_id: &str) -> Result<()> {
        if self.broker.discard_dead_letter(task_id).await? {
            tracing::info!(task_id = %task_id, "taskbus.dead_letter: discarded by operator");
            Ok(())
        } else {
            Err(BusError::TaskNotFound(task_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, LeaseDisposition};
    use crate::config::{BusConfig, QueueConfig, RouteRule};
    use crate::envelope::{PriorityClass, TaskStatus};
    use std::time::Duration;

    fn make_dead_letter(id: &str, error: &str) -> DeadLetter {
        let mut envelope =
            TaskEnvelope::new("test", serde_json::json!({"n": 1}), "default", PriorityClass::Default);
        envelope.id = id.to_string();
        envelope.attempt = 3;
        DeadLetter::new(envelope, error)
    }

    // ========================================================================
    // DeadLetterQueue
    // ========================================================================

    #[tokio::test]
    async fn test_dlq_new() {
        let dlq = DeadLetterQueue::new(100);
        assert_eq!(dlq.max_size, 100);
        assert_eq!(dlq.len().await, 0);
    }

    #[tokio::test]
    async fn test_dlq_push_and_list() {
        let dlq = DeadLetterQueue::new(10);

        dlq.push(make_dead_letter("t1", "error1")).await;
        dlq.push(make_dead_letter("t2", "error2")).await;
        dlq.push(make_dead_letter("t3", "error3")).await;

        let list = dlq.list().await;
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].task_id, "t1");
        assert_eq!(list[2].task_id, "t3");
        assert_eq!(list[0].attempts, 3);

        // List should not remove items
        assert_eq!(dlq.len().await, 3);
    }

    #[tokio::test]
    async fn test_dlq_get_and_remove() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push(make_dead_letter("t1", "error1")).await;
        dlq.push(make_dead_letter("t2", "error2")).await;

        assert_eq!(dlq.get("t2").await.unwrap().error, "error2");
        assert!(dlq.get("t9").await.is_none());

        let removed = dlq.remove("t1").await.unwrap();
        assert_eq!(removed.task_id, "t1");
        assert!(dlq.remove("t1").await.is_none());
        assert_eq!(dlq.len().await, 1);
    }

    #[tokio::test]
    async fn test_dlq_max_size() {
        let dlq = DeadLetterQueue::new(3);

        assert!(dlq.push(make_dead_letter("t1", "e")).await.is_none());
        dlq.push(make_dead_letter("t2", "e")).await;
        dlq.push(make_dead_letter("t3", "e")).await;

        // Push 4th item - should evict oldest
        let evicted = dlq.push(make_dead_letter("t4", "e")).await;
        assert_eq!(evicted.unwrap().task_id, "t1");
        assert_eq!(dlq.len().await, 3);

        let list = dlq.list().await;
        assert_eq!(list[0].task_id, "t2");
        assert_eq!(list[2].task_id, "t4");
    }

    #[tokio::test]
    async fn test_dlq_clone_shares_storage() {
        let dlq1 = DeadLetterQueue::new(10);
        let dlq2 = dlq1.clone();
        dlq2.push(make_dead_letter("t1", "e")).await;
        assert_eq!(dlq1.len().await, 1);
    }

    #[test]
    fn test_dead_letter_serialization() {
        let letter = make_dead_letter("t1", "test error");
        let json = serde_json::to_string(&letter).unwrap();
        let parsed: DeadLetter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, letter);
    }

    // ========================================================================
    // DeadLetterHandler
    // ========================================================================

    async fn dead_lettered_setup() -> (DeadLetterHandler, Arc<InMemoryBroker>, String) {
        let config = BusConfig::empty()
            .with_queue("mail", QueueConfig::new(PriorityClass::High).with_max_attempts(4))
            .with_queue("reports", QueueConfig::new(PriorityClass::Low))
            .with_route(RouteRule::new("mail.send", "mail"));
        let router = Arc::new(Router::from_config(&config).unwrap());
        let broker = Arc::new(InMemoryBroker::new());

        let envelope = TaskEnvelope::new(
            "mail.send",
            serde_json::json!({"to": "a@b.c"}),
            "reports",
            PriorityClass::Low,
        )
        .with_max_attempts(1);
        let id = envelope.id.clone();
        broker.enqueue(envelope).await.unwrap();

        let lease = broker
            .lease("reports", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.disposition, LeaseDisposition::Execute);
        broker.dead_letter_task(&id, "w1", "smtp rejected").await.unwrap();

        let handler = DeadLetterHandler::new(broker.clone(), router, EventEmitter::new(16));
        (handler, broker, id)
    }

    #[tokio::test]
    async fn test_handler_list_and_inspect() {
        let (handler, _broker, id) = dead_lettered_setup().await;

        let letters = handler.list().await.unwrap();
        assert_eq!(letters.len(), 1);

        let letter = handler.inspect(&id).await.unwrap();
        assert_eq!(letter.error, "smtp rejected");
        assert_eq!(letter.attempts, 1);
        assert_eq!(letter.envelope.status, TaskStatus::DeadLettered);
        assert_eq!(letter.envelope.history.len(), 1);
        assert_eq!(letter.envelope.payload["to"], "a@b.c");

        assert!(matches!(
            handler.inspect("missing").await,
            Err(BusError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_requeue_resets_attempt_and_reroutes() {
        let (handler, broker, id) = dead_lettered_setup().await;
        let mut events = handler.events.subscribe();

        let envelope = handler.requeue(&id).await.unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.attempt, 0);
        assert_eq!(envelope.status, TaskStatus::Pending);
        // Routed like a fresh submission, not back to the queue it failed in
        assert_eq!(envelope.queue_name, "mail");
        assert_eq!(envelope.priority_class, PriorityClass::High);
        assert_eq!(envelope.max_attempts, 4);

        assert!(handler.list().await.unwrap().is_empty());
        let lease = broker
            .lease("mail", "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.envelope.id, id);
        assert_eq!(lease.envelope.attempt, 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, events::TASK_REQUEUED);
    }

    #[tokio::test]
    async fn test_requeue_unroutable_stays_dead() {
        let config = BusConfig::empty().with_queue("q", QueueConfig::default());
        let router = Arc::new(Router::from_config(&config).unwrap());
        let broker = Arc::new(InMemoryBroker::new());

        let envelope = TaskEnvelope::new("legacy.task", serde_json::json!({}), "q", PriorityClass::Default);
        let id = envelope.id.clone();
        broker.enqueue(envelope).await.unwrap();
        broker.lease("q", "w", Duration::from_secs(5)).await.unwrap();
        broker.dead_letter_task(&id, "w", "boom").await.unwrap();

        let handler = DeadLetterHandler::new(broker, router, EventEmitter::new(4));
        assert!(matches!(
            handler.requeue(&id).await,
            Err(BusError::UnroutableTask(_))
        ));
        assert_eq!(handler.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discard() {
        let (handler, _broker, id) = dead_lettered_setup().await;
        handler.discard(&id).await.unwrap();
        assert!(handler.list().await.unwrap().is_empty());
        assert!(matches!(
            handler.discard(&id).await,
            Err(BusError::TaskNotFound(_))
        ));
    }
}
