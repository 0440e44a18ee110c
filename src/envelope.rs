//! Task envelope: the unit of transport between producers and workers
//!
//! An envelope carries the task type, an opaque JSON payload and the scheduling
//! metadata the broker needs (queue, priority class, attempt counters, the
//! `not_before` gate and the current lease). The wire encoding is plain JSON so
//! that workers written against other runtimes can consume the same queues.

use crate::error::{BusError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Task identifier
pub type TaskId = String;

/// Worker identifier (lease owner)
pub type WorkerId = String;

/// Default execution ceiling before dead-lettering
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Coarse scheduling tier
///
/// Ordinal rather than numeric so producers cannot inflate priorities against
/// each other.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    High,
    #[default]
    Default,
    Low,
}

impl PriorityClass {
    /// All classes, highest first
    pub const ALL: [PriorityClass; 3] = [PriorityClass::High, PriorityClass::Default, PriorityClass::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::High => "high",
            PriorityClass::Default => "default",
            PriorityClass::Low => "low",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(PriorityClass::High),
            "default" | "normal" => Ok(PriorityClass::Default),
            "low" => Ok(PriorityClass::Low),
            other => Err(BusError::ConfigError(format!(
                "unknown priority class '{}' (expected high, default or low)",
                other
            ))),
        }
    }
}

/// Envelope lifecycle
///
/// `pending → leased → {succeeded, failed} → {pending (retried) | dead_lettered}`.
/// Transitions are monotonic except `leased → pending` (lease expiry),
/// `failed → pending` (retry) and `dead_lettered → pending` (operator requeue).
/// The broker changes status only through checked transitions on the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Leased,
    Succeeded,
    Failed,
    DeadLettered,
}

impl TaskStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Leased)
                | (Leased, Pending)
                | (Leased, Succeeded)
                | (Leased, Failed)
                | (Failed, Pending)
                | (Failed, DeadLettered)
                | (DeadLettered, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Leased => "leased",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    InFlight,
    Succeeded,
    Failed { error: String },
    Expired,
}

/// One execution attempt in the envelope's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub worker: WorkerId,
    pub leased_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Exclusive, time-boxed ownership of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub owner: WorkerId,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The transport unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub task_type: String,
    /// Opaque to the core
    pub payload: serde_json::Value,
    pub queue_name: String,
    pub priority_class: PriorityClass,
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_leased_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseInfo>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    /// Routing table revision that resolved `queue_name`
    #[serde(default)]
    pub route_version: String,
}

impl TaskEnvelope {
    /// Create a pending envelope with a fresh id, eligible immediately
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        queue_name: impl Into<String>,
        priority_class: PriorityClass,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            queue_name: queue_name.into(),
            priority_class,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            not_before: now,
            created_at: now,
            last_leased_at: None,
            status: TaskStatus::Pending,
            lease: None,
            history: Vec::new(),
            route_version: String::new(),
        }
    }

    /// Set the execution ceiling (builder pattern); clamped to at least one attempt
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay first eligibility (builder pattern)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.not_before = add_duration(self.created_at, delay);
        self
    }

    /// Set the routing revision (builder pattern)
    pub fn with_route_version(mut self, version: impl Into<String>) -> Self {
        self.route_version = version.into();
        self
    }

    /// Pending and past its `not_before` gate
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before <= now
    }

    /// No attempts left
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Time spent waiting since creation
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// Whether the current lease has outlived its visibility timeout
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.status, &self.lease) {
            (TaskStatus::Leased, Some(lease)) => lease.expires_at <= now,
            _ => false,
        }
    }

    /// Move to `next`, rejecting moves the lifecycle does not allow
    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BusError::Other(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Move `pending → leased`, consuming one attempt
    pub(crate) fn begin_attempt(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> Result<()> {
        self.transition(TaskStatus::Leased)?;
        self.attempt += 1;
        self.last_leased_at = Some(now);
        self.lease = Some(LeaseInfo {
            owner: owner.to_string(),
            leased_at: now,
            expires_at: add_duration(now, visibility_timeout),
        });
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            worker: owner.to_string(),
            leased_at: now,
            finished_at: None,
            outcome: AttemptOutcome::InFlight,
        });
        Ok(())
    }

    /// Hand out an exhausted or revoked envelope without consuming an attempt
    pub(crate) fn take_for_disposal(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        visibility_timeout: Duration,
    ) -> Result<()> {
        self.transition(TaskStatus::Leased)?;
        self.lease = Some(LeaseInfo {
            owner: owner.to_string(),
            leased_at: now,
            expires_at: add_duration(now, visibility_timeout),
        });
        Ok(())
    }

    /// Close the in-flight attempt record, if any
    pub(crate) fn close_attempt(&mut self, outcome: AttemptOutcome, now: DateTime<Utc>) {
        if let Some(record) = self
            .history
            .iter_mut()
            .rev()
            .find(|r| r.outcome == AttemptOutcome::InFlight)
        {
            record.outcome = outcome;
            record.finished_at = Some(now);
        }
    }

    /// Return to pending, eligible after `delay`; `attempt` is left untouched
    ///
    /// A failed attempt passes through `failed` on its way back.
    pub(crate) fn release(
        &mut self,
        now: DateTime<Utc>,
        delay: Duration,
        outcome: AttemptOutcome,
    ) -> Result<()> {
        if matches!(outcome, AttemptOutcome::Failed { .. }) {
            self.transition(TaskStatus::Failed)?;
        }
        self.transition(TaskStatus::Pending)?;
        self.close_attempt(outcome, now);
        self.lease = None;
        self.not_before = add_duration(now, delay);
        Ok(())
    }

    /// Move a leased envelope through `failed` into `dead_lettered`
    pub(crate) fn bury(&mut self, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.transition(TaskStatus::DeadLettered)?;
        self.close_attempt(
            AttemptOutcome::Failed {
                error: error.to_string(),
            },
            now,
        );
        self.lease = None;
        Ok(())
    }

    /// Reset for an operator requeue: fresh attempt budget, routed anew
    pub(crate) fn reset_for_requeue(
        &mut self,
        queue_name: String,
        priority_class: PriorityClass,
        route_version: String,
    ) -> Result<()> {
        self.transition(TaskStatus::Pending)?;
        let now = Utc::now();
        self.queue_name = queue_name;
        self.priority_class = priority_class;
        self.route_version = route_version;
        self.attempt = 0;
        self.lease = None;
        self.not_before = now;
        Ok(())
    }

    /// Encode to the neutral wire format
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the neutral wire format
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `t + d`, saturating at the far future
pub(crate) fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> TaskEnvelope {
        TaskEnvelope::new(
            "courses.generate_summary",
            json!({"course_id": 42}),
            "ai_content",
            PriorityClass::Default,
        )
    }

    #[test]
    fn test_new_envelope_defaults() {
        let env = envelope();
        assert_eq!(env.attempt, 0);
        assert_eq!(env.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(env.status, TaskStatus::Pending);
        assert!(env.lease.is_none());
        assert!(env.history.is_empty());
        assert!(env.is_eligible(Utc::now()));
        assert!(!env.id.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(envelope().id, envelope().id);
    }

    #[test]
    fn test_with_delay_gates_eligibility() {
        let env = envelope().with_delay(Duration::from_secs(60));
        assert!(!env.is_eligible(Utc::now()));
        assert!(env.is_eligible(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_max_attempts_clamped() {
        assert_eq!(envelope().with_max_attempts(0).max_attempts, 1);
        assert_eq!(envelope().with_max_attempts(7).max_attempts, 7);
    }

    #[test]
    fn test_begin_attempt_and_release() {
        let mut env = envelope();
        let now = Utc::now();
        env.begin_attempt("w1", now, Duration::from_secs(30)).unwrap();

        assert_eq!(env.attempt, 1);
        assert_eq!(env.status, TaskStatus::Leased);
        assert_eq!(env.lease.as_ref().unwrap().owner, "w1");
        assert_eq!(env.history.len(), 1);
        assert_eq!(env.history[0].outcome, AttemptOutcome::InFlight);
        assert!(!env.lease_expired(now));
        assert!(env.lease_expired(now + chrono::Duration::seconds(30)));

        env.release(now, Duration::from_secs(10), AttemptOutcome::Expired)
            .unwrap();
        assert_eq!(env.attempt, 1);
        assert_eq!(env.status, TaskStatus::Pending);
        assert!(env.lease.is_none());
        assert_eq!(env.history[0].outcome, AttemptOutcome::Expired);
        assert!(env.history[0].finished_at.is_some());
        assert!(!env.is_eligible(now));
        assert!(env.is_eligible(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_exhaustion() {
        let mut env = envelope().with_max_attempts(2);
        let now = Utc::now();
        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        assert!(!env.is_exhausted());
        env.release(now, Duration::ZERO, AttemptOutcome::Failed { error: "x".into() })
            .unwrap();
        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        assert!(env.is_exhausted());
    }

    #[test]
    fn test_reset_for_requeue() {
        let mut env = envelope();
        let now = Utc::now();
        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        env.bury("boom", now).unwrap();
        env.reset_for_requeue("default".into(), PriorityClass::Low, "v2".into())
            .unwrap();
        assert_eq!(env.attempt, 0);
        assert_eq!(env.status, TaskStatus::Pending);
        assert_eq!(env.queue_name, "default");
        assert_eq!(env.priority_class, PriorityClass::Low);
        assert_eq!(env.route_version, "v2");
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Leased));
        assert!(Leased.can_transition_to(Pending));
        assert!(Leased.can_transition_to(Succeeded));
        assert!(Leased.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(DeadLettered));
        assert!(DeadLettered.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!DeadLettered.can_transition_to(Leased));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Leased.can_transition_to(DeadLettered));
        assert!(!Pending.can_transition_to(DeadLettered));
        assert!(Succeeded.is_terminal());
        assert!(!Leased.is_terminal());
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let mut env = envelope();
        let err = env.transition(TaskStatus::Succeeded).unwrap_err();
        assert!(err.to_string().contains("cannot move from pending to succeeded"));
        assert_eq!(env.status, TaskStatus::Pending);

        // Pending envelopes cannot be released or buried
        let now = Utc::now();
        assert!(env.release(now, Duration::ZERO, AttemptOutcome::Expired).is_err());
        assert!(env.bury("boom", now).is_err());
        assert!(env
            .reset_for_requeue("q".into(), PriorityClass::Default, String::new())
            .is_err());
        assert_eq!(env.status, TaskStatus::Pending);

        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        assert!(env.begin_attempt("w2", now, Duration::from_secs(1)).is_err());
        assert!(env.take_for_disposal("w2", now, Duration::from_secs(1)).is_err());
        assert_eq!(env.attempt, 1);
        assert_eq!(env.lease.as_ref().unwrap().owner, "w1");
    }

    #[test]
    fn test_failed_release_passes_through_failed() {
        let mut env = envelope();
        let now = Utc::now();
        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        env.release(
            now,
            Duration::from_secs(5),
            AttemptOutcome::Failed { error: "503".into() },
        )
        .unwrap();
        assert_eq!(env.status, TaskStatus::Pending);
        assert_eq!(
            env.history[0].outcome,
            AttemptOutcome::Failed { error: "503".into() }
        );
    }

    #[test]
    fn test_bury_closes_attempt() {
        let mut env = envelope();
        let now = Utc::now();
        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        env.bury("course deleted", now).unwrap();
        assert_eq!(env.status, TaskStatus::DeadLettered);
        assert!(env.lease.is_none());
        assert_eq!(
            env.history[0].outcome,
            AttemptOutcome::Failed { error: "course deleted".into() }
        );
        assert!(env.bury("again", now).is_err());
    }

    #[test]
    fn test_take_for_disposal_keeps_attempt() {
        let mut env = envelope().with_max_attempts(1);
        let now = Utc::now();
        env.begin_attempt("w1", now, Duration::from_secs(1)).unwrap();
        env.release(now, Duration::ZERO, AttemptOutcome::Expired).unwrap();
        env.take_for_disposal("w2", now, Duration::from_secs(1)).unwrap();
        assert_eq!(env.status, TaskStatus::Leased);
        assert_eq!(env.attempt, 1);
        assert_eq!(env.history.len(), 1);
        assert_eq!(env.lease.as_ref().unwrap().owner, "w2");
    }

    #[test]
    fn test_priority_class_parse() {
        assert_eq!("HIGH".parse::<PriorityClass>().unwrap(), PriorityClass::High);
        assert_eq!("normal".parse::<PriorityClass>().unwrap(), PriorityClass::Default);
        assert_eq!("low".parse::<PriorityClass>().unwrap(), PriorityClass::Low);
        assert!("urgent".parse::<PriorityClass>().is_err());
        assert!(PriorityClass::High < PriorityClass::Low);
    }

    #[test]
    fn test_wire_encoding_is_neutral_json() {
        let mut env = envelope().with_route_version("2024.06");
        env.begin_attempt("w1", Utc::now(), Duration::from_secs(5)).unwrap();

        let bytes = env.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "leased");
        assert_eq!(value["priority_class"], "default");
        assert_eq!(value["history"][0]["outcome"], "in_flight");
        assert_eq!(value["payload"]["course_id"], 42);

        let decoded = TaskEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = TaskEnvelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn test_add_duration_saturates() {
        let now = Utc::now();
        assert_eq!(add_duration(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
