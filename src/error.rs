//! Error types for the task bus
//!
//! This module defines the error types used throughout the dispatch core.
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`BusError`] enum covers the transport and dispatch failures:
//! - Transport errors (broker unreachable, wire encoding failures)
//! - Routing errors (unknown task types are rejected at submission)
//! - Handler outcomes (transient vs. permanent business failures)
//! - Lease bookkeeping (expired or foreign leases)
//!
//! Handler code returns [`TaskError`], which the worker pool converts into a
//! [`BusError`] before handing it to the retry controller. Handler failures never
//! propagate back to the producer that submitted the task.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskbus::{BusError, SubmitOptions};
//!
//! match producer.submit("reports.weekly", payload, SubmitOptions::default()).await {
//!     Ok(id) => println!("queued {id}"),
//!     Err(BusError::UnroutableTask(task_type)) => {
//!         eprintln!("no route for '{}'", task_type);
//!     }
//!     Err(BusError::BrokerUnavailable(reason)) => {
//!         eprintln!("broker down, try again later: {}", reason);
//!     }
//!     Err(e) => eprintln!("unexpected error: {}", e),
//! }
//! ```

use thiserror::Error;

/// Task bus error type
///
/// # Variants
///
/// * `BrokerUnavailable` - The transport cannot be reached; retry the broker call, not the task
/// * `Serialization` - The payload or envelope cannot be encoded/decoded (permanent)
/// * `UnroutableTask` - No routing rule for the task type; rejected before enqueue
/// * `HandlerError` - Transient business failure, subject to retry/backoff
/// * `PermanentHandlerError` - Business logic signalled a non-retryable failure
/// * `LeaseExpired` - The lease is gone (reclaimed or never held); internal reclamation signal
/// * `TaskNotFound` - No envelope, dead letter or result with the given id
/// * `ConfigError` - Invalid configuration
/// * `NotConfirmed` - A destructive administrative call was issued without confirmation
/// * `Timeout` - A drain or wait exceeded its deadline
/// * `ShutdownInProgress` - The bus is shutting down and not accepting new work
/// * `Other` - Catch-all for unexpected errors
#[derive(Error, Debug)]
pub enum BusError {
    /// Broker transport unreachable
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No routing rule for the task type
    #[error("No route for task type: {0}")]
    UnroutableTask(String),

    /// Transient handler failure
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// Non-retryable handler failure
    #[error("Permanent handler error: {0}")]
    PermanentHandlerError(String),

    /// Lease no longer held
    #[error("Lease expired for task: {0}")]
    LeaseExpired(String),

    /// Unknown task id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Destructive operation without confirmation
    #[error("Confirmation required: {0}")]
    NotConfirmed(String),

    /// Deadline exceeded
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Shutdown in progress
    #[error("Task bus is shutting down, not accepting new work")]
    ShutdownInProgress,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl BusError {
    /// Failures that retrying cannot fix; these skip backoff and dead-letter immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BusError::Serialization(_) | BusError::PermanentHandlerError(_)
        )
    }

    /// Stable machine-readable kind, used on the wire and in CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::BrokerUnavailable(_) => "broker_unavailable",
            BusError::Serialization(_) => "serialization",
            BusError::UnroutableTask(_) => "unroutable_task",
            BusError::HandlerError(_) => "handler_error",
            BusError::PermanentHandlerError(_) => "permanent_handler_error",
            BusError::LeaseExpired(_) => "lease_expired",
            BusError::TaskNotFound(_) => "task_not_found",
            BusError::ConfigError(_) => "config_error",
            BusError::NotConfirmed(_) => "not_confirmed",
            BusError::Timeout(_) => "timeout",
            BusError::ShutdownInProgress => "shutdown_in_progress",
            BusError::Other(_) => "other",
        }
    }

    /// Rebuild an error from its wire form (`kind` + `message`).
    ///
    /// Unknown kinds collapse into `Other` so that newer servers stay readable
    /// by older clients.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "broker_unavailable" => BusError::BrokerUnavailable(message),
            "serialization" => BusError::Serialization(message),
            "unroutable_task" => BusError::UnroutableTask(message),
            "handler_error" => BusError::HandlerError(message),
            "permanent_handler_error" => BusError::PermanentHandlerError(message),
            "lease_expired" => BusError::LeaseExpired(message),
            "task_not_found" => BusError::TaskNotFound(message),
            "config_error" => BusError::ConfigError(message),
            "not_confirmed" => BusError::NotConfirmed(message),
            "shutdown_in_progress" => BusError::ShutdownInProgress,
            _ => BusError::Other(message),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

/// Result type alias using BusError
pub type Result<T> = std::result::Result<T, BusError>;

/// Outcome reported by a task handler
///
/// Handlers decide whether a failure is worth retrying. `Serialization` is
/// reserved for payloads that cannot be decoded into the handler's input type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Retry with backoff
    #[error("{0}")]
    Transient(String),

    /// Dead-letter immediately
    #[error("{0}")]
    Permanent(String),

    /// Payload could not be decoded; dead-letter immediately
    #[error("payload decode failed: {0}")]
    Serialization(String),
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        TaskError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TaskError::Permanent(message.into())
    }
}

impl From<TaskError> for BusError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Transient(msg) => BusError::HandlerError(msg),
            TaskError::Permanent(msg) => BusError::PermanentHandlerError(msg),
            TaskError::Serialization(msg) => BusError::Serialization(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_unavailable_error() {
        let error = BusError::BrokerUnavailable("connection refused".to_string());
        assert_eq!(error.to_string(), "Broker unavailable: connection refused");
    }

    #[test]
    fn test_unroutable_error() {
        let error = BusError::UnroutableTask("mail.send".to_string());
        assert_eq!(error.to_string(), "No route for task type: mail.send");
    }

    #[test]
    fn test_handler_errors() {
        let error = BusError::HandlerError("upstream 503".to_string());
        assert_eq!(error.to_string(), "Handler error: upstream 503");

        let error = BusError::PermanentHandlerError("course deleted".to_string());
        assert_eq!(error.to_string(), "Permanent handler error: course deleted");
    }

    #[test]
    fn test_timeout_error() {
        let error = BusError::Timeout(std::time::Duration::from_secs(5));
        assert_eq!(error.to_string(), "Timed out after 5s");
    }

    #[test]
    fn test_shutdown_in_progress_error() {
        let error = BusError::ShutdownInProgress;
        assert_eq!(
            error.to_string(),
            "Task bus is shutting down, not accepting new work"
        );
    }

    #[test]
    fn test_other_error() {
        let error = BusError::Other("unexpected error".to_string());
        assert_eq!(error.to_string(), "unexpected error");
    }

    #[test]
    fn test_permanent_classification() {
        assert!(BusError::Serialization("bad".into()).is_permanent());
        assert!(BusError::PermanentHandlerError("gone".into()).is_permanent());
        assert!(!BusError::HandlerError("flaky".into()).is_permanent());
        assert!(!BusError::BrokerUnavailable("down".into()).is_permanent());
        assert!(!BusError::LeaseExpired("t1".into()).is_permanent());
    }

    #[test]
    fn test_kind_survives_wire_round_trip() {
        let errors = [
            BusError::BrokerUnavailable("a".into()),
            BusError::Serialization("b".into()),
            BusError::UnroutableTask("c".into()),
            BusError::LeaseExpired("d".into()),
            BusError::TaskNotFound("e".into()),
            BusError::NotConfirmed("f".into()),
        ];
        for error in errors {
            let rebuilt = BusError::from_kind(error.kind(), "msg");
            assert_eq!(rebuilt.kind(), error.kind());
        }
        assert!(matches!(
            BusError::from_kind("something_new", "x"),
            BusError::Other(_)
        ));
    }

    #[test]
    fn test_task_error_conversion() {
        let err: BusError = TaskError::transient("retry me").into();
        assert!(matches!(err, BusError::HandlerError(ref m) if m == "retry me"));

        let err: BusError = TaskError::permanent("stop").into();
        assert!(err.is_permanent());

        let err: BusError = TaskError::Serialization("missing field".into()).into();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn test_serde_json_error_maps_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: BusError = parse.unwrap_err().into();
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn test_error_debug() {
        let error = BusError::TaskNotFound("t-1".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("TaskNotFound"));
    }
}
