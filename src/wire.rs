//! JSON bodies of the HTTP bus protocol, shared by `server` and `remote`

use serde::{Deserialize, Serialize};

use crate::broker::ReleaseReason;
use crate::envelope::{PriorityClass, TaskId};
use crate::error::BusError;
use crate::producer::SubmitOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: SubmitOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclareQueueRequest {
    pub name: String,
    pub class: PriorityClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub queue: String,
    pub owner: String,
    pub visibility_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub id: TaskId,
    pub owner: String,
    pub delay_ms: u64,
    #[serde(flatten)]
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRequest {
    pub id: TaskId,
    pub owner: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub window_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeQuery {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub queue: String,
    pub purged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedResponse {
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimResponse {
    pub reclaimed: Vec<TaskId>,
}

/// Error body: `{ "error": kind, "message": text }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn from_error(err: &BusError) -> Self {
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Rebuild the error on the client side
    pub fn into_error(self) -> BusError {
        let message = strip_kind_prefix(&self.error, self.message);
        BusError::from_kind(&self.error, message)
    }
}

// `BusError`'s Display carries a prefix per kind; strip it so a round trip
// does not stack prefixes
fn strip_kind_prefix(kind: &str, message: String) -> String {
    let prefix = match kind {
        "broker_unavailable" => "Broker unavailable: ",
        "serialization" => "Serialization error: ",
        "unroutable_task" => "No route for task type: ",
        "handler_error" => "Handler error: ",
        "permanent_handler_error" => "Permanent handler error: ",
        "lease_expired" => "Lease expired for task: ",
        "task_not_found" => "Task not found: ",
        "config_error" => "Configuration error: ",
        "not_confirmed" => "Confirmation required: ",
        _ => "",
    };
    match message.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() => rest.to_string(),
        _ => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_release_request_flattens_reason() {
        let request = ReleaseRequest {
            id: "t1".to_string(),
            owner: "w1".to_string(),
            delay_ms: 5_000,
            reason: ReleaseReason::Failed {
                error: "boom".to_string(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["reason"], "failed");
        assert_eq!(value["error"], "boom");

        let parsed: ReleaseRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.reason, request.reason);
    }

    #[test]
    fn test_submit_request_defaults() {
        let request: SubmitRequest = serde_json::from_value(json!({"task_type": "x"})).unwrap();
        assert_eq!(request.payload, serde_json::Value::Null);
        assert_eq!(request.options, SubmitOptions::default());
    }

    #[test]
    fn test_error_body_round_trip_keeps_message() {
        let err = BusError::UnroutableTask("email.send".to_string());
        let body = ErrorBody::from_error(&err);
        assert_eq!(body.error, "unroutable_task");
        match body.into_error() {
            BusError::UnroutableTask(message) => assert_eq!(message, "email.send"),
            other => panic!("unexpected error: {other:?}"),
        }

        let timeout = ErrorBody {
            error: "timeout".to_string(),
            message: "Timed out after 1s".to_string(),
        };
        assert!(matches!(timeout.into_error(), BusError::Other(_)));
    }
}
