//! HTTP surface of a hosted bus
//!
//! Serves the health endpoint, the producer and admin operations, and the
//! broker primitives that remote worker processes lease through.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as HttpRouter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::broker::{Lease, QueueSample, TaskResult, WorkerHeartbeat};
use crate::bus::TaskBus;
use crate::dlq::DeadLetter;
use crate::envelope::TaskEnvelope;
use crate::error::BusError;
use crate::monitor::{HealthSnapshot, Verdict};
use crate::router::Route;
use crate::wire::{
    DeadLetterRequest, DeclareQueueRequest, ErrorBody, LeaseRequest, PurgeQuery, PurgeResponse,
    ReclaimResponse, ReleaseRequest, RevokedResponse, StatsQuery, SubmitRequest, SubmitResponse,
    TaskRef,
};

#[derive(Clone)]
struct AppState {
    bus: Arc<TaskBus>,
}

/// Error response: `{ "error": kind, "message": text }`
pub struct ApiError(BusError);

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            BusError::UnroutableTask(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BusError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            BusError::NotConfirmed(_) | BusError::Serialization(_) => StatusCode::BAD_REQUEST,
            BusError::LeaseExpired(_) => StatusCode::CONFLICT,
            BusError::BrokerUnavailable(_) | BusError::ShutdownInProgress => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BusError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "taskbus.server: request failed");
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP router for `bus`
pub fn router(bus: Arc<TaskBus>) -> HttpRouter {
    HttpRouter::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/tasks", post(submit))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/result", get(get_result))
        .route("/tasks/{id}/cancel", post(cancel))
        .route("/queues/{name}/purge", post(purge))
        .route("/workers", get(list_workers).post(publish_heartbeat))
        .route("/dead-letters", get(list_dead_letters))
        .route(
            "/dead-letters/{id}",
            get(inspect_dead_letter).delete(discard_dead_letter),
        )
        .route("/dead-letters/{id}/requeue", post(requeue_dead_letter))
        .route("/broker/queues", post(broker_declare))
        .route("/broker/enqueue", post(broker_enqueue))
        .route("/broker/lease", post(broker_lease))
        .route("/broker/ack", post(broker_ack))
        .route("/broker/release", post(broker_release))
        .route("/broker/dead-letter", post(broker_dead_letter))
        .route("/broker/reclaim", post(broker_reclaim))
        .route("/broker/revoke", post(broker_revoke))
        .route("/broker/revoked/{id}", get(broker_is_revoked))
        .route("/broker/results", post(broker_store_result))
        .route(
            "/broker/dead-letters/{id}/requeue",
            post(broker_requeue_dead_letter),
        )
        .with_state(AppState { bus })
}

/// Serve `bus` on `listener` until `shutdown` resolves
pub async fn serve(
    bus: Arc<TaskBus>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "taskbus.server: listening");
    axum::serve(listener, router(bus))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("taskbus.server: stopped");
    Ok(())
}

// ============================================================================
// Health and stats
// ============================================================================

async fn health(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<HealthSnapshot>)> {
    let snapshot = state.bus.health().await?;
    let status = match snapshot.verdict {
        Verdict::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    Ok((status, Json(snapshot)))
}

async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Vec<QueueSample>>> {
    let window = query
        .window_secs
        .map(Duration::from_secs)
        .unwrap_or(state.bus.config().monitor.window);
    Ok(Json(state.bus.broker().stats(window).await?))
}

// ============================================================================
// Producer and admin
// ============================================================================

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let task_id = state
        .bus
        .submit(&request.task_type, request.payload, request.options)
        .await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { task_id })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskEnvelope>> {
    match state.bus.broker().get(&id).await? {
        Some(envelope) => Ok(Json(envelope)),
        None => Err(BusError::TaskNotFound(id).into()),
    }
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskResult>> {
    match state.bus.broker().result(&id).await? {
        Some(result) => Ok(Json(result)),
        None => Err(BusError::TaskNotFound(id).into()),
    }
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.bus.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn purge(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PurgeQuery>,
) -> ApiResult<Json<PurgeResponse>> {
    let purged = state.bus.purge(&name, query.confirm).await?;
    Ok(Json(PurgeResponse {
        queue: name,
        purged,
    }))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerHeartbeat>>> {
    Ok(Json(state.bus.broker().workers().await?))
}

async fn publish_heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<WorkerHeartbeat>,
) -> ApiResult<StatusCode> {
    state.bus.broker().heartbeat(heartbeat).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dead_letters(State(state): State<AppState>) -> ApiResult<Json<Vec<DeadLetter>>> {
    Ok(Json(state.bus.dead_letters().list().await?))
}

async fn inspect_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeadLetter>> {
    Ok(Json(state.bus.dead_letters().inspect(&id).await?))
}

async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.bus.dead_letters().discard(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskEnvelope>> {
    Ok(Json(state.bus.dead_letters().requeue(&id).await?))
}

// ============================================================================
// Broker primitives
// ============================================================================

async fn broker_declare(
    State(state): State<AppState>,
    Json(request): Json<DeclareQueueRequest>,
) -> ApiResult<StatusCode> {
    state
        .bus
        .broker()
        .declare_queue(&request.name, request.class, request.concurrency)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_enqueue(
    State(state): State<AppState>,
    Json(envelope): Json<TaskEnvelope>,
) -> ApiResult<StatusCode> {
    state.bus.broker().enqueue(envelope).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_lease(
    State(state): State<AppState>,
    Json(request): Json<LeaseRequest>,
) -> ApiResult<Json<Option<Lease>>> {
    let lease = state
        .bus
        .broker()
        .lease(
            &request.queue,
            &request.owner,
            Duration::from_millis(request.visibility_timeout_ms),
        )
        .await?;
    Ok(Json(lease))
}

async fn broker_ack(
    State(state): State<AppState>,
    Json(request): Json<TaskRef>,
) -> ApiResult<StatusCode> {
    state.bus.broker().acknowledge(&request.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_release(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<StatusCode> {
    state
        .bus
        .broker()
        .release(
            &request.id,
            &request.owner,
            Duration::from_millis(request.delay_ms),
            request.reason,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_dead_letter(
    State(state): State<AppState>,
    Json(request): Json<DeadLetterRequest>,
) -> ApiResult<StatusCode> {
    state
        .bus
        .broker()
        .dead_letter_task(&request.id, &request.owner, &request.error)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_reclaim(State(state): State<AppState>) -> ApiResult<Json<ReclaimResponse>> {
    let reclaimed = state.bus.broker().reclaim_expired().await?;
    Ok(Json(ReclaimResponse { reclaimed }))
}

async fn broker_revoke(
    State(state): State<AppState>,
    Json(request): Json<TaskRef>,
) -> ApiResult<StatusCode> {
    state.bus.broker().revoke(&request.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_is_revoked(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RevokedResponse>> {
    let revoked = state.bus.broker().is_revoked(&id).await?;
    Ok(Json(RevokedResponse { revoked }))
}

async fn broker_store_result(
    State(state): State<AppState>,
    Json(result): Json<TaskResult>,
) -> ApiResult<StatusCode> {
    state.bus.broker().store_result(result).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broker_requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(route): Json<Route>,
) -> ApiResult<Json<TaskEnvelope>> {
    Ok(Json(state.bus.broker().requeue_dead_letter(&id, &route).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusConfig, QueueConfig, RouteRule};
    use crate::envelope::{PriorityClass, TaskStatus};
    use crate::monitor::MonitorConfig;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn config() -> BusConfig {
        BusConfig::empty()
            .with_queue("mail", QueueConfig::new(PriorityClass::Default))
            .with_route(RouteRule::new("email.send", "mail"))
    }

    async fn app_with(config: BusConfig) -> (Arc<TaskBus>, HttpRouter) {
        let bus = Arc::new(TaskBus::connect(config).await.unwrap());
        (bus.clone(), router(bus))
    }

    async fn call(app: &HttpRouter, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    // ========================================================================
    // Health
    // ========================================================================

    #[tokio::test]
    async fn test_health_ok() {
        let (_, app) = app_with(config()).await;
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verdict"], "healthy");
        assert_eq!(body["queues"][0]["queue"], "mail");
    }

    #[tokio::test]
    async fn test_health_unhealthy_is_503() {
        let mut config = config();
        config.monitor = MonitorConfig {
            depth_ceiling: 1,
            ..MonitorConfig::default()
        };
        let (_, app) = app_with(config).await;
        for _ in 0..2 {
            call(&app, Method::POST, "/tasks", Some(json!({"task_type": "email.send"}))).await;
        }

        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["verdict"], "unhealthy");
    }

    // ========================================================================
    // Producer and admin
    // ========================================================================

    #[tokio::test]
    async fn test_submit_and_fetch() {
        let (_, app) = app_with(config()).await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/tasks",
            Some(json!({"task_type": "email.send", "payload": {"to": "x"}, "options": {"delay": "1m"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["task_id"].as_str().unwrap().to_string();

        let (status, envelope) = call(&app, Method::GET, &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["queue_name"], "mail");
        assert_eq!(envelope["status"], "pending");

        let (status, body) = call(&app, Method::GET, &format!("/tasks/{}/result", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "task_not_found");
    }

    #[tokio::test]
    async fn test_unroutable_is_422() {
        let (_, app) = app_with(config()).await;
        let (status, body) = call(&app, Method::POST, "/tasks", Some(json!({"task_type": "nope"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unroutable_task");
    }

    #[tokio::test]
    async fn test_purge_requires_confirm() {
        let (bus, app) = app_with(config()).await;
        call(&app, Method::POST, "/tasks", Some(json!({"task_type": "email.send"}))).await;

        let (status, body) = call(&app, Method::POST, "/queues/mail/purge", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "not_confirmed");

        let (status, body) = call(&app, Method::POST, "/queues/mail/purge?confirm=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["purged"], 1);
        assert_eq!(bus.stats().await.unwrap().total_pending, 0);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (bus, app) = app_with(config()).await;
        let (_, body) = call(&app, Method::POST, "/tasks", Some(json!({"task_type": "email.send"}))).await;
        let id = body["task_id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, Method::POST, &format!("/tasks/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(bus.broker().is_revoked(&id).await.unwrap());

        let (status, _) = call(&app, Method::POST, "/tasks/missing/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dead_letter_admin() {
        let (bus, app) = app_with(config()).await;
        let id = bus
            .submit("email.send", json!({}), Default::default())
            .await
            .unwrap();
        let broker = bus.broker();
        broker.lease("mail", "w1", Duration::from_secs(30)).await.unwrap();
        broker.dead_letter_task(&id, "w1", "bounced").await.unwrap();

        let (status, list) = call(&app, Method::GET, "/dead-letters", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, letter) = call(&app, Method::GET, &format!("/dead-letters/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(letter["error"], "bounced");

        let (status, envelope) =
            call(&app, Method::POST, &format!("/dead-letters/{}/requeue", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["attempt"], 0);

        let (status, _) = call(&app, Method::DELETE, &format!("/dead-letters/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ========================================================================
    // Broker primitives
    // ========================================================================

    #[tokio::test]
    async fn test_lease_release_over_http() {
        let (bus, app) = app_with(config()).await;
        let id = bus
            .submit("email.send", json!({}), Default::default())
            .await
            .unwrap();

        let (status, lease) = call(
            &app,
            Method::POST,
            "/broker/lease",
            Some(json!({"queue": "mail", "owner": "w1", "visibility_timeout_ms": 30000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lease["envelope"]["id"], id.as_str());
        assert_eq!(lease["disposition"], "execute");

        let (status, empty) = call(
            &app,
            Method::POST,
            "/broker/lease",
            Some(json!({"queue": "mail", "owner": "w1", "visibility_timeout_ms": 30000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(empty, Value::Null);

        // Someone else's lease
        let (status, body) = call(
            &app,
            Method::POST,
            "/broker/release",
            Some(json!({"id": id, "owner": "w2", "delay_ms": 0, "reason": "failed", "error": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "lease_expired");

        let (status, _) = call(
            &app,
            Method::POST,
            "/broker/release",
            Some(json!({"id": id, "owner": "w1", "delay_ms": 0, "reason": "failed", "error": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let envelope = bus.broker().get(&id).await.unwrap().unwrap();
        assert_eq!(envelope.status, TaskStatus::Pending);
        assert_eq!(envelope.attempt, 1);
    }

    #[tokio::test]
    async fn test_workers_round_trip() {
        let (_, app) = app_with(config()).await;
        let now = chrono::Utc::now();
        let heartbeat = WorkerHeartbeat {
            worker_id: "w1".to_string(),
            hostname: "host-a".to_string(),
            queues: vec!["mail".to_string()],
            slots: 4,
            active: 1,
            processed: 10,
            failed: 2,
            route_version: String::new(),
            started_at: now,
            last_seen: now,
            stopping: false,
        };

        let (status, _) = call(
            &app,
            Method::POST,
            "/workers",
            Some(serde_json::to_value(&heartbeat).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, workers) = call(&app, Method::GET, "/workers", None).await;
        assert_eq!(workers[0]["worker_id"], "w1");
        assert_eq!(workers[0]["processed"], 10);
    }
}
