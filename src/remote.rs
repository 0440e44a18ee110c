//! Clients for a bus hosted in another process
//!
//! [`HttpBroker`] implements [`Broker`] over the HTTP surface served by
//! `taskbus serve`, so producers and worker pools in other processes share
//! one set of queues. [`AdminClient`] wraps the health and admin routes for
//! the CLI.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::broker::{Broker, Lease, QueueSample, ReleaseReason, TaskResult, WorkerHeartbeat};
use crate::dlq::DeadLetter;
use crate::envelope::{PriorityClass, TaskEnvelope, TaskId};
use crate::error::{BusError, Result};
use crate::monitor::HealthSnapshot;
use crate::producer::SubmitOptions;
use crate::router::Route;
use crate::wire::{
    DeadLetterRequest, DeclareQueueRequest, ErrorBody, LeaseRequest, PurgeResponse,
    ReclaimResponse, ReleaseRequest, RevokedResponse, SubmitRequest, SubmitResponse, TaskRef,
};

/// Per-request deadline for broker calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Transport
// ============================================================================

#[derive(Clone)]
struct Transport {
    client: Client,
    base: String,
}

impl Transport {
    fn new(url: &str, timeout: Duration) -> Result<Self> {
        let base = url.trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(BusError::ConfigError(format!(
                "broker url must be http(s)://, got '{}'",
                url
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BusError::ConfigError(format!("http client: {}", e)))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("{}: {}", self.base, e)))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from(response).await)
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.client.get(self.url(path))).await?;
        decode(response).await
    }

    /// GET where 404 means absent
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path).await {
            Ok(value) => Ok(Some(value)),
            Err(BusError::TaskNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .send(self.client.post(self.url(path)).json(body))
            .await?;
        decode(response).await
    }

    /// POST whose response body is ignored
    async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.send(self.client.post(self.url(path)).json(body))
            .await
            .map(|_| ())
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.client.post(self.url(path))).await?;
        decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.client.delete(self.url(path)))
            .await
            .map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| BusError::Serialization(format!("response body: {}", e)))
}

/// Rebuild the server's error. Server-side failures without a specific kind
/// count as the broker being unavailable so callers back off and retry.
async fn error_from(response: Response) -> BusError {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) if status.is_client_error() || body.error != "other" => body.into_error(),
        Ok(body) => BusError::BrokerUnavailable(body.message),
        Err(_) if status.is_server_error() => BusError::BrokerUnavailable(format!("HTTP {}", status)),
        Err(_) => BusError::Other(format!("HTTP {}", status)),
    }
}

// ============================================================================
// HttpBroker
// ============================================================================

/// [`Broker`] backed by a remote `taskbus serve` process
#[derive(Clone)]
pub struct HttpBroker {
    transport: Transport,
}

impl HttpBroker {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(url, timeout)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.transport.base
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn declare_queue(
        &self,
        name: &str,
        class: PriorityClass,
        concurrency: Option<usize>,
    ) -> Result<()> {
        let request = DeclareQueueRequest {
            name: name.to_string(),
            class,
            concurrency,
        };
        self.transport.post_unit("/broker/queues", &request).await
    }

    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        self.transport.post_unit("/broker/enqueue", &envelope).await
    }

    async fn lease(
        &self,
        queue: &str,
        owner: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>> {
        let request = LeaseRequest {
            queue: queue.to_string(),
            owner: owner.to_string(),
            visibility_timeout_ms: visibility_timeout.as_millis() as u64,
        };
        self.transport.post("/broker/lease", &request).await
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        let request = TaskRef { id: id.to_string() };
        self.transport.post_unit("/broker/ack", &request).await
    }

    async fn release(
        &self,
        id: &str,
        owner: &str,
        delay: Duration,
        reason: ReleaseReason,
    ) -> Result<()> {
        let request = ReleaseRequest {
            id: id.to_string(),
            owner: owner.to_string(),
            delay_ms: delay.as_millis() as u64,
            reason,
        };
        self.transport.post_unit("/broker/release", &request).await
    }

    async fn dead_letter_task(&self, id: &str, owner: &str, error: &str) -> Result<()> {
        let request = DeadLetterRequest {
            id: id.to_string(),
            owner: owner.to_string(),
            error: error.to_string(),
        };
        self.transport.post_unit("/broker/dead-letter", &request).await
    }

    async fn purge(&self, queue: &str, confirm: bool) -> Result<usize> {
        let path = format!("/queues/{}/purge?confirm={}", queue, confirm);
        let response: PurgeResponse = self.transport.post_empty(&path).await?;
        Ok(response.purged)
    }

    async fn reclaim_expired(&self) -> Result<Vec<TaskId>> {
        let response: ReclaimResponse = self.transport.post_empty("/broker/reclaim").await?;
        Ok(response.reclaimed)
    }

    async fn revoke(&self, id: &str) -> Result<()> {
        let request = TaskRef { id: id.to_string() };
        self.transport.post_unit("/broker/revoke", &request).await
    }

    async fn is_revoked(&self, id: &str) -> Result<bool> {
        let response: RevokedResponse = self
            .transport
            .get(&format!("/broker/revoked/{}", id))
            .await?;
        Ok(response.revoked)
    }

    async fn get(&self, id: &str) -> Result<Option<TaskEnvelope>> {
        self.transport.get_optional(&format!("/tasks/{}", id)).await
    }

    async fn stats(&self, window: Duration) -> Result<Vec<QueueSample>> {
        self.transport
            .get(&format!("/stats?window_secs={}", window.as_secs()))
            .await
    }

    async fn store_result(&self, result: TaskResult) -> Result<()> {
        self.transport.post_unit("/broker/results", &result).await
    }

    async fn result(&self, id: &str) -> Result<Option<TaskResult>> {
        self.transport
            .get_optional(&format!("/tasks/{}/result", id))
            .await
    }

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<()> {
        self.transport.post_unit("/workers", &heartbeat).await
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        self.transport.get("/workers").await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.transport.get("/dead-letters").await
    }

    async fn dead_letter(&self, id: &str) -> Result<Option<DeadLetter>> {
        self.transport
            .get_optional(&format!("/dead-letters/{}", id))
            .await
    }

    async fn requeue_dead_letter(&self, id: &str, route: &Route) -> Result<TaskEnvelope> {
        self.transport
            .post(&format!("/broker/dead-letters/{}/requeue", id), route)
            .await
    }

    async fn discard_dead_letter(&self, id: &str) -> Result<bool> {
        match self.transport.delete(&format!("/dead-letters/{}", id)).await {
            Ok(()) => Ok(true),
            Err(BusError::TaskNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// AdminClient
// ============================================================================

/// Health and admin operations against a remote bus
#[derive(Clone)]
pub struct AdminClient {
    transport: Transport,
}

impl AdminClient {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(url, DEFAULT_REQUEST_TIMEOUT)?,
        })
    }

    /// Health snapshot; an unhealthy bus answers 503 with the same body
    pub async fn health(&self) -> Result<HealthSnapshot> {
        let response = self
            .transport
            .client
            .get(self.transport.url("/health"))
            .send()
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("{}: {}", self.transport.base, e)))?;
        match response.status() {
            StatusCode::OK | StatusCode::SERVICE_UNAVAILABLE => decode(response).await,
            _ => Err(error_from(response).await),
        }
    }

    pub async fn stats(&self, window: Option<Duration>) -> Result<Vec<QueueSample>> {
        match window {
            Some(window) => {
                self.transport
                    .get(&format!("/stats?window_secs={}", window.as_secs()))
                    .await
            }
            None => self.transport.get("/stats").await,
        }
    }

    pub async fn submit(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        let request = SubmitRequest {
            task_type: task_type.to_string(),
            payload,
            options,
        };
        let response: SubmitResponse = self.transport.post("/tasks", &request).await?;
        Ok(response.task_id)
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.transport
            .send(
                self.transport
                    .client
                    .post(self.transport.url(&format!("/tasks/{}/cancel", id))),
            )
            .await
            .map(|_| ())
    }

    pub async fn task(&self, id: &str) -> Result<TaskEnvelope> {
        self.transport.get(&format!("/tasks/{}", id)).await
    }

    pub async fn result(&self, id: &str) -> Result<Option<TaskResult>> {
        self.transport
            .get_optional(&format!("/tasks/{}/result", id))
            .await
    }

    pub async fn purge(&self, queue: &str, confirm: bool) -> Result<usize> {
        let path = format!("/queues/{}/purge?confirm={}", queue, confirm);
        let response: PurgeResponse = self.transport.post_empty(&path).await?;
        Ok(response.purged)
    }

    pub async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        self.transport.get("/workers").await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.transport.get("/dead-letters").await
    }

    pub async fn inspect(&self, id: &str) -> Result<DeadLetter> {
        self.transport.get(&format!("/dead-letters/{}", id)).await
    }

    /// Requeue through the server's routing table
    pub async fn requeue(&self, id: &str) -> Result<TaskEnvelope> {
        self.transport
            .post_empty(&format!("/dead-letters/{}/requeue", id))
            .await
    }

    pub async fn discard(&self, id: &str) -> Result<()> {
        self.transport
            .delete(&format!("/dead-letters/{}", id))
            .await
    }
}
