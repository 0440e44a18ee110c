//! Task bus assembly
//!
//! [`TaskBus`] wires a broker, the routing table, a producer, the dead-letter
//! handler and the health monitor from one [`BusConfig`]. Worker processes
//! build their pools from it; the admin surface reads from it.

use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerOptions, InMemoryBroker, LeaseReaper};
use crate::config::BusConfig;
use crate::dlq::DeadLetterHandler;
use crate::envelope::TaskId;
use crate::error::{BusError, Result};
use crate::event::{events, BusEvent, EventEmitter};
use crate::monitor::{HealthMonitor, HealthSnapshot};
use crate::producer::{Producer, SubmitOptions};
use crate::router::Router;
use crate::storage::{LocalStorage, Storage};
use crate::worker::{HandlerRegistry, WorkerPoolBuilder};
use crate::BusStats;

/// Assembled task bus
pub struct TaskBus {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    events: EventEmitter,
    producer: Producer,
    dead_letters: DeadLetterHandler,
    monitor: Arc<HealthMonitor>,
    shutting_down: Arc<AtomicBool>,
    hosts_broker: bool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskBus {
    pub fn builder(config: BusConfig) -> TaskBusBuilder {
        TaskBusBuilder::new(config)
    }

    /// Build a bus from `config` with default wiring
    pub async fn connect(config: BusConfig) -> anyhow::Result<Self> {
        TaskBusBuilder::new(config).build().await
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn dead_letters(&self) -> &DeadLetterHandler {
        &self.dead_letters
    }

    pub fn monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Whether this process hosts the broker (reaper and monitor run here)
    pub fn hosts_broker(&self) -> bool {
        self.hosts_broker
    }

    /// Start the lease reaper and health monitor loops when the broker is
    /// hosted in this process
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if !background.is_empty() || !self.hosts_broker {
            return;
        }

        let reaper = Arc::new(LeaseReaper::new(
            self.broker(),
            self.config.reap_interval,
            self.events.clone(),
        ));
        background.push(reaper.start());
        background.push(self.monitor().start());

        tracing::info!(
            queues = self.router.queues().count(),
            reap_interval_ms = self.config.reap_interval.as_millis() as u64,
            "taskbus.bus: started"
        );
    }

    /// Route and enqueue a task
    pub async fn submit(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        self.producer.submit(task_type, payload, options).await
    }

    /// Worker pool builder preconfigured from this bus
    pub fn worker_pool(&self, registry: HandlerRegistry) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(self.broker(), self.router(), registry)
            .with_bus_config(&self.config)
            .with_events(self.events.clone())
    }

    /// Fresh health snapshot
    pub async fn health(&self) -> Result<HealthSnapshot> {
        self.monitor.sample().await
    }

    pub async fn stats(&self) -> Result<BusStats> {
        self.monitor.stats().await
    }

    /// Revoke a task
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.producer.cancel(id).await
    }

    /// Drop every pending task of `queue`; leased tasks are left alone
    pub async fn purge(&self, queue: &str, confirm: bool) -> Result<usize> {
        if self.router.queue(queue).is_none() {
            return Err(BusError::ConfigError(format!("unknown queue '{}'", queue)));
        }
        let purged = self.broker.purge(queue, confirm).await?;
        self.events.emit(BusEvent::with_fields(
            events::QUEUE_PURGED,
            [
                ("queue", serde_json::json!(queue)),
                ("purged", serde_json::json!(purged)),
            ],
        ));
        Ok(purged)
    }

    /// Stop accepting submissions and stop the background loops
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        tracing::info!("taskbus.bus: shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Builder for [`TaskBus`]
pub struct TaskBusBuilder {
    config: BusConfig,
    events: Option<EventEmitter>,
    broker: Option<Arc<dyn Broker>>,
    storage: Option<Arc<dyn Storage>>,
    broker_options: BrokerOptions,
}

impl TaskBusBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            events: None,
            broker: None,
            storage: None,
            broker_options: BrokerOptions::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Use this broker instead of connecting to `broker_url`
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Persist the in-process broker to `storage`
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_broker_options(mut self, options: BrokerOptions) -> Self {
        self.broker_options = options;
        self
    }

    /// Validate the configuration, connect and declare every queue
    pub async fn build(self) -> anyhow::Result<TaskBus> {
        self.config.validate().context("invalid bus configuration")?;
        let router = Arc::new(Router::from_config(&self.config).context("building routing table")?);
        let events = self.events.unwrap_or_default();

        let (broker, hosts_broker): (Arc<dyn Broker>, bool) = match self.broker {
            Some(broker) => (broker, true),
            None => {
                connect_broker(
                    &self.config,
                    self.storage,
                    self.broker_options.clone(),
                )
                .await?
            }
        };

        for (name, queue) in router.queues() {
            broker
                .declare_queue(name, queue.class, queue.concurrency)
                .await
                .with_context(|| format!("declaring queue '{}'", name))?;
        }

        let shutting_down = Arc::new(AtomicBool::new(false));
        let producer = Producer::new(broker.clone(), router.clone(), events.clone())
            .with_shutdown_flag(shutting_down.clone());
        let dead_letters = DeadLetterHandler::new(broker.clone(), router.clone(), events.clone());
        let monitor = Arc::new(
            HealthMonitor::with_config(broker.clone(), self.config.monitor.clone())
                .with_events(events.clone()),
        );

        tracing::info!(
            broker_url = %self.config.broker_url,
            queues = router.queues().count(),
            route_version = %router.version(),
            "taskbus.bus: connected"
        );

        Ok(TaskBus {
            config: self.config,
            broker,
            router,
            events,
            producer,
            dead_letters,
            monitor,
            shutting_down,
            hosts_broker,
            background: Mutex::new(Vec::new()),
        })
    }
}

async fn connect_broker(
    config: &BusConfig,
    storage: Option<Arc<dyn Storage>>,
    options: BrokerOptions,
) -> anyhow::Result<(Arc<dyn Broker>, bool)> {
    let url = config.broker_url.trim();

    if url == "memory" || url.starts_with("memory://") {
        let storage = match (storage, &config.data_dir) {
            (Some(storage), _) => Some(storage),
            (None, Some(dir)) => {
                let local = LocalStorage::new(dir.clone())
                    .await
                    .with_context(|| format!("opening data dir {}", dir.display()))?;
                Some(Arc::new(local) as Arc<dyn Storage>)
            }
            (None, None) => None,
        };
        let broker = match storage {
            Some(storage) => InMemoryBroker::open(options, storage)
                .await
                .context("restoring broker state")?,
            None => InMemoryBroker::with_options(options),
        };
        return Ok((Arc::new(broker), true));
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "remote")]
        {
            let broker = crate::remote::HttpBroker::new(url)?;
            return Ok((Arc::new(broker), false));
        }
        #[cfg(not(feature = "remote"))]
        anyhow::bail!("broker url '{}' needs the `remote` feature", url);
    }

    anyhow::bail!(
        "unsupported broker url '{}' (expected memory:// or http://host:port)",
        url
    )
}
