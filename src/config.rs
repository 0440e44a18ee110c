//! Bus configuration types
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `TASKBUS_*` environment variables. Durations are human readable
//! (`"30s"`, `"5m"`) both in files and in the environment.

use crate::envelope::{PriorityClass, DEFAULT_MAX_ATTEMPTS};
use crate::error::{BusError, Result};
use crate::monitor::MonitorConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable names
pub mod env_vars {
    pub const BROKER_URL: &str = "TASKBUS_BROKER_URL";
    pub const CONFIG: &str = "TASKBUS_CONFIG";
    pub const VISIBILITY_TIMEOUT: &str = "TASKBUS_VISIBILITY_TIMEOUT";
    pub const BASE_DELAY: &str = "TASKBUS_BASE_DELAY";
    pub const MAX_DELAY: &str = "TASKBUS_MAX_DELAY";
    pub const WORKER_SLOTS: &str = "TASKBUS_WORKER_SLOTS";
    pub const SLOT_BUDGET: &str = "TASKBUS_SLOT_BUDGET";
    pub const PRIORITY_WEIGHTS: &str = "TASKBUS_PRIORITY_WEIGHTS";
    pub const QUEUE_CONCURRENCY: &str = "TASKBUS_QUEUE_CONCURRENCY";
    pub const RESULT_TTL: &str = "TASKBUS_RESULT_TTL";
    pub const HEARTBEAT_INTERVAL: &str = "TASKBUS_HEARTBEAT_INTERVAL";
    pub const REAP_INTERVAL: &str = "TASKBUS_REAP_INTERVAL";
    pub const POLL_INTERVAL: &str = "TASKBUS_POLL_INTERVAL";
    pub const LISTEN: &str = "TASKBUS_LISTEN";
    pub const DATA_DIR: &str = "TASKBUS_DATA_DIR";
}

/// Per-queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Scheduling tier
    #[serde(default)]
    pub class: PriorityClass,
    /// Maximum in-flight leases across all workers (`None` = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Execution ceiling for tasks routed here
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff override; falls back to the global policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(PriorityClass::Default)
    }
}

impl QueueConfig {
    /// Create a queue configuration for the given class
    pub fn new(class: PriorityClass) -> Self {
        Self {
            class,
            concurrency: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: None,
            description: String::new(),
        }
    }

    /// Set the in-flight ceiling (builder pattern)
    pub fn with_concurrency(mut self, ceiling: usize) -> Self {
        self.concurrency = Some(ceiling);
        self
    }

    /// Set the attempt ceiling (builder pattern)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the backoff (builder pattern)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the description (builder pattern)
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Static routing rule: task type → queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRule {
    pub task_type: String,
    pub queue: String,
    /// Per task type attempt ceiling, overriding the queue's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl RouteRule {
    pub fn new(task_type: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            queue: queue.into(),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Queue that receives tasks submitted with a priority override, per class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PriorityQueues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<String>,
}

impl PriorityQueues {
    pub fn get(&self, class: PriorityClass) -> Option<&str> {
        match class {
            PriorityClass::High => self.high.as_deref(),
            PriorityClass::Default => self.default.as_deref(),
            PriorityClass::Low => self.low.as_deref(),
        }
    }
}

/// Routing table, versioned together with worker deployments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub priority_queues: PriorityQueues,
}

/// Poll weights per priority class
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PriorityWeights {
    pub high: u32,
    pub default: u32,
    pub low: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            high: 4,
            default: 2,
            low: 1,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, class: PriorityClass) -> u32 {
        match class {
            PriorityClass::High => self.high,
            PriorityClass::Default => self.default,
            PriorityClass::Low => self.low,
        }
    }

    /// Parse `high=4,default=2,low=1`; omitted classes keep their defaults
    pub fn parse(raw: &str) -> Result<Self> {
        let mut weights = Self::default();
        for (key, value) in parse_pairs(env_vars::PRIORITY_WEIGHTS, raw)? {
            let class: PriorityClass = key.parse()?;
            let weight: u32 = value.parse().map_err(|_| {
                BusError::ConfigError(format!(
                    "{}: weight for '{}' must be an integer, got '{}'",
                    env_vars::PRIORITY_WEIGHTS,
                    key,
                    value
                ))
            })?;
            match class {
                PriorityClass::High => weights.high = weight,
                PriorityClass::Default => weights.default = weight,
                PriorityClass::Low => weights.low = weight,
            }
        }
        Ok(weights)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent execution slots per process
    pub slots: usize,
    /// Sleep between empty polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Execution time after which the watchdog reports a slot
    #[serde(with = "humantime_serde")]
    pub slot_budget: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            poll_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(10),
            slot_budget: Duration::from_secs(300),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// `memory://` or `http://host:port`
    pub broker_url: String,
    /// Listen address for `taskbus serve`
    pub listen: String,
    /// Broker persistence directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Duration,
    /// Global backoff
    pub retry: RetryPolicy,
    #[serde(with = "humantime_serde")]
    pub result_ttl: Duration,
    /// Lease reclamation sweep period
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    pub weights: PriorityWeights,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
    pub queues: BTreeMap<String, QueueConfig>,
    pub routing: RoutingConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://".to_string(),
            listen: "127.0.0.1:7878".to_string(),
            data_dir: None,
            visibility_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            result_ttl: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(1),
            weights: PriorityWeights::default(),
            worker: WorkerConfig::default(),
            monitor: MonitorConfig::default(),
            queues: default_queues(),
            routing: default_routing(),
        }
    }
}

impl BusConfig {
    /// Empty catalog: no queues, no routes. Useful for embedding and tests.
    pub fn empty() -> Self {
        Self {
            queues: BTreeMap::new(),
            routing: RoutingConfig::default(),
            ..Self::default()
        }
    }

    /// Declare a queue (builder pattern)
    pub fn with_queue(mut self, name: impl Into<String>, queue: QueueConfig) -> Self {
        self.queues.insert(name.into(), queue);
        self
    }

    /// Add a routing rule (builder pattern)
    pub fn with_route(mut self, rule: RouteRule) -> Self {
        self.routing.rules.push(rule);
        self
    }

    /// Set the global backoff (builder pattern)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the worker heartbeat interval and the matching stale window (builder pattern)
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.set_heartbeat_interval(interval);
        self
    }

    fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.worker.heartbeat_interval = interval;
        self.monitor = std::mem::take(&mut self.monitor).for_heartbeat_interval(interval);
    }

    /// Set the visibility timeout (builder pattern)
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the file named by `path` (or `TASKBUS_CONFIG`), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(env_vars::CONFIG).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file; missing sections keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BusError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse TOML. Without an explicit `monitor.heartbeat_ttl` the stale
    /// window follows `worker.heartbeat_interval`.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let table: toml::Table = raw
            .parse()
            .map_err(|e| BusError::ConfigError(format!("invalid config: {}", e)))?;
        let explicit_ttl = table
            .get("monitor")
            .and_then(|monitor| monitor.get("heartbeat_ttl"))
            .is_some();

        let mut config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e| BusError::ConfigError(format!("invalid config: {}", e)))?;
        if !explicit_ttl {
            let interval = config.worker.heartbeat_interval;
            config.set_heartbeat_interval(interval);
        }
        Ok(config)
    }

    /// Overlay `TASKBUS_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        use env_vars::*;

        if let Some(url) = lookup(BROKER_URL) {
            self.broker_url = url;
        }
        if let Some(listen) = lookup(LISTEN) {
            self.listen = listen;
        }
        if let Some(dir) = lookup(DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = lookup(VISIBILITY_TIMEOUT) {
            self.visibility_timeout = parse_duration(VISIBILITY_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(BASE_DELAY) {
            self.retry.base_delay = parse_duration(BASE_DELAY, &v)?;
        }
        if let Some(v) = lookup(MAX_DELAY) {
            self.retry.max_delay = parse_duration(MAX_DELAY, &v)?;
        }
        if let Some(v) = lookup(RESULT_TTL) {
            self.result_ttl = parse_duration(RESULT_TTL, &v)?;
        }
        if let Some(v) = lookup(REAP_INTERVAL) {
            self.reap_interval = parse_duration(REAP_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(HEARTBEAT_INTERVAL) {
            self.set_heartbeat_interval(parse_duration(HEARTBEAT_INTERVAL, &v)?);
        }
        if let Some(v) = lookup(POLL_INTERVAL) {
            self.worker.poll_interval = parse_duration(POLL_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(SLOT_BUDGET) {
            self.worker.slot_budget = parse_duration(SLOT_BUDGET, &v)?;
        }
        if let Some(v) = lookup(WORKER_SLOTS) {
            self.worker.slots = v.trim().parse().map_err(|_| {
                BusError::ConfigError(format!("{}: expected a positive integer, got '{}'", WORKER_SLOTS, v))
            })?;
        }
        if let Some(v) = lookup(PRIORITY_WEIGHTS) {
            self.weights = PriorityWeights::parse(&v)?;
        }
        if let Some(v) = lookup(QUEUE_CONCURRENCY) {
            for (queue, ceiling) in parse_pairs(QUEUE_CONCURRENCY, &v)? {
                let ceiling: usize = ceiling.parse().map_err(|_| {
                    BusError::ConfigError(format!(
                        "{}: ceiling for '{}' must be an integer, got '{}'",
                        QUEUE_CONCURRENCY, queue, ceiling
                    ))
                })?;
                let entry = self.queues.get_mut(&queue).ok_or_else(|| {
                    BusError::ConfigError(format!("{}: unknown queue '{}'", QUEUE_CONCURRENCY, queue))
                })?;
                entry.concurrency = Some(ceiling);
            }
        }
        Ok(())
    }

    /// Reject configurations that would misroute or starve work
    pub fn validate(&self) -> Result<()> {
        let weights = [self.weights.high, self.weights.default, self.weights.low];
        if weights.contains(&0) {
            return Err(BusError::ConfigError(
                "priority weights must all be at least 1".to_string(),
            ));
        }
        if self.worker.slots == 0 {
            return Err(BusError::ConfigError("worker slots must be at least 1".to_string()));
        }
        validate_retry("global", &self.retry)?;

        for (name, queue) in &self.queues {
            if queue.concurrency == Some(0) {
                return Err(BusError::ConfigError(format!(
                    "queue '{}': concurrency ceiling must be at least 1",
                    name
                )));
            }
            if queue.max_attempts == 0 {
                return Err(BusError::ConfigError(format!(
                    "queue '{}': max_attempts must be at least 1",
                    name
                )));
            }
            if let Some(retry) = &queue.retry {
                validate_retry(name, retry)?;
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.routing.rules {
            if !seen.insert(rule.task_type.as_str()) {
                return Err(BusError::ConfigError(format!(
                    "duplicate route for task type '{}'",
                    rule.task_type
                )));
            }
            if !self.queues.contains_key(&rule.queue) {
                return Err(BusError::ConfigError(format!(
                    "route '{}' targets undeclared queue '{}'",
                    rule.task_type, rule.queue
                )));
            }
            if rule.max_attempts == Some(0) {
                return Err(BusError::ConfigError(format!(
                    "route '{}': max_attempts must be at least 1",
                    rule.task_type
                )));
            }
        }

        for class in PriorityClass::ALL {
            if let Some(queue) = self.routing.priority_queues.get(class) {
                if !self.queues.contains_key(queue) {
                    return Err(BusError::ConfigError(format!(
                        "priority queue for '{}' is undeclared: '{}'",
                        class, queue
                    )));
                }
            }
        }
        Ok(())
    }

    /// Backoff for a queue: its override or the global policy
    pub fn retry_for(&self, queue: &str) -> &RetryPolicy {
        self.queues
            .get(queue)
            .and_then(|q| q.retry.as_ref())
            .unwrap_or(&self.retry)
    }
}

fn validate_retry(scope: &str, retry: &RetryPolicy) -> Result<()> {
    if retry.base_delay > retry.max_delay {
        return Err(BusError::ConfigError(format!(
            "{} retry: base_delay {:?} exceeds max_delay {:?}",
            scope, retry.base_delay, retry.max_delay
        )));
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(BusError::ConfigError(format!(
            "{} retry: multiplier must be >= 1",
            scope
        )));
    }
    Ok(())
}

fn parse_duration(var: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| BusError::ConfigError(format!("{}: invalid duration '{}': {}", var, value, e)))
}

fn parse_pairs(var: &str, raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                BusError::ConfigError(format!("{}: expected key=value, got '{}'", var, part))
            })?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn backoff(base_ms: u64, cap_secs: u64) -> RetryPolicy {
    RetryPolicy::exponential(Duration::from_millis(base_ms), Duration::from_secs(cap_secs))
}

/// Built-in queue catalog
pub fn default_queues() -> BTreeMap<String, QueueConfig> {
    use PriorityClass::*;

    BTreeMap::from([
        (
            "default".to_string(),
            QueueConfig::new(Default).with_description("Catch-all queue"),
        ),
        (
            "ai_content".to_string(),
            QueueConfig::new(Default)
                .with_max_attempts(4)
                .with_retry_policy(backoff(1_000, 900))
                .with_description("AI content generation"),
        ),
        (
            "ai_assessment".to_string(),
            QueueConfig::new(High)
                .with_max_attempts(4)
                .with_retry_policy(backoff(1_000, 900))
                .with_description("AI assessment and grading"),
        ),
        (
            "ai_communication".to_string(),
            QueueConfig::new(High)
                .with_max_attempts(3)
                .with_retry_policy(backoff(500, 300))
                .with_description("AI communication and messaging"),
        ),
        (
            "notifications".to_string(),
            QueueConfig::new(High)
                .with_max_attempts(6)
                .with_retry_policy(backoff(1_000, 300))
                .with_description("Notification delivery"),
        ),
        (
            "communication".to_string(),
            QueueConfig::new(Default).with_description("Bulk mail and messaging"),
        ),
        (
            "file_processing".to_string(),
            QueueConfig::new(Default)
                .with_max_attempts(4)
                .with_retry_policy(backoff(1_000, 600))
                .with_description("File upload and processing"),
        ),
        (
            "search".to_string(),
            QueueConfig::new(Low)
                .with_max_attempts(6)
                .with_retry_policy(backoff(2_000, 600))
                .with_description("Search indexing"),
        ),
        (
            "analytics".to_string(),
            QueueConfig::new(Low)
                .with_max_attempts(4)
                .with_retry_policy(backoff(5_000, 1_800))
                .with_description("Analytics and reporting"),
        ),
        (
            "system".to_string(),
            QueueConfig::new(High)
                .with_concurrency(1)
                .with_description("Maintenance jobs"),
        ),
        (
            "urgent".to_string(),
            QueueConfig::new(High).with_description("Priority override: high"),
        ),
        (
            "bulk".to_string(),
            QueueConfig::new(Low).with_description("Priority override: low"),
        ),
    ])
}

/// Built-in routing table
pub fn default_routing() -> RoutingConfig {
    let routes = [
        ("courses.generate_course_summary", "ai_content"),
        ("courses.generate_learning_objectives", "ai_content"),
        ("courses.extract_content_from_file", "ai_content"),
        ("courses.generate_course_glossary", "ai_content"),
        ("assessments.generate_quiz_from_content", "ai_assessment"),
        ("assessments.grade_assignment_ai", "ai_assessment"),
        ("assessments.analyze_student_performance", "ai_assessment"),
        ("communications.draft_email_response", "ai_communication"),
        ("communications.analyze_email_sentiment", "ai_communication"),
        ("communications.categorize_messages", "ai_communication"),
        ("communications.send_bulk_notifications", "communication"),
        ("communications.process_pending_notifications", "notifications"),
        ("analytics.update_search_index", "search"),
        ("analytics.generate_student_insights", "analytics"),
        ("analytics.process_learning_analytics", "analytics"),
        ("analytics.generate_weekly_report", "analytics"),
        ("files.process_uploaded_file", "file_processing"),
        ("files.generate_file_preview", "file_processing"),
        ("files.convert_document", "file_processing"),
        ("users.cleanup_expired_sessions", "system"),
        ("courses.backup_course_data", "system"),
    ];

    RoutingConfig {
        version: "1".to_string(),
        rules: routes
            .into_iter()
            .map(|(task_type, queue)| RouteRule::new(task_type, queue))
            .collect(),
        priority_queues: PriorityQueues {
            high: Some("urgent".to_string()),
            default: Some("default".to_string()),
            low: Some("bulk".to_string()),
        },
    }
}
