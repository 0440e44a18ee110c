//! Queue router: resolves a task type to its destination queue
//!
//! Routing is a pure function of the routing table. Unknown task types fail
//! closed with [`BusError::UnroutableTask`]; there is no silent fallback queue.

use crate::config::{BusConfig, PriorityQueues, QueueConfig, RoutingConfig};
use crate::envelope::PriorityClass;
use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Resolved destination for a task type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub queue: String,
    /// Class of the destination queue
    pub class: PriorityClass,
    pub max_attempts: u32,
    /// Routing table revision
    pub version: String,
}

#[derive(Debug, Clone)]
struct RouteTarget {
    queue: String,
    max_attempts: Option<u32>,
}

/// Immutable routing table plus the queue catalog it points into
#[derive(Debug, Clone)]
pub struct Router {
    version: String,
    routes: HashMap<String, RouteTarget>,
    queues: BTreeMap<String, QueueConfig>,
    priority_queues: PriorityQueues,
}

impl Router {
    /// Build from a full configuration
    pub fn from_config(config: &BusConfig) -> Result<Self> {
        Self::new(&config.routing, &config.queues)
    }

    /// Build from a routing table and queue catalog, rejecting dangling references
    pub fn new(routing: &RoutingConfig, queues: &BTreeMap<String, QueueConfig>) -> Result<Self> {
        let mut routes = HashMap::with_capacity(routing.rules.len());
        for rule in &routing.rules {
            if !queues.contains_key(&rule.queue) {
                return Err(BusError::ConfigError(format!(
                    "route '{}' targets undeclared queue '{}'",
                    rule.task_type, rule.queue
                )));
            }
            let previous = routes.insert(
                rule.task_type.clone(),
                RouteTarget {
                    queue: rule.queue.clone(),
                    max_attempts: rule.max_attempts,
                },
            );
            if previous.is_some() {
                return Err(BusError::ConfigError(format!(
                    "duplicate route for task type '{}'",
                    rule.task_type
                )));
            }
        }

        for class in PriorityClass::ALL {
            if let Some(queue) = routing.priority_queues.get(class) {
                if !queues.contains_key(queue) {
                    return Err(BusError::ConfigError(format!(
                        "priority queue for '{}' is undeclared: '{}'",
                        class, queue
                    )));
                }
            }
        }

        Ok(Self {
            version: routing.version.clone(),
            routes,
            queues: queues.clone(),
            priority_queues: routing.priority_queues.clone(),
        })
    }

    /// Routing table revision
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resolve the static route for `task_type`
    pub fn route(&self, task_type: &str) -> Result<Route> {
        self.route_with(task_type, None, None)
    }

    /// Resolve a route honoring submit-time overrides.
    ///
    /// The task type must be routable even when overridden. An explicit queue
    /// wins over a priority override; a priority override lands on the queue
    /// configured for that class.
    pub fn route_with(
        &self,
        task_type: &str,
        priority_override: Option<PriorityClass>,
        queue_override: Option<&str>,
    ) -> Result<Route> {
        let target = self
            .routes
            .get(task_type)
            .ok_or_else(|| BusError::UnroutableTask(task_type.to_string()))?;

        let queue_name = match (queue_override, priority_override) {
            (Some(queue), _) => queue,
            (None, Some(class)) => self.priority_queues.get(class).ok_or_else(|| {
                BusError::UnroutableTask(format!(
                    "{} (no queue configured for priority '{}')",
                    task_type, class
                ))
            })?,
            (None, None) => target.queue.as_str(),
        };

        let queue = self.queues.get(queue_name).ok_or_else(|| {
            BusError::UnroutableTask(format!("{} (unknown queue '{}')", task_type, queue_name))
        })?;

        Ok(Route {
            queue: queue_name.to_string(),
            class: queue.class,
            max_attempts: target.max_attempts.unwrap_or(queue.max_attempts),
            version: self.version.clone(),
        })
    }

    pub fn is_routable(&self, task_type: &str) -> bool {
        self.routes.contains_key(task_type)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.get(name)
    }

    /// Declared queues in name order
    pub fn queues(&self) -> impl Iterator<Item = (&str, &QueueConfig)> {
        self.queues.iter().map(|(name, q)| (name.as_str(), q))
    }

    /// Task types whose static route lands on `queue`, sorted
    pub fn task_types_for(&self, queue: &str) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .routes
            .iter()
            .filter(|(_, target)| target.queue == queue)
            .map(|(task_type, _)| task_type.as_str())
            .collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteRule;

    fn router() -> Router {
        let mut config = BusConfig::empty()
            .with_queue("mail", QueueConfig::new(PriorityClass::High).with_max_attempts(5))
            .with_queue("reports", QueueConfig::new(PriorityClass::Low))
            .with_queue("urgent", QueueConfig::new(PriorityClass::High))
            .with_route(RouteRule::new("mail.send", "mail"))
            .with_route(RouteRule::new("mail.digest", "mail").with_max_attempts(2))
            .with_route(RouteRule::new("reports.weekly", "reports"));
        config.routing.version = "7".to_string();
        config.routing.priority_queues.high = Some("urgent".to_string());
        Router::from_config(&config).unwrap()
    }

    #[test]
    fn test_route_static() {
        let route = router().route("mail.send").unwrap();
        assert_eq!(
            route,
            Route {
                queue: "mail".into(),
                class: PriorityClass::High,
                max_attempts: 5,
                version: "7".into(),
            }
        );
    }

    #[test]
    fn test_route_rule_max_attempts_overrides_queue() {
        assert_eq!(router().route("mail.digest").unwrap().max_attempts, 2);
        assert_eq!(router().route("reports.weekly").unwrap().max_attempts, 3);
    }

    #[test]
    fn test_unknown_task_type_fails_closed() {
        let err = router().route("mail.sned").unwrap_err();
        assert!(matches!(err, BusError::UnroutableTask(ref t) if t == "mail.sned"));
        assert!(!router().is_routable("mail.sned"));
    }

    #[test]
    fn test_route_is_pure() {
        let r = router();
        assert_eq!(r.route("reports.weekly").unwrap(), r.route("reports.weekly").unwrap());
    }

    #[test]
    fn test_priority_override_uses_class_queue() {
        let route = router()
            .route_with("reports.weekly", Some(PriorityClass::High), None)
            .unwrap();
        assert_eq!(route.queue, "urgent");
        assert_eq!(route.class, PriorityClass::High);
    }

    #[test]
    fn test_priority_override_without_class_queue_fails() {
        let err = router()
            .route_with("mail.send", Some(PriorityClass::Low), None)
            .unwrap_err();
        assert!(matches!(err, BusError::UnroutableTask(_)));
    }

    #[test]
    fn test_queue_override() {
        let r = router();
        let route = r
            .route_with("mail.send", Some(PriorityClass::High), Some("reports"))
            .unwrap();
        assert_eq!(route.queue, "reports");
        assert_eq!(route.class, PriorityClass::Low);

        assert!(r.route_with("mail.send", None, Some("ghost")).is_err());
        // Overrides never make an unknown task type routable
        assert!(r.route_with("ghost.task", None, Some("mail")).is_err());
    }

    #[test]
    fn test_new_rejects_dangling_routes() {
        let config = BusConfig::empty().with_route(RouteRule::new("a", "nowhere"));
        assert!(matches!(
            Router::from_config(&config),
            Err(BusError::ConfigError(_))
        ));

        let mut config = BusConfig::empty().with_queue("q", QueueConfig::default());
        config.routing.priority_queues.low = Some("missing".into());
        assert!(Router::from_config(&config).is_err());
    }

    #[test]
    fn test_task_types_for_queue() {
        let r = router();
        assert_eq!(r.task_types_for("mail"), vec!["mail.digest", "mail.send"]);
        assert!(r.task_types_for("urgent").is_empty());
    }

    #[test]
    fn test_default_catalog_router() {
        let r = Router::from_config(&BusConfig::default()).unwrap();
        let route = r.route("courses.generate_course_summary").unwrap();
        assert_eq!(route.queue, "ai_content");
        assert_eq!(route.max_attempts, 4);
        assert_eq!(r.route("users.cleanup_expired_sessions").unwrap().queue, "system");
        assert_eq!(
            r.route_with("analytics.generate_weekly_report", Some(PriorityClass::Low), None)
                .unwrap()
                .queue,
            "bulk"
        );
    }
}
