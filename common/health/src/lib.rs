use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of a pipeline worker.
///
/// A worker runs an admission loop plus one flush timer per batching stage.
/// The process only keeps moving data if every one of those loops is alive,
/// so each loop registers a component here and checks in more often than its
/// deadline. The process is healthy when every registered component checked
/// in recently; a component that misses its deadline is reported as stalled.
///
/// Liveness and readiness are different probes: use one registry per probe.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy.
    pub healthy: bool,
    /// Per-component status, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with the component map as body.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not checked in yet.
    Starting,
    /// Checked in, must check in again before this instant.
    HealthyUntil(OffsetDateTime),
    /// Reported a failure it cannot recover from.
    Unhealthy,
    /// Missed its check-in deadline.
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handed to a component so it can check in.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Mark the component healthy until now + deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(_) => warn!(
                component = self.component,
                "poisoned health registry lock, status not recorded"
            ),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component in `Starting` state and return its handle.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Compute the overall status. Can be used directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("{} health check failed: poisoned registry lock", self.name);
                return HealthStatus::default();
            }
        };

        let now = OffsetDateTime::now_utc();
        // No registered component yet means nothing is running.
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let observed = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(observed, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), observed);
        }

        match status.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("engine".to_string(), Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("engine"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("engine"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("batch-timer".to_string(), Duration::seconds(30));
        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() - Duration::seconds(1),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("batch-timer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn every_component_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let engine = registry.register("engine".to_string(), Duration::seconds(30));
        let timer = registry.register("batch-timer".to_string(), Duration::seconds(30));

        engine.report_healthy();
        assert!(!registry.get_status().healthy);

        timer.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
