use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Health reporting for the loops of the sink.
///
/// The Kafka consumer loop and every partition worker register as a component
/// and report in regularly. The process is healthy only if every registered
/// component reported healthy within its deadline. A halted partition stays
/// registered as `Halted` until the process restarts, so the liveness check
/// keeps failing and the orchestrator replays from the last committed offset.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true of all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
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
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Stopped for good, with the reason
    Halted(String),
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_halted(&self, reason: impl Into<String>) {
        self.report_status(ComponentStatus::Halted(reason.into()))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        if let Ok(mut map) = self.components.write() {
            drop(map.insert(self.component.clone(), status));
        } else {
            // Poisoned lock: just warn, the liveness checks will fail and the process restart
            warn!("poisoned health registry lock")
        }
    }

    /// Removes the component, for loops that stopped cleanly.
    pub fn deregister(&self) {
        if let Ok(mut map) = self.components.write() {
            drop(map.remove(&self.component));
        } else {
            warn!("poisoned health registry lock")
        }
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

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let now = time::OffsetDateTime::now_utc();
        let result = HealthStatus {
            healthy: !components.is_empty(), // unhealthy if no component has registered yet
            components: Default::default(),
        };
        let result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) => {
                        if until.gt(&now) {
                            drop(result.components.insert(name.clone(), status.clone()))
                        } else {
                            result.healthy = false;
                            drop(
                                result
                                    .components
                                    .insert(name.clone(), ComponentStatus::Stalled),
                            )
                        }
                    }
                    _ => {
                        result.healthy = false;
                        drop(result.components.insert(name.clone(), status.clone()))
                    }
                }
                result
            });
        match result.healthy {
            true => tracing::debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
