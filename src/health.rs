use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Answer of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    /// The service is accepting traffic.
    Serving,
    /// The service is known but not accepting traffic.
    NotServing,
    /// The name is not a known service.
    ServiceUnknown,
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serving => f.write_str("SERVING"),
            Self::NotServing => f.write_str("NOT_SERVING"),
            Self::ServiceUnknown => f.write_str("SERVICE_UNKNOWN"),
        }
    }
}

/// Health status per service name. The empty name stands for the whole process.
///
/// Cloning shares the table, so a status set through one handle is seen by
/// every listener.
///
/// ```
/// use service_core::{HealthRegistry, ServingStatus};
///
/// let health = HealthRegistry::new();
/// health.set_status("encoder", ServingStatus::Serving);
/// assert_eq!(health.check("encoder"), ServingStatus::Serving);
/// assert_eq!(health.check("decoder"), ServingStatus::ServiceUnknown);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    statuses: Arc<RwLock<HashMap<String, ServingStatus>>>,
}

impl HealthRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the status of `service`.
    pub fn set_status(&self, service: &str, status: ServingStatus) {
        tracing::info!(service = %service, %status, "health status changed");
        self.statuses.write().insert(service.to_string(), status);
    }

    /// Status of `service`; unknown names answer [`ServingStatus::ServiceUnknown`].
    pub fn check(&self, service: &str) -> ServingStatus {
        self.statuses
            .read()
            .get(service)
            .copied()
            .unwrap_or(ServingStatus::ServiceUnknown)
    }

    /// Marks every known service as not serving, for graceful shutdown.
    pub fn shutdown(&self) {
        for status in self.statuses.write().values_mut() {
            *status = ServingStatus::NotServing;
        }
    }
}
