use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::instance::ServiceInstance;

/// Errors from the external service registry.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// The registry could not be reached or closed the connection.
    #[error("registry transport error: {0}")]
    Transport(String),

    /// The registry answered with a non-success status.
    #[error("registry rejected the request: {status} {body}")]
    Rejected { status: u16, body: String },

    /// The registry's payload could not be decoded.
    #[error("invalid registry response: {0}")]
    InvalidResponse(String),
}

/// Everything the registry needs to track one service instance.
///
/// Health checking is registry-driven: the registry polls
/// `http://{host}:{port}{health_check_path}` every `check_interval` and
/// drops the instance after `deregister_after` of critical status. Both
/// durations come from configuration.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub health_check_path: String,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub check_interval: String,
    pub deregister_after: String,
}

/// Port to the external service registry.
///
/// `fetch_instances` returns a snapshot of currently healthy instances;
/// `watch_instances` is a long poll that resolves when the service's
/// instance set changes (or the server-side wait expires), returning the
/// new list plus an index to resume from.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Register an instance. Failure here is fatal for the owning process;
    /// the caller decides whether to abort.
    async fn register(&self, registration: &ServiceRegistration) -> Result<(), RegistryError>;

    /// Remove an instance. Best-effort at shutdown.
    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Snapshot of healthy instances for `service`.
    async fn fetch_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Long-poll for changes to `service` since `last_index` (0 = from
    /// scratch). Returns the full new list and the next index.
    async fn watch_instances(
        &self,
        service: &str,
        last_index: u64,
    ) -> Result<(Vec<ServiceInstance>, u64), RegistryError>;
}
