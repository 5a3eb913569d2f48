//! Per-service instance cache with background registry watches.
//!
//! The request path only ever reads this cache; the registry is contacted
//! once per service name for the initial snapshot and from then on by a
//! dedicated watch task that replaces the cached list wholesale on every
//! change notification. Readers always observe a complete list.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    core::instance::ServiceInstance,
    ports::registry::{RegistryError, ServiceRegistry},
};

/// Errors surfaced by [`InstanceCache::discover`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The registry rejected or failed the initial snapshot query.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(#[source] RegistryError),
}

/// Pause between watch attempts after a registry error.
const WATCH_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Cache of healthy-instance lists keyed by service name.
///
/// Exactly one background watch task exists per name that has ever been
/// queried; the double-checked subscribe sequence in [`discover`] guarantees
/// this even when many request tasks race on an unseen name. All watch tasks
/// stop when the cache's cancellation token fires.
///
/// [`discover`]: InstanceCache::discover
pub struct InstanceCache {
    registry: Arc<dyn ServiceRegistry>,
    instances: Arc<scc::HashMap<String, Arc<Vec<ServiceInstance>>>>,
    subscribe_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl InstanceCache {
    pub fn new(registry: Arc<dyn ServiceRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            instances: Arc::new(scc::HashMap::new()),
            subscribe_lock: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    /// Return the healthy instances for `service`.
    ///
    /// A cached entry is returned immediately with no registry traffic. The
    /// first call for a name starts its watch and performs one synchronous
    /// snapshot query under the cache's subscribe lock; if that query fails
    /// an empty list is cached (so subsequent calls stay off the registry,
    /// the watch will repopulate it) and the failure is returned.
    pub async fn discover(
        &self,
        service: &str,
    ) -> Result<Arc<Vec<ServiceInstance>>, DiscoveryError> {
        if let Some(cached) = self.instances.read_async(service, |_, v| v.clone()).await {
            return Ok(cached);
        }

        let _guard = self.subscribe_lock.lock().await;
        // Re-check: another task may have subscribed while we waited.
        if let Some(cached) = self.instances.read_async(service, |_, v| v.clone()).await {
            return Ok(cached);
        }

        self.spawn_watch(service.to_string());

        match self.registry.fetch_instances(service).await {
            Ok(list) => {
                tracing::info!(
                    service,
                    instances = list.len(),
                    "bootstrapped instance cache entry"
                );
                let list = Arc::new(list);
                Self::publish(&self.instances, service, list.clone()).await;
                Ok(list)
            }
            Err(err) => {
                tracing::warn!(service, error = %err, "initial registry query failed");
                Self::publish(&self.instances, service, Arc::new(Vec::new())).await;
                Err(DiscoveryError::RegistryUnavailable(err))
            }
        }
    }

    /// Number of service names currently cached (and watched).
    pub fn watched_services(&self) -> usize {
        self.instances.len()
    }

    fn spawn_watch(&self, service: String) {
        let registry = self.registry.clone();
        let instances = self.instances.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tracing::debug!(%service, "registry watch started");
            let mut index = 0u64;
            loop {
                let watched = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = registry.watch_instances(&service, index) => result,
                };
                match watched {
                    Ok((list, next_index)) => {
                        // A blocking-query index that moves backwards means
                        // the server-side view was reset.
                        index = if next_index < index { 0 } else { next_index };
                        Self::publish(&instances, &service, Arc::new(list)).await;
                    }
                    Err(err) => {
                        tracing::warn!(%service, error = %err, "registry watch failed, re-subscribing");
                        index = 0;
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = sleep(WATCH_RETRY_PAUSE) => {}
                        }
                    }
                }
            }
            tracing::debug!(%service, "registry watch stopped");
        });
    }

    /// Replace the cached list wholesale. Readers see old or new, never a
    /// partial update.
    async fn publish(
        instances: &scc::HashMap<String, Arc<Vec<ServiceInstance>>>,
        service: &str,
        list: Arc<Vec<ServiceInstance>>,
    ) {
        match instances.entry_async(service.to_string()).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = list;
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(list);
            }
        }
    }
}
