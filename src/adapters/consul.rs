//! Consul-backed implementation of the [`ServiceRegistry`] port.
//!
//! Talks to a Consul agent over its HTTP API: service registration with an
//! agent-driven HTTP health check, deregistration, health-filtered instance
//! snapshots, and blocking queries against the health endpoint as the watch
//! mechanism (`index` + `wait` long polls keyed by `X-Consul-Index`).

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    core::instance::ServiceInstance,
    ports::registry::{RegistryError, ServiceRegistration, ServiceRegistry},
};

/// Meta key carrying an instance's RPC port, matching what services publish
/// at registration time.
const RPC_PORT_META_KEY: &str = "rpcPort";

/// Extra slack on top of the server-side wait before a long poll is
/// considered dead.
const WATCH_GRACE: Duration = Duration::from_secs(10);

pub struct ConsulRegistry {
    base_url: String,
    client: reqwest::Client,
    watch_wait: Duration,
}

impl ConsulRegistry {
    /// Create a registry client for the agent at `address`
    /// (e.g. `http://127.0.0.1:8500`). `watch_wait` is the server-side hold
    /// time for blocking queries.
    pub fn new(address: &str, watch_wait: Duration) -> Result<Self, RegistryError> {
        let base = url::Url::parse(address).map_err(|err| {
            RegistryError::Transport(format!("invalid registry address '{address}': {err}"))
        })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| RegistryError::Transport(err.to_string()))?;
        Ok(Self {
            base_url: base.as_str().trim_end_matches('/').to_string(),
            client,
            watch_wait,
        })
    }

    async fn health_query(
        &self,
        service: &str,
        blocking: Option<u64>,
    ) -> Result<(Vec<ServiceInstance>, u64), RegistryError> {
        let url = format!("{}/v1/health/service/{}", self.base_url, service);
        let mut request = self.client.get(&url).query(&[("passing", "true")]);
        if let Some(index) = blocking {
            request = request
                .query(&[("index", index.to_string())])
                .query(&[("wait", format!("{}s", self.watch_wait.as_secs()))])
                .timeout(self.watch_wait + WATCH_GRACE);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RegistryError::Transport(err.to_string()))?;

        let status = response.status();
        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|err| RegistryError::InvalidResponse(err.to_string()))?;

        let instances = entries
            .into_iter()
            .map(|entry| entry.service.into_instance())
            .collect();
        Ok((instances, index))
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn register(&self, registration: &ServiceRegistration) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let payload = AgentServiceRegistration::from(registration);

        let response = self
            .client
            .put(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| RegistryError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!(
            service = %registration.service_name,
            instance_id = %registration.instance_id,
            "registered with consul"
        );
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, instance_id
        );
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|err| RegistryError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::info!(instance_id, "deregistered from consul");
        Ok(())
    }

    async fn fetch_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let (instances, _) = self.health_query(service, None).await?;
        Ok(instances)
    }

    async fn watch_instances(
        &self,
        service: &str,
        last_index: u64,
    ) -> Result<(Vec<ServiceInstance>, u64), RegistryError> {
        self.health_query(service, Some(last_index)).await
    }
}

#[derive(Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Weights")]
    weights: AgentWeights,
    #[serde(rename = "Check")]
    check: AgentServiceCheck,
}

impl From<&ServiceRegistration> for AgentServiceRegistration {
    fn from(registration: &ServiceRegistration) -> Self {
        Self {
            id: registration.instance_id.clone(),
            name: registration.service_name.clone(),
            address: registration.host.clone(),
            port: registration.port,
            meta: registration.metadata.clone(),
            tags: registration.tags.clone(),
            weights: AgentWeights {
                passing: registration.weight,
            },
            check: AgentServiceCheck {
                http: format!(
                    "http://{}:{}{}",
                    registration.host, registration.port, registration.health_check_path
                ),
                interval: registration.check_interval.clone(),
                deregister_critical_service_after: registration.deregister_after.clone(),
            },
        }
    }
}

#[derive(Serialize)]
struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Serialize, Deserialize)]
struct AgentWeights {
    #[serde(rename = "Passing")]
    passing: u32,
}

impl Default for AgentWeights {
    fn default() -> Self {
        // Consul's default passing weight.
        Self { passing: 1 }
    }
}

#[derive(Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Deserialize)]
struct AgentService {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
    #[serde(rename = "Weights", default)]
    weights: AgentWeights,
}

impl AgentService {
    fn into_instance(self) -> ServiceInstance {
        // The RPC port rides in registration metadata; services without the
        // meta key conventionally listen one port below HTTP.
        let rpc_port = self
            .meta
            .get(RPC_PORT_META_KEY)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or_else(|| i64::from(self.port) - 1);
        let rpc_port = u16::try_from(rpc_port).ok().filter(|port| *port > 0);

        ServiceInstance {
            host: self.address,
            port: self.port,
            rpc_port,
            weight: self.weights.passing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_json(meta: serde_json::Value) -> AgentService {
        serde_json::from_value(serde_json::json!({
            "Address": "10.0.0.5",
            "Port": 8080,
            "Meta": meta,
            "Weights": {"Passing": 3, "Warning": 1}
        }))
        .unwrap()
    }

    #[test]
    fn test_instance_from_service_with_rpc_meta() {
        let service = service_json(serde_json::json!({"rpcPort": "9090"}));
        let instance = service.into_instance();
        assert_eq!(instance.host, "10.0.0.5");
        assert_eq!(instance.port, 8080);
        assert_eq!(instance.rpc_port, Some(9090));
        assert_eq!(instance.weight, 3);
    }

    #[test]
    fn test_instance_defaults_rpc_port_below_http() {
        let service = service_json(serde_json::json!({}));
        assert_eq!(service.into_instance().rpc_port, Some(8079));
    }

    #[test]
    fn test_non_positive_rpc_port_means_no_rpc() {
        let service = service_json(serde_json::json!({"rpcPort": "0"}));
        assert_eq!(service.into_instance().rpc_port, None);

        let service = service_json(serde_json::json!({"rpcPort": "-1"}));
        assert_eq!(service.into_instance().rpc_port, None);
    }

    #[test]
    fn test_missing_weights_default_to_passing_one() {
        let service: AgentService = serde_json::from_value(serde_json::json!({
            "Address": "10.0.0.5",
            "Port": 8080
        }))
        .unwrap();
        assert_eq!(service.into_instance().weight, 1);
    }

    #[test]
    fn test_registration_payload_shape() {
        let registration = ServiceRegistration {
            instance_id: "gateway-1".into(),
            service_name: "gateway".into(),
            host: "10.0.0.9".into(),
            port: 9090,
            health_check_path: "/health".into(),
            weight: 1,
            metadata: HashMap::from([("rpcPort".to_string(), "9089".to_string())]),
            tags: vec!["edge".into()],
            check_interval: "15s".into(),
            deregister_after: "30s".into(),
        };
        let payload = AgentServiceRegistration::from(&registration);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["Check"]["HTTP"], "http://10.0.0.9:9090/health");
        assert_eq!(json["Check"]["Interval"], "15s");
        assert_eq!(json["Check"]["DeregisterCriticalServiceAfter"], "30s");
        assert_eq!(json["Weights"]["Passing"], 1);
    }
}
