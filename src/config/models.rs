//! Configuration data structures for the gateway.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are serde-friendly and carry defaults so that minimal configs remain
//! concise; `GatewayConfig::validate` catches the mistakes serde cannot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::auth::PermitMatcher;

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_fallback_message() -> String {
    "Circuit Breaker:Service unavailable".to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    pub listen_addr: String,
    /// Liveness path answered without authorization or routing.
    pub health_path: String,
    /// Body of the 500 response served when a breaker trips.
    pub fallback_message: String,
    /// Selection strategy used for every service.
    pub load_balance: LoadBalanceStrategy,
    pub registry: RegistryConfig,
    pub service: ServiceConfig,
    pub auth: AuthConfig,
    pub breaker: BreakerSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            health_path: default_health_path(),
            fallback_message: default_fallback_message(),
            load_balance: LoadBalanceStrategy::default(),
            registry: RegistryConfig::default(),
            service: ServiceConfig::default(),
            auth: AuthConfig::default(),
            breaker: BreakerSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Sanity-check the parts serde accepts but the gateway cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|err| format!("invalid listen_addr '{}': {err}", self.listen_addr))?;
        if !self.health_path.starts_with('/') {
            return Err(format!(
                "health_path '{}' must start with '/'",
                self.health_path
            ));
        }
        if self.breaker.error_percent_threshold > 100 {
            return Err(format!(
                "breaker.error_percent_threshold {} exceeds 100",
                self.breaker.error_percent_threshold
            ));
        }
        if self.breaker.timeout_ms == 0 {
            return Err("breaker.timeout_ms must be positive".to_string());
        }
        PermitMatcher::new(&self.auth.public_paths)
            .map_err(|err| format!("invalid public path pattern: {err}"))?;
        Ok(())
    }
}

/// Load balancing strategies selectable per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    Random,
    WeightedRoundRobin,
    Shuffle,
}

/// Where to find the external service registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base address of the registry agent.
    pub address: String,
    /// Server-side hold time for watch long polls, in seconds.
    pub watch_wait_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            watch_wait_secs: 55,
        }
    }
}

/// How the gateway registers itself with the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name the gateway registers under.
    pub name: String,
    /// Stable instance id; generated as `{name}-{uuid}` when absent.
    pub instance_id: Option<String>,
    /// Address advertised to the registry.
    pub host: String,
    /// Port advertised to the registry.
    pub port: u16,
    /// Path the registry health-checks on this process.
    pub health_check_path: String,
    /// Static weight advertised for weighted selection.
    pub weight: u32,
    /// Registry-side health check cadence (registry duration syntax).
    pub check_interval: String,
    /// How long the registry keeps a critical instance before dropping it.
    pub deregister_after: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "gateway".to_string(),
            instance_id: None,
            host: "127.0.0.1".to_string(),
            port: 9090,
            health_check_path: "/health".to_string(),
            weight: 1,
            check_interval: "15s".to_string(),
            deregister_after: "30s".to_string(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Authorization prefilter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Path globs that bypass token authorization (`**` wildcard).
    pub public_paths: Vec<String>,
    /// Service name of the token-check collaborator.
    pub token_service: String,
    /// Verification endpoint on the token service.
    pub check_token_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_paths: Vec::new(),
            token_service: "oauth".to_string(),
            check_token_path: "/oauth/check_token".to_string(),
        }
    }
}

/// Circuit breaker defaults applied to every service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Wall-clock bound per guarded invocation, in milliseconds.
    pub timeout_ms: u64,
    /// Minimum calls in the window before the breaker may trip.
    pub request_volume_threshold: u32,
    /// Error percentage (0-100) at which the breaker opens.
    pub error_percent_threshold: u8,
    /// How long an open breaker waits before probing, in milliseconds.
    pub sleep_window_ms: u64,
    /// Rolling statistics window, in milliseconds.
    pub window_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            request_volume_threshold: 20,
            error_percent_threshold: 50,
            sleep_window_ms: 5000,
            window_ms: 10_000,
        }
    }
}

impl From<&BreakerSettings> for crate::core::circuit_breaker::BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        use std::time::Duration;
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            request_volume_threshold: settings.request_volume_threshold,
            error_percent_threshold: settings.error_percent_threshold,
            sleep_window: Duration::from_millis(settings.sleep_window_ms),
            window: Duration::from_millis(settings.window_ms),
        }
    }
}
