//! Portico - a resilient edge gateway for microservice platforms.
//!
//! Portico accepts inbound HTTP requests, authorizes them against a token
//! service, resolves the first path segment to a live backend instance
//! through a registry-backed cache, and forwards the request under a
//! per-service circuit breaker. The library exposes the building blocks so
//! the gateway can be embedded or partially reused.
//!
//! # Features
//! - Registry-backed service discovery (Consul) with a per-name instance
//!   cache and background watch subscriptions
//! - Pluggable load balancing (random, smooth weighted round robin, shuffle)
//! - Per-service circuit breaking with wall-clock timeouts and a fallback
//!   response
//! - Authorization prefilter with public-path globs and fail-closed token
//!   checks
//! - Structured tracing via `tracing`, configuration via the `config` crate
//! - Graceful shutdown with registry deregistration
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portico::{adapters::ConsulRegistry, config::GatewayConfig, core::InstanceCache};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg: GatewayConfig = portico::config::load_config("config.yaml").await?;
//! let registry = Arc::new(ConsulRegistry::new(
//!     &cfg.registry.address,
//!     std::time::Duration::from_secs(cfg.registry.watch_wait_secs),
//! )?);
//! let cache = Arc::new(InstanceCache::new(registry, CancellationToken::new()));
//! let instances = cache.discover("orders").await?;
//! # let _ = instances;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping business logic inside `core`. The binary crate in `main.rs`
//! wires the pieces together; embedders should prefer the re-exports below
//! over reaching into internal modules directly.
//!
//! # Error Handling
//! Domain errors are `thiserror` enums close to the code that raises them;
//! wiring and bootstrap paths return `eyre::Result` with context attached.
//!
//! # Concurrency & Data Structures
//! Shared mutable maps (the instance cache, the breaker registry) use
//! `scc::HashMap` for read-mostly concurrent access; exactly-once
//! initialization sequences run under a dedicated async mutex or the map's
//! entry API.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ConsulRegistry, GatewayHandler, HttpClientAdapter, OAuthTokenChecker},
    core::{BreakerRegistry, InstanceCache, ServiceInstance},
    ports::{http_client::HttpClient, registry::ServiceRegistry, token_checker::TokenChecker},
    utils::ShutdownCoordinator,
};
