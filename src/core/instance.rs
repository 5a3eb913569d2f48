use std::fmt;

use serde::{Deserialize, Serialize};

/// One network-reachable process implementing a service name.
///
/// Instances are produced by the registry adapter from health-check results
/// and replaced wholesale on every cache refresh. The value is immutable;
/// identity is `(host, port)`. Load-balancer scratch state is keyed by
/// [`InstanceKey`] rather than stored on the instance itself so that list
/// replacement never races with selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Reachable address of the instance.
    pub host: String,
    /// HTTP port requests are forwarded to.
    pub port: u16,
    /// Secondary RPC port, when the instance advertises one.
    pub rpc_port: Option<u16>,
    /// Static configured weight used by weighted selection.
    pub weight: u32,
}

/// Identity of an instance within a service's list.
pub type InstanceKey = (String, u16);

impl ServiceInstance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            rpc_port: None,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_rpc_port(mut self, rpc_port: Option<u16>) -> Self {
        self.rpc_port = rpc_port;
        self
    }

    /// Identity used for balancer bookkeeping.
    pub fn key(&self) -> InstanceKey {
        (self.host.clone(), self.port)
    }

    /// `host:port` authority for the forwarded request.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
