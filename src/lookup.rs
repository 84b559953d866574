//! Read-only resolver interfaces consulted by the collector

use crate::endpoint::Endpoint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Client key used for domain lookups when per-client differentiation is off.
pub const GLOBAL_CLIENT: &str = "";

/// A service port, identified the same way the orchestrator names it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub namespace: String,
    pub name: String,
    pub port_name: String,
}

impl ServiceInfo {
    pub fn new(namespace: &str, name: &str, port_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            port_name: port_name.to_string(),
        }
    }
}

/// Endpoint, network set, node and service resolution by address.
///
/// Implementations are shared with the tasks that keep them up to date and
/// must be cheap to query from the collector's event loop.
pub trait Lookups: Send + Sync {
    fn get_endpoint(&self, addr: &[u8; 16]) -> Option<Arc<Endpoint>>;

    fn get_network_set(&self, addr: &[u8; 16]) -> Option<Arc<Endpoint>>;

    fn get_network_set_from_egress_domain(&self, domain: &str) -> Option<Arc<Endpoint>>;

    /// Service whose cluster address and port are `addr:port`.
    fn get_service_from_pre_dnat_dest(&self, addr: &[u8; 16], port: u16, proto: u8)
        -> Option<ServiceInfo>;

    /// Node name owning `addr`, if the address belongs to a node.
    fn get_node(&self, addr: &[u8; 16]) -> Option<String>;

    fn get_node_port_service(&self, port: u16, proto: u8) -> Option<ServiceInfo>;

    /// Service `namespace/name`, with the name of its port numbered `port`.
    fn get_service_by_name(&self, _namespace: &str, _name: &str, _port: u16) -> Option<ServiceInfo> {
        None
    }
}

/// DNS-derived view of which domains an address was resolved from.
pub trait EgressDomainCache: Send + Sync {
    /// A domain named in an egress policy that currently resolves to `addr`.
    fn get_watched_domain_for_ip(&self, addr: &[u8; 16]) -> Option<String>;

    /// Top level domains `client` looked up and got `addr` back for.
    fn get_top_level_domains_for_ip(&self, client: &str, addr: &[u8; 16]) -> Vec<String>;
}
