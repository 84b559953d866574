//! Resolver state for the collector
//!
//! The watchers that track workloads, network sets, services and nodes write
//! into these maps; the collector reads them through [`Lookups`] on every
//! event. All maps are concurrent so writers never block the event loop.

use dashmap::DashMap;
use flowscope::endpoint::Endpoint;
use flowscope::lookup::{Lookups, ServiceInfo};
use flowscope_common::to_16_bytes;
use std::net::IpAddr;
use std::sync::Arc;

/// An address prefix in 16-byte form. IPv4 prefixes are IPv4-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: [u8; 16],
    prefix_len: u8,
}

impl Cidr {
    /// Parse `a.b.c.d/n`, `x::y/n` or a bare address.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, len) = match s.trim().split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s.trim(), None),
        };
        let ip: IpAddr = addr.parse().ok()?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let len = match len {
            Some(len) => len.parse::<u8>().ok()?,
            None => max,
        };
        if len > max {
            return None;
        }
        let prefix_len = if ip.is_ipv4() { len + 96 } else { len };
        Some(Self {
            network: mask(to_16_bytes(ip), prefix_len),
            prefix_len,
        })
    }

    pub fn contains(&self, addr: &[u8; 16]) -> bool {
        mask(*addr, self.prefix_len) == self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

fn mask(mut addr: [u8; 16], prefix_len: u8) -> [u8; 16] {
    let full = usize::from(prefix_len / 8);
    let rem = prefix_len % 8;
    if full < 16 {
        if rem > 0 {
            addr[full] &= 0xffu8 << (8 - rem);
            addr[full + 1..].fill(0);
        } else {
            addr[full..].fill(0);
        }
    }
    addr
}

#[derive(Debug, Clone)]
struct NetworkSetEntry {
    nets: Vec<Cidr>,
    domains: Vec<String>,
    endpoint: Arc<Endpoint>,
}

/// Thread-safe endpoint, network set, service and node index
#[derive(Clone, Default)]
pub struct EndpointCache {
    endpoints: Arc<DashMap<[u8; 16], Arc<Endpoint>>>,
    network_sets: Arc<DashMap<String, NetworkSetEntry>>,
    services: Arc<DashMap<([u8; 16], u16, u8), ServiceInfo>>,
    service_ports: Arc<DashMap<(String, String, u16), ServiceInfo>>,
    node_ports: Arc<DashMap<(u16, u8), ServiceInfo>>,
    nodes: Arc<DashMap<[u8; 16], String>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `endpoint` under each of its addresses, replacing the previous
    /// snapshot for those addresses.
    pub fn insert_endpoint(&self, addrs: &[IpAddr], endpoint: Arc<Endpoint>) {
        for addr in addrs {
            self.endpoints.insert(to_16_bytes(*addr), endpoint.clone());
        }
    }

    /// Remove every address whose endpoint has the given key.
    pub fn remove_endpoint(&self, key: &str) {
        self.endpoints.retain(|_, ep| ep.key() != key);
    }

    /// Install or replace the network set `endpoint`. Returns false when
    /// `endpoint` is not a network set.
    pub fn upsert_network_set(&self, endpoint: Arc<Endpoint>, nets: Vec<Cidr>, domains: Vec<String>) -> bool {
        if !endpoint.is_network_set() {
            return false;
        }
        let domains = domains.into_iter().map(|d| d.to_ascii_lowercase()).collect();
        self.network_sets.insert(
            endpoint.key(),
            NetworkSetEntry {
                nets,
                domains,
                endpoint,
            },
        );
        true
    }

    pub fn remove_network_set(&self, key: &str) {
        self.network_sets.remove(key);
    }

    /// Register the cluster address of a service port.
    pub fn insert_service(&self, addr: IpAddr, port: u16, proto: u8, port_num: u16, service: ServiceInfo) {
        self.service_ports.insert(
            (service.namespace.clone(), service.name.clone(), port_num),
            service.clone(),
        );
        self.services.insert((to_16_bytes(addr), port, proto), service);
    }

    pub fn insert_node_port(&self, port: u16, proto: u8, service: ServiceInfo) {
        self.node_ports.insert((port, proto), service);
    }

    /// Forget every address and port registered for `namespace/name`.
    pub fn remove_service(&self, namespace: &str, name: &str) {
        let matches = |s: &ServiceInfo| s.namespace == namespace && s.name == name;
        self.services.retain(|_, s| !matches(s));
        self.service_ports.retain(|_, s| !matches(s));
        self.node_ports.retain(|_, s| !matches(s));
    }

    pub fn insert_node(&self, addr: IpAddr, node: &str) {
        self.nodes.insert(to_16_bytes(addr), node.to_string());
    }

    pub fn remove_node(&self, node: &str) {
        self.nodes.retain(|_, n| n != node);
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn network_set_count(&self) -> usize {
        self.network_sets.len()
    }
}

impl Lookups for EndpointCache {
    fn get_endpoint(&self, addr: &[u8; 16]) -> Option<Arc<Endpoint>> {
        self.endpoints.get(addr).map(|r| r.value().clone())
    }

    /// Longest prefix match across all network sets.
    fn get_network_set(&self, addr: &[u8; 16]) -> Option<Arc<Endpoint>> {
        let mut best: Option<(u8, Arc<Endpoint>)> = None;
        for entry in self.network_sets.iter() {
            for net in entry.nets.iter().filter(|n| n.contains(addr)) {
                if best.as_ref().map_or(true, |(len, _)| net.prefix_len() > *len) {
                    best = Some((net.prefix_len(), entry.endpoint.clone()));
                }
            }
        }
        best.map(|(_, ep)| ep)
    }

    fn get_network_set_from_egress_domain(&self, domain: &str) -> Option<Arc<Endpoint>> {
        let domain = domain.to_ascii_lowercase();
        self.network_sets
            .iter()
            .find(|entry| entry.domains.iter().any(|d| *d == domain))
            .map(|entry| entry.endpoint.clone())
    }

    fn get_service_from_pre_dnat_dest(&self, addr: &[u8; 16], port: u16, proto: u8) -> Option<ServiceInfo> {
        self.services.get(&(*addr, port, proto)).map(|r| r.value().clone())
    }

    fn get_node(&self, addr: &[u8; 16]) -> Option<String> {
        self.nodes.get(addr).map(|r| r.value().clone())
    }

    fn get_node_port_service(&self, port: u16, proto: u8) -> Option<ServiceInfo> {
        self.node_ports.get(&(port, proto)).map(|r| r.value().clone())
    }

    fn get_service_by_name(&self, namespace: &str, name: &str, port: u16) -> Option<ServiceInfo> {
        self.service_ports
            .get(&(namespace.to_string(), name.to_string(), port))
            .map(|r| r.value().clone())
    }
}
