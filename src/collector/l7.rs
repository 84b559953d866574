//! L7 log routing for per-request HTTP detail

use crate::collector::data::Data;
use crate::collector::events::HttpData;
use crate::endpoint::{Endpoint, EndpointMetadata};
use crate::lookup::Lookups;
use crate::Result;
use flowscope_common::{parse_16_bytes, Tuple};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct L7Update {
    pub tuple: Option<Tuple>,
    pub src_ep: Option<Arc<Endpoint>>,
    pub dst_ep: Option<Arc<Endpoint>>,

    pub duration: u64,
    pub duration_max: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,

    pub response_code: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    pub log_type: String,
    pub domain: String,
    pub count: u64,

    pub service_name: String,
    pub service_namespace: String,
    pub service_port_name: String,
    pub service_port_num: u16,
}

/// Consumer of L7 updates. Called from the collector task, so it must not block.
pub trait L7LogReporter: Send + Sync {
    fn log(&self, update: L7Update) -> Result<()>;
}

/// Splits `host:port`; the port is 0 when absent or unparseable.
fn address_and_port(domain: &str) -> (&str, u16) {
    match domain.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (host, port.parse().unwrap_or(0))
        }
        _ => (domain, 0),
    }
}

/// `<name>.<namespace>[.svc[.cluster.local]]` to `(name, namespace)`.
fn service_name_and_namespace(addr: &str) -> Option<(&str, &str)> {
    let mut parts = addr.split('.');
    let name = parts.next()?;
    let namespace = parts.next()?;
    match parts.next() {
        None | Some("svc") => Some((name, namespace)),
        Some(_) => None,
    }
}

/// Translate one HTTP detail record into an L7 update.
///
/// `data` is absent for traffic forwarded through this node without a local
/// endpoint; the update then carries no endpoints.
pub fn build_l7_update(
    lookups: &dyn Lookups,
    hd: &HttpData,
    data: Option<&Data>,
    tuple: Tuple,
    http_data_count: u64,
) -> L7Update {
    let mut update = L7Update {
        tuple: Some(tuple),
        duration: hd.duration,
        duration_max: hd.duration_max,
        bytes_received: hd.bytes_received,
        bytes_sent: hd.bytes_sent,
        method: hd.request_method.clone(),
        path: hd.request_path.clone(),
        user_agent: hd.user_agent.clone(),
        log_type: hd.log_type.clone(),
        domain: hd.domain.clone(),
        ..L7Update::default()
    };

    if let Some(data) = data {
        update.src_ep = data.src_ep().cloned();
        update.dst_ep = data.dst_ep().cloned();
    }

    if hd.response_code != 0 {
        update.response_code = hd.response_code.to_string();
    }
    // Overflow records carry no per-request count, only the tuple total.
    update.count = if hd.count != 0 {
        hd.count
    } else {
        http_data_count
    };

    let dst_meta = EndpointMetadata::from_endpoint(update.dst_ep.as_deref(), tuple.dst);

    let (addr, mut port) = address_and_port(&hd.domain);
    if port == 0 && hd.log_type.to_lowercase().contains("http") {
        port = 80;
    }

    let mut svc_name = addr.to_string();
    let mut svc_namespace = dst_meta.namespace.clone();
    let mut svc_port_name = data
        .and_then(|d| d.dst_svc())
        .map(|s| s.port_name.clone())
        .unwrap_or_default();

    let valid = if let Some(ip) = parse_16_bytes(addr) {
        match lookups.get_service_from_pre_dnat_dest(&ip, port, tuple.proto) {
            Some(svc) => {
                svc_name = svc.name;
                svc_namespace = svc.namespace;
                svc_port_name = svc.port_name;
                true
            }
            None => false,
        }
    } else {
        if let Some((name, namespace)) = service_name_and_namespace(addr) {
            svc_name = name.to_string();
            svc_namespace = namespace.to_string();
        }
        match lookups.get_service_by_name(&svc_namespace, &svc_name, port) {
            Some(svc) => {
                svc_port_name = svc.port_name;
                true
            }
            None => false,
        }
    };

    if valid {
        update.service_name = svc_name;
        update.service_namespace = svc_namespace;
        update.service_port_name = svc_port_name;
        update.service_port_num = port;
    }
    update
}
