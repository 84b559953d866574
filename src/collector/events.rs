//! Events consumed by the collector
//!
//! These are the shapes that the conntrack reader, the rule-hit (NFLOG)
//! reader and the dataplane statistics API hand to the collector. The
//! readers themselves live outside this crate.

use crate::error::{FlowscopeError, Result};
use crate::rule::{RuleDirection, RuleId};
use flowscope_common::{parse_16_bytes, protocol, Tuple};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConntrackCounters {
    pub packets: u64,
    pub bytes: u64,
}

impl ConntrackCounters {
    pub fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }
}

/// One conntrack entry. Counters are absolute values for the lifetime of
/// the entry.
#[derive(Debug, Clone)]
pub struct ConntrackInfo {
    pub tuple: Tuple,
    pub pre_dnat_tuple: Tuple,
    pub nat_outgoing_port: u16,
    pub is_dnat: bool,
    pub is_proxy: bool,
    pub expired: bool,
    pub counters: ConntrackCounters,
    pub reply_counters: ConntrackCounters,
}

impl ConntrackInfo {
    pub fn new(tuple: Tuple, counters: ConntrackCounters, reply_counters: ConntrackCounters) -> Self {
        Self {
            tuple,
            pre_dnat_tuple: tuple,
            nat_outgoing_port: 0,
            is_dnat: false,
            is_proxy: false,
            expired: false,
            counters,
            reply_counters,
        }
    }

    pub fn with_dnat(mut self, pre_dnat_tuple: Tuple) -> Self {
        self.is_dnat = true;
        self.pre_dnat_tuple = pre_dnat_tuple;
        self
    }

    pub fn expired(mut self) -> Self {
        self.expired = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RuleHit {
    pub rule_id: Arc<RuleId>,
    pub hits: u64,
    pub bytes: u64,
}

/// Rule hits for one packet aggregate in one direction.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub tuple: Tuple,
    pub pre_dnat_tuple: Tuple,
    pub is_dnat: bool,
    pub direction: RuleDirection,
    pub rule_hits: Vec<RuleHit>,
}

impl PacketInfo {
    pub fn new(tuple: Tuple, direction: RuleDirection, rule_hits: Vec<RuleHit>) -> Self {
        Self {
            tuple,
            pre_dnat_tuple: tuple,
            is_dnat: false,
            direction,
            rule_hits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Number(i32),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticKind {
    HttpRequests,
    HttpData,
    IngressData,
    Unsupported(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relativity {
    Delta,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticAction {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistic {
    pub kind: StatisticKind,
    pub relativity: Relativity,
    pub action: StatisticAction,
    pub value: u64,
}

impl Statistic {
    pub fn delta(kind: StatisticKind, action: StatisticAction, value: u64) -> Self {
        Self {
            kind,
            relativity: Relativity::Delta,
            action,
            value,
        }
    }
}

/// Per-request detail reported by an L7 proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpData {
    pub duration: u64,
    pub duration_max: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub x_forwarded_for: String,
    pub x_real_ip: String,
    pub request_method: String,
    pub request_path: String,
    pub user_agent: String,
    pub log_type: String,
    pub domain: String,
    pub response_code: u32,
    pub count: u64,
}

/// Out-of-band statistics for one flow from the dataplane statistics API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataplaneStats {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub stats: Vec<Statistic>,
    pub http_data: Vec<HttpData>,
}

impl DataplaneStats {
    /// Flow key of these statistics.
    pub fn tuple(&self) -> Result<Tuple> {
        let proto = match &self.protocol {
            Protocol::Number(n) => u8::try_from(*n).map_err(|_| {
                FlowscopeError::MalformedStatistics(format!("unhandled protocol: {}", n))
            })?,
            Protocol::Name(name) => match name.to_lowercase().as_str() {
                "tcp" => protocol::TCP,
                "udp" => protocol::UDP,
                _ => {
                    return Err(FlowscopeError::MalformedStatistics(format!(
                        "unhandled protocol: {}",
                        name
                    )))
                }
            },
        };
        let src = parse_16_bytes(&self.src_ip).ok_or_else(|| {
            FlowscopeError::MalformedStatistics(format!("bad source IP: {}", self.src_ip))
        })?;
        let dst = parse_16_bytes(&self.dst_ip).ok_or_else(|| {
            FlowscopeError::MalformedStatistics(format!("bad destination IP: {}", self.dst_ip))
        })?;
        Ok(Tuple::new(src, dst, proto, self.src_port, self.dst_port))
    }
}
