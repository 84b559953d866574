//! Metric updates emitted by the collector for every report and expiry

use crate::collector::bounded_set::BoundedSet;
use crate::endpoint::Endpoint;
use crate::lookup::ServiceInfo;
use crate::rule::{RuleAction, RuleDirection, RuleId};
use flowscope_common::Tuple;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Report,
    Expire,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateType::Report => f.write_str("report"),
            UpdateType::Expire => f.write_str("expire"),
        }
    }
}

/// Deltas since the previous update for one direction of traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricValue {
    pub delta_packets: u64,
    pub delta_bytes: u64,
    pub delta_allowed_http_requests: u64,
    pub delta_denied_http_requests: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpMetric {
    pub send_congestion_wnd: u32,
    pub smooth_rtt: u32,
    pub min_rtt: u32,
    pub mss: u32,
    pub delta_total_retrans: u64,
    pub delta_lost_out: u64,
    pub delta_unrecovered_rto: u64,
}

#[derive(Debug, Clone)]
pub struct MetricUpdate {
    pub update_type: UpdateType,
    pub tuple: Tuple,
    pub nat_outgoing_port: u16,

    pub src_ep: Option<Arc<Endpoint>>,
    pub dst_ep: Option<Arc<Endpoint>>,
    pub dst_service: Option<ServiceInfo>,
    /// Pre-DNAT destination port the service was reached on.
    pub dst_service_port: u16,
    pub dst_domains: Vec<String>,

    pub rule_ids: Vec<Arc<RuleId>>,
    pub pending_rule_ids: Vec<Arc<RuleId>>,
    pub has_deny_rule: bool,
    /// Set when the update has no rule trace of its own.
    pub unknown_rule_id: Option<Arc<RuleId>>,

    pub is_connection: bool,
    pub in_metric: MetricValue,
    pub out_metric: MetricValue,
    pub orig_source_ips: Option<BoundedSet>,

    pub process_name: String,
    pub process_id: u32,
    pub process_args: String,
    pub tcp: Option<TcpMetric>,
}

impl MetricUpdate {
    pub fn new(update_type: UpdateType, tuple: Tuple) -> Self {
        Self {
            update_type,
            tuple,
            nat_outgoing_port: 0,
            src_ep: None,
            dst_ep: None,
            dst_service: None,
            dst_service_port: 0,
            dst_domains: Vec::new(),
            rule_ids: Vec::new(),
            pending_rule_ids: Vec::new(),
            has_deny_rule: false,
            unknown_rule_id: None,
            is_connection: false,
            in_metric: MetricValue::default(),
            out_metric: MetricValue::default(),
            orig_source_ips: None,
            process_name: String::new(),
            process_id: 0,
            process_args: String::new(),
            tcp: None,
        }
    }

    /// Rule that decided the flow, falling back to the unknown rule.
    pub fn last_rule_id(&self) -> Option<&Arc<RuleId>> {
        self.rule_ids.last().or(self.unknown_rule_id.as_ref())
    }

    pub fn action(&self) -> Option<RuleAction> {
        self.last_rule_id().map(|r| r.action)
    }

    pub fn direction(&self) -> Option<RuleDirection> {
        self.last_rule_id().map(|r| r.direction)
    }
}

impl fmt::Display for MetricUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = self
            .last_rule_id()
            .map(|r| r.flow_log_policy_name())
            .unwrap_or_else(|| "<none>".to_string());
        write!(
            f,
            "type={} tuple={{{}}} rule={} conn={} in={{packets={} bytes={}}} out={{packets={} bytes={}}}",
            self.update_type,
            self.tuple,
            rule,
            self.is_connection,
            self.in_metric.delta_packets,
            self.in_metric.delta_bytes,
            self.out_metric.delta_packets,
            self.out_metric.delta_bytes
        )
    }
}
