//! Flow record: the collector's authoritative state for one tuple

use crate::collector::bounded_set::BoundedSet;
use crate::collector::counter::Counter;
use crate::collector::rule_trace::{RuleMatch, RuleTrace};
use crate::endpoint::{self, Endpoint};
use crate::lookup::ServiceInfo;
use crate::metric::{MetricUpdate, MetricValue, TcpMetric, UpdateType};
use crate::process::TcpStatsData;
use crate::rule::{RuleDirection, RuleId};
use flowscope_common::Tuple;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessData {
    pub name: String,
    pub pid: u32,
    pub arguments: String,
}

impl ProcessData {
    pub fn is_unset(&self) -> bool {
        self.name.is_empty() && self.pid == 0
    }
}

#[derive(Debug, Clone, Default)]
struct TcpStats {
    send_congestion_wnd: u32,
    smooth_rtt: u32,
    min_rtt: u32,
    mss: u32,
    total_retrans: Counter,
    lost_out: Counter,
    unrecovered_rto: Counter,
    dirty: bool,
}

impl TcpStats {
    fn clear_dirty_flag(&mut self) {
        self.dirty = false;
        self.total_retrans.reset_delta();
        self.lost_out.reset_delta();
        self.unrecovered_rto.reset_delta();
    }

    fn to_metric(&self) -> Option<TcpMetric> {
        if !self.dirty {
            return None;
        }
        Some(TcpMetric {
            send_congestion_wnd: self.send_congestion_wnd,
            smooth_rtt: self.smooth_rtt,
            min_rtt: self.min_rtt,
            mss: self.mss,
            delta_total_retrans: self.total_retrans.delta(),
            delta_lost_out: self.lost_out.delta(),
            delta_unrecovered_rto: self.unrecovered_rto.delta(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Data {
    pub tuple: Tuple,

    orig_source_ips: BoundedSet,
    orig_source_ips_active: bool,

    src_ep: Option<Arc<Endpoint>>,
    dst_ep: Option<Arc<Endpoint>>,
    dest_domains: Vec<String>,

    is_dnat: bool,
    pre_dnat_addr: [u8; 16],
    pre_dnat_port: u16,
    dst_svc: Option<ServiceInfo>,

    is_connection: bool,
    is_proxied: bool,
    nat_outgoing_port: u16,

    conntrack_pkts: Counter,
    conntrack_pkts_reverse: Counter,
    conntrack_bytes: Counter,
    conntrack_bytes_reverse: Counter,
    http_req_allowed: Counter,
    http_req_denied: Counter,

    source_process: ProcessData,
    dest_process: ProcessData,
    tcp_stats: TcpStats,

    pub ingress: RuleTrace,
    pub egress: RuleTrace,
    pending_ingress: Vec<Arc<RuleId>>,
    pending_egress: Vec<Arc<RuleId>>,

    updated_at: Instant,
    rule_updated_at: Instant,

    pub(crate) reported: bool,
    pub(crate) unreported_packet_info: bool,
    dirty: bool,
    expired: bool,
}

impl Data {
    pub fn new(
        tuple: Tuple,
        src_ep: Option<Arc<Endpoint>>,
        dst_ep: Option<Arc<Endpoint>>,
        max_original_ips: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            tuple,
            orig_source_ips: BoundedSet::new(max_original_ips),
            orig_source_ips_active: false,
            src_ep,
            dst_ep,
            dest_domains: Vec::new(),
            is_dnat: false,
            pre_dnat_addr: [0; 16],
            pre_dnat_port: 0,
            dst_svc: None,
            is_connection: false,
            is_proxied: false,
            nat_outgoing_port: 0,
            conntrack_pkts: Counter::default(),
            conntrack_pkts_reverse: Counter::default(),
            conntrack_bytes: Counter::default(),
            conntrack_bytes_reverse: Counter::default(),
            http_req_allowed: Counter::default(),
            http_req_denied: Counter::default(),
            source_process: ProcessData::default(),
            dest_process: ProcessData::default(),
            tcp_stats: TcpStats::default(),
            ingress: RuleTrace::new(),
            egress: RuleTrace::new(),
            pending_ingress: Vec::new(),
            pending_egress: Vec::new(),
            updated_at: now,
            rule_updated_at: now,
            reported: false,
            unreported_packet_info: false,
            dirty: true,
            expired: false,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }

    fn set_dirty_flag(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_conn_dirty_flag(&mut self) {
        self.dirty = false;
        self.http_req_allowed.reset_delta();
        self.http_req_denied.reset_delta();
        self.conntrack_pkts.reset_delta();
        self.conntrack_bytes.reset_delta();
        self.conntrack_pkts_reverse.reset_delta();
        self.conntrack_bytes_reverse.reset_delta();
    }

    /// Rule-only records are clean once both traces have been reported.
    pub(crate) fn clear_dirty_flag_if_traces_clean(&mut self) {
        if !self.ingress.is_dirty() && !self.egress.is_dirty() {
            self.dirty = false;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    pub fn is_connection(&self) -> bool {
        self.is_connection
    }

    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }

    pub fn rule_updated_at(&self) -> Instant {
        self.rule_updated_at
    }

    pub fn src_ep(&self) -> Option<&Arc<Endpoint>> {
        self.src_ep.as_ref()
    }

    pub fn dst_ep(&self) -> Option<&Arc<Endpoint>> {
        self.dst_ep.as_ref()
    }

    pub(crate) fn set_endpoints(&mut self, src: Option<Arc<Endpoint>>, dst: Option<Arc<Endpoint>>) {
        self.src_ep = src;
        self.dst_ep = dst;
    }

    /// Merge resolved endpoints, keeping the previous value on a miss.
    pub(crate) fn merge_endpoints(&mut self, src: Option<Arc<Endpoint>>, dst: Option<Arc<Endpoint>>) {
        if src.is_some() {
            self.src_ep = src;
        }
        if dst.is_some() {
            self.dst_ep = dst;
        }
    }

    pub fn dest_domains(&self) -> &[String] {
        &self.dest_domains
    }

    /// Replace the domain list only when the new one is longer.
    pub(crate) fn maybe_set_dest_domains(&mut self, domains: Vec<String>) {
        if domains.len() > self.dest_domains.len() {
            self.dest_domains = domains;
        }
    }

    pub fn is_dnat(&self) -> bool {
        self.is_dnat
    }

    /// Capture the pre-DNAT destination the first time the flow is seen DNAT'd.
    pub(crate) fn maybe_set_pre_dnat(&mut self, is_dnat: bool, pre_dnat_tuple: &Tuple) {
        if !self.is_dnat && is_dnat {
            self.is_dnat = true;
            self.pre_dnat_addr = pre_dnat_tuple.dst;
            self.pre_dnat_port = pre_dnat_tuple.dst_port;
        }
    }

    pub fn pre_dnat_addr(&self) -> &[u8; 16] {
        &self.pre_dnat_addr
    }

    pub fn pre_dnat_port(&self) -> u16 {
        self.pre_dnat_port
    }

    /// The tuple as the client addressed it; `None` unless DNAT'd.
    pub fn pre_dnat_tuple(&self) -> Option<Tuple> {
        if !self.is_dnat {
            return None;
        }
        Some(self.tuple.with_destination(self.pre_dnat_addr, self.pre_dnat_port))
    }

    pub fn dst_svc(&self) -> Option<&ServiceInfo> {
        self.dst_svc.as_ref()
    }

    pub(crate) fn set_dst_svc(&mut self, svc: Option<ServiceInfo>) {
        self.dst_svc = svc;
    }

    pub(crate) fn set_proxied(&mut self, proxied: bool) {
        self.is_proxied = proxied;
    }

    pub(crate) fn set_nat_outgoing_port(&mut self, port: u16) {
        self.nat_outgoing_port = port;
    }

    pub fn conntrack_packets(&self) -> &Counter {
        &self.conntrack_pkts
    }

    pub fn conntrack_bytes(&self) -> &Counter {
        &self.conntrack_bytes
    }

    pub fn conntrack_packets_reverse(&self) -> &Counter {
        &self.conntrack_pkts_reverse
    }

    pub fn conntrack_bytes_reverse(&self) -> &Counter {
        &self.conntrack_bytes_reverse
    }

    pub fn http_requests_allowed(&self) -> &Counter {
        &self.http_req_allowed
    }

    pub fn http_requests_denied(&self) -> &Counter {
        &self.http_req_denied
    }

    /// Apply absolute forward counters from conntrack.
    pub fn set_conntrack_counters(&mut self, packets: u64, bytes: u64) {
        let p = self.conntrack_pkts.set(packets);
        let b = self.conntrack_bytes.set(bytes);
        if p || b {
            self.set_dirty_flag();
        }
        self.is_connection = true;
        self.touch();
    }

    pub fn set_conntrack_counters_reverse(&mut self, packets: u64, bytes: u64) {
        let p = self.conntrack_pkts_reverse.set(packets);
        let b = self.conntrack_bytes_reverse.set(bytes);
        if p || b {
            self.set_dirty_flag();
        }
        self.is_connection = true;
        self.touch();
    }

    pub fn increase_http_requests_allowed(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.http_req_allowed.increase(delta);
        self.set_dirty_flag();
        self.touch();
    }

    pub fn increase_http_requests_denied(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.http_req_denied.increase(delta);
        self.set_dirty_flag();
        self.touch();
    }

    /// Flag for removal once the final report can be made.
    pub fn set_expired(&mut self) {
        self.expired = true;
        self.set_dirty_flag();
        self.touch();
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn reset_conntrack_counters(&mut self) {
        self.is_connection = false;
        self.expired = false;
        self.conntrack_pkts.reset();
        self.conntrack_bytes.reset();
        self.conntrack_pkts_reverse.reset();
        self.conntrack_bytes_reverse.reset();
    }

    pub fn reset_application_counters(&mut self) {
        self.http_req_allowed.reset();
        self.http_req_denied.reset();
    }

    pub fn reset_tcp_stats(&mut self) {
        self.tcp_stats = TcpStats::default();
    }

    /// Whether the local side(s) of the flow have a verdict.
    ///
    /// Proxied flows are seen as two legs with different tuples, so one leg
    /// having a verdict on its local side is enough.
    pub fn verdict_found(&self) -> bool {
        let src_local = endpoint::is_local(self.src_ep.as_ref());
        let dst_local = endpoint::is_local(self.dst_ep.as_ref());
        if self.is_proxied {
            (src_local && self.egress.found_verdict()) || (dst_local && self.ingress.found_verdict())
        } else {
            (!src_local || self.egress.found_verdict()) && (!dst_local || self.ingress.found_verdict())
        }
    }

    fn trace_mut(&mut self, direction: RuleDirection) -> &mut RuleTrace {
        match direction {
            RuleDirection::Ingress => &mut self.ingress,
            RuleDirection::Egress => &mut self.egress,
        }
    }

    pub fn add_rule_id(&mut self, rule_id: Arc<RuleId>, match_idx: usize, pkts: u64, bytes: u64) -> RuleMatch {
        let direction = rule_id.direction;
        let result = self
            .trace_mut(direction)
            .add_rule_id(rule_id, match_idx, pkts, bytes);
        match result {
            RuleMatch::Set => {
                self.rule_updated_at = Instant::now();
                self.touch();
                self.set_dirty_flag();
            }
            RuleMatch::Unchanged => {
                self.touch();
                self.set_dirty_flag();
            }
            RuleMatch::IsDifferent => {}
        }
        result
    }

    pub fn replace_rule_id(&mut self, rule_id: Arc<RuleId>, match_idx: usize, pkts: u64, bytes: u64) {
        let direction = rule_id.direction;
        self.trace_mut(direction)
            .replace_rule_id(rule_id, match_idx, pkts, bytes);
        self.rule_updated_at = Instant::now();
        self.touch();
        self.set_dirty_flag();
    }

    pub fn pending_rule_ids(&self, direction: RuleDirection) -> &[Arc<RuleId>] {
        match direction {
            RuleDirection::Ingress => &self.pending_ingress,
            RuleDirection::Egress => &self.pending_egress,
        }
    }

    /// Store a recomputed trace if it differs in content or order. Returns
    /// whether it was stored.
    pub fn set_pending_rule_ids(&mut self, direction: RuleDirection, rules: Vec<Arc<RuleId>>) -> bool {
        let current = match direction {
            RuleDirection::Ingress => &mut self.pending_ingress,
            RuleDirection::Egress => &mut self.pending_egress,
        };
        let same = current.len() == rules.len() && current.iter().zip(&rules).all(|(a, b)| **a == **b);
        if same {
            return false;
        }
        *current = rules;
        true
    }

    pub fn add_original_source_ips(&mut self, ips: &BoundedSet) {
        self.orig_source_ips.combine(ips);
        self.orig_source_ips_active = true;
        self.is_connection = true;
        self.touch();
        self.set_dirty_flag();
    }

    pub fn increase_num_unique_original_source_ips(&mut self, delta: usize) {
        self.orig_source_ips.increase_total_count(delta);
        self.is_connection = true;
        self.touch();
        self.set_dirty_flag();
    }

    pub fn num_unique_original_source_ips(&self) -> usize {
        self.orig_source_ips.total_count()
    }

    pub(crate) fn orig_source_ips_active(&self) -> bool {
        self.orig_source_ips_active
    }

    pub(crate) fn set_orig_source_ips_active(&mut self, active: bool) {
        self.orig_source_ips_active = active;
    }

    pub fn source_process(&self) -> &ProcessData {
        &self.source_process
    }

    pub fn dest_process(&self) -> &ProcessData {
        &self.dest_process
    }

    pub fn set_source_process(&mut self, name: &str, args: &str, pid: u32) {
        self.source_process = ProcessData {
            name: name.to_string(),
            pid,
            arguments: args.to_string(),
        };
        self.set_dirty_flag();
        self.touch();
    }

    pub fn set_dest_process(&mut self, name: &str, args: &str, pid: u32) {
        self.dest_process = ProcessData {
            name: name.to_string(),
            pid,
            arguments: args.to_string(),
        };
        self.set_dirty_flag();
        self.touch();
    }

    pub fn set_tcp_socket_stats(&mut self, stats: &TcpStatsData) {
        self.tcp_stats.send_congestion_wnd = stats.send_congestion_wnd;
        self.tcp_stats.smooth_rtt = stats.smooth_rtt;
        self.tcp_stats.min_rtt = stats.min_rtt;
        self.tcp_stats.mss = stats.mss;
        self.tcp_stats.total_retrans.set(stats.total_retrans);
        self.tcp_stats.lost_out.set(stats.lost_out);
        self.tcp_stats.unrecovered_rto.set(stats.unrecovered_rto);
        self.tcp_stats.dirty = true;
        self.set_dirty_flag();
        self.touch();
    }

    pub(crate) fn clear_tcp_dirty_flag(&mut self) {
        self.tcp_stats.clear_dirty_flag();
    }

    fn base_update(&self, update_type: UpdateType, direction: RuleDirection) -> MetricUpdate {
        let (trace, process) = match direction {
            RuleDirection::Ingress => (&self.ingress, &self.dest_process),
            RuleDirection::Egress => (&self.egress, &self.source_process),
        };
        let mut mu = MetricUpdate::new(update_type, self.tuple);
        mu.nat_outgoing_port = self.nat_outgoing_port;
        mu.src_ep = self.src_ep.clone();
        mu.dst_ep = self.dst_ep.clone();
        mu.dst_service = self.dst_svc.clone();
        mu.dst_service_port = self.pre_dnat_port;
        if direction == RuleDirection::Egress {
            mu.dst_domains = self.dest_domains.clone();
        }
        mu.rule_ids = trace.reported_rules();
        mu.pending_rule_ids = self.pending_rule_ids(direction).to_vec();
        mu.has_deny_rule = trace.has_deny_rule();
        mu.is_connection = self.is_connection;
        mu.process_name = process.name.clone();
        mu.process_id = process.pid;
        mu.process_args = process.arguments.clone();
        mu.tcp = self.tcp_stats.to_metric();
        mu
    }

    pub(crate) fn metric_update_ingress_conn(&self, update_type: UpdateType) -> MetricUpdate {
        let mut mu = self.base_update(update_type, RuleDirection::Ingress);
        mu.in_metric = MetricValue {
            delta_packets: self.conntrack_pkts.delta(),
            delta_bytes: self.conntrack_bytes.delta(),
            delta_allowed_http_requests: self.http_req_allowed.delta(),
            delta_denied_http_requests: self.http_req_denied.delta(),
        };
        mu.out_metric = MetricValue {
            delta_packets: self.conntrack_pkts_reverse.delta(),
            delta_bytes: self.conntrack_bytes_reverse.delta(),
            ..MetricValue::default()
        };
        mu
    }

    pub(crate) fn metric_update_egress_conn(&self, update_type: UpdateType) -> MetricUpdate {
        let mut mu = self.base_update(update_type, RuleDirection::Egress);
        mu.in_metric = MetricValue {
            delta_packets: self.conntrack_pkts_reverse.delta(),
            delta_bytes: self.conntrack_bytes_reverse.delta(),
            ..MetricValue::default()
        };
        mu.out_metric = MetricValue {
            delta_packets: self.conntrack_pkts.delta(),
            delta_bytes: self.conntrack_bytes.delta(),
            ..MetricValue::default()
        };
        mu
    }

    pub(crate) fn metric_update_ingress_no_conn(&self, update_type: UpdateType) -> MetricUpdate {
        let mut mu = self.base_update(update_type, RuleDirection::Ingress);
        mu.in_metric = MetricValue {
            delta_packets: self.ingress.packets().delta(),
            delta_bytes: self.ingress.bytes().delta(),
            ..MetricValue::default()
        };
        mu
    }

    pub(crate) fn metric_update_egress_no_conn(&self, update_type: UpdateType) -> MetricUpdate {
        let mut mu = self.base_update(update_type, RuleDirection::Egress);
        mu.out_metric = MetricValue {
            delta_packets: self.egress.packets().delta(),
            delta_bytes: self.egress.bytes().delta(),
            ..MetricValue::default()
        };
        mu
    }

    /// Standalone original-source-IP update. Consumes the accumulated IPs.
    ///
    /// When no ingress verdict is known the update carries the unknown rule
    /// so that consumers can still classify it; a known verdict always wins.
    pub(crate) fn metric_update_orig_source_ips(&mut self, update_type: UpdateType) -> MetricUpdate {
        let mut mu = self.base_update(update_type, RuleDirection::Ingress);
        if !self.ingress.found_verdict() {
            mu.unknown_rule_id = Some(Arc::new(RuleId::unknown()));
        }
        mu.orig_source_ips = Some(self.orig_source_ips.clone());
        self.orig_source_ips.reset();
        mu
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |ep: &Option<Arc<Endpoint>>| {
            ep.as_ref()
                .map(|e| e.display_name())
                .unwrap_or_else(|| "<unknown>".to_string())
        };
        let svc = self
            .dst_svc
            .as_ref()
            .map(|s| format!("{}.{}.{}", s.namespace, s.name, s.port_name))
            .unwrap_or_else(|| "<unknown>".to_string());
        write!(
            f,
            "tuple={{{}}}, srcEp={{{}}} dstEp={{{}}}, dstSvc={{{}}}, \
             connTrackCtr={{packets={} bytes={}}}, connTrackCtrReverse={{packets={} bytes={}}}, \
             httpPkts={{allowed={}, denied={}}}, ingressRuleTrace={{{}}} egressRuleTrace={{{}}}, \
             expired={} reported={} isDNAT={} isConnection={} \
             origSourceIPs={{ips={:?} totalCount={}}}, \
             sourceProcessInfo{{name={}, pid={}}}, destProcessInfo{{name={}, pid={}}}",
            self.tuple,
            name(&self.src_ep),
            name(&self.dst_ep),
            svc,
            self.conntrack_pkts.absolute(),
            self.conntrack_bytes.absolute(),
            self.conntrack_pkts_reverse.absolute(),
            self.conntrack_bytes_reverse.absolute(),
            self.http_req_allowed.delta(),
            self.http_req_denied.delta(),
            self.ingress,
            self.egress,
            self.expired,
            self.reported,
            self.is_dnat,
            self.is_connection,
            self.orig_source_ips.to_ips(),
            self.orig_source_ips.total_count(),
            self.source_process.name,
            self.source_process.pid,
            self.dest_process.name,
            self.dest_process.pid,
        )
    }
}
