//! Per-process flow statistics kept by each aggregation entry

use crate::endpoint::FIELD_NOT_INCLUDED;
use crate::metric::{MetricUpdate, TcpMetric, UpdateType};
use flowscope_common::Tuple;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Stands for "more than one" in process name and pid fields.
pub const FIELD_AGGREGATED: &str = "*";

/// Flow identities with the NAT outgoing port last seen for each.
type TupleRefs = BTreeMap<Tuple, u16>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowReportedStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub http_requests_allowed_in: u64,
    pub http_requests_denied_in: u64,
    pub num_flows: u64,
    pub num_flows_started: u64,
    pub num_flows_completed: u64,
}

impl FlowReportedStats {
    pub fn add(&mut self, other: &FlowReportedStats) {
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.http_requests_allowed_in += other.http_requests_allowed_in;
        self.http_requests_denied_in += other.http_requests_denied_in;
        self.num_flows += other.num_flows;
        self.num_flows_started += other.num_flows_started;
        self.num_flows_completed += other.num_flows_completed;
    }

    fn add_deltas(&mut self, update: &MetricUpdate) {
        self.packets_in += update.in_metric.delta_packets;
        self.bytes_in += update.in_metric.delta_bytes;
        self.packets_out += update.out_metric.delta_packets;
        self.bytes_out += update.out_metric.delta_bytes;
        self.http_requests_allowed_in += update.in_metric.delta_allowed_http_requests;
        self.http_requests_denied_in += update.in_metric.delta_denied_http_requests;
    }

    /// Add traffic counters only; flow counts are derived from references.
    fn add_traffic(&mut self, other: &FlowReportedStats) {
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.http_requests_allowed_in += other.http_requests_allowed_in;
        self.http_requests_denied_in += other.http_requests_denied_in;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpWnd {
    pub mean: u64,
    pub min: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpRtt {
    pub mean: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpMss {
    pub mean: u64,
    pub min: u64,
}

/// Running means and extremes of socket statistics. `count` is the number
/// of samples folded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowReportedTcpStats {
    #[serde(rename = "tcp_samples")]
    pub count: u64,
    pub send_congestion_wnd: TcpWnd,
    pub smooth_rtt: TcpRtt,
    pub min_rtt: TcpRtt,
    pub mss: TcpMss,
    pub total_retrans: u64,
    pub lost_out: u64,
    pub unrecovered_rto: u64,
}

fn weighted_mean(mean: u64, count: u64, other_mean: u64, other_count: u64) -> u64 {
    (mean * count + other_mean * other_count) / (count + other_count)
}

impl FlowReportedTcpStats {
    fn from_sample(tcp: &TcpMetric) -> Self {
        let cwnd = u64::from(tcp.send_congestion_wnd);
        let srtt = u64::from(tcp.smooth_rtt);
        let min_rtt = u64::from(tcp.min_rtt);
        let mss = u64::from(tcp.mss);
        Self {
            count: 1,
            send_congestion_wnd: TcpWnd { mean: cwnd, min: cwnd },
            smooth_rtt: TcpRtt { mean: srtt, max: srtt },
            min_rtt: TcpRtt {
                mean: min_rtt,
                max: min_rtt,
            },
            mss: TcpMss { mean: mss, min: mss },
            total_retrans: tcp.delta_total_retrans,
            lost_out: tcp.delta_lost_out,
            unrecovered_rto: tcp.delta_unrecovered_rto,
        }
    }

    pub fn aggregate(&mut self, tcp: &TcpMetric) {
        self.add(&Self::from_sample(tcp));
    }

    pub fn add(&mut self, other: &FlowReportedTcpStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let (n, m) = (self.count, other.count);

        self.send_congestion_wnd.min = self.send_congestion_wnd.min.min(other.send_congestion_wnd.min);
        self.send_congestion_wnd.mean =
            weighted_mean(self.send_congestion_wnd.mean, n, other.send_congestion_wnd.mean, m);

        self.smooth_rtt.max = self.smooth_rtt.max.max(other.smooth_rtt.max);
        self.smooth_rtt.mean = weighted_mean(self.smooth_rtt.mean, n, other.smooth_rtt.mean, m);

        self.min_rtt.max = self.min_rtt.max.max(other.min_rtt.max);
        self.min_rtt.mean = weighted_mean(self.min_rtt.mean, n, other.min_rtt.mean, m);

        self.mss.min = self.mss.min.min(other.mss.min);
        self.mss.mean = weighted_mean(self.mss.mean, n, other.mss.mean, m);

        self.total_retrans += other.total_retrans;
        self.lost_out += other.lost_out;
        self.unrecovered_rto += other.unrecovered_rto;
        self.count += other.count;
    }
}

/// Statistics of one process (or of all traffic when processes are not
/// tracked) within one aggregation entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlowStats {
    pub(crate) reported: FlowReportedStats,
    pub(crate) tcp: FlowReportedTcpStats,
    /// Flows started within the interval.
    started: TupleRefs,
    /// Flows completed within the interval.
    completed: TupleRefs,
    /// Flows currently open.
    active: TupleRefs,
    /// Flows seen at any point within the interval.
    refs: TupleRefs,
    process_ids: BTreeSet<u32>,
    process_args: BTreeSet<String>,
    reset_process_ids: bool,
}

impl FlowStats {
    fn new(update: &MetricUpdate, process: &ProcessKey) -> Self {
        let mut stats = Self::default();
        stats.aggregate(update, process);
        stats
    }

    fn aggregate(&mut self, update: &MetricUpdate, process: &ProcessKey) {
        if self.reset_process_ids {
            self.process_ids.clear();
            self.process_args.clear();
            self.reset_process_ids = false;
        }

        let tuple = update.tuple;
        let port = update.nat_outgoing_port;
        match update.update_type {
            UpdateType::Report => {
                // A flow only counts as started the first time it becomes active.
                if !self.active.contains_key(&tuple) || self.started.contains_key(&tuple) {
                    self.started.insert(tuple, port);
                }
                self.active.insert(tuple, port);
            }
            UpdateType::Expire => {
                self.completed.insert(tuple, port);
                self.active.remove(&tuple);
            }
        }
        self.refs.insert(tuple, port);

        self.process_ids.insert(process.pid);
        if !process.args.is_empty() {
            self.process_args.insert(process.args.clone());
        }

        self.refresh_flow_counts();
        self.reported.add_deltas(update);
        if let Some(tcp) = &update.tcp {
            self.tcp.aggregate(tcp);
        }
    }

    /// Fold `other` into this entry without counting any flow twice.
    fn merge(&mut self, other: FlowStats) {
        if self.reset_process_ids {
            self.process_ids.clear();
            self.process_args.clear();
            self.reset_process_ids = false;
        }
        // Flows open in `other` since an earlier interval did not start now.
        for tuple in other.active.keys() {
            if !other.started.contains_key(tuple) {
                self.started.remove(tuple);
            }
        }
        self.started.extend(other.started);
        self.completed.extend(other.completed);
        self.refs.extend(other.refs);
        for (tuple, port) in other.active {
            if !self.completed.contains_key(&tuple) {
                self.active.insert(tuple, port);
            }
        }
        self.process_ids.extend(other.process_ids);
        self.process_args.extend(other.process_args);

        self.refresh_flow_counts();
        self.reported.add_traffic(&other.reported);
        self.tcp.add(&other.tcp);
    }

    /// Move the flows accepted by `matches` into a new entry. Traffic not
    /// yet exported goes with the first split so it is only counted once.
    fn split_off<F: Fn(&Tuple) -> bool>(&mut self, matches: &F) -> Option<FlowStats> {
        let refs = take_matching(&mut self.refs, matches);
        if refs.is_empty() {
            return None;
        }
        let mut reported = FlowReportedStats::default();
        reported.add_traffic(&self.reported);
        let mut split = FlowStats {
            reported,
            tcp: std::mem::take(&mut self.tcp),
            started: take_matching(&mut self.started, matches),
            completed: take_matching(&mut self.completed, matches),
            active: take_matching(&mut self.active, matches),
            refs,
            process_ids: self.process_ids.clone(),
            process_args: self.process_args.clone(),
            reset_process_ids: self.reset_process_ids,
        };
        self.reported = FlowReportedStats::default();
        self.refresh_flow_counts();
        split.refresh_flow_counts();
        Some(split)
    }

    fn refresh_flow_counts(&mut self) {
        self.reported.num_flows = self.refs.len() as u64;
        self.reported.num_flows_started = self.started.len() as u64;
        self.reported.num_flows_completed = self.completed.len() as u64;
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }

    fn reset(&mut self) {
        self.started.clear();
        self.completed.clear();
        self.refs = self.active.clone();
        self.reported = FlowReportedStats {
            num_flows: self.refs.len() as u64,
            ..Default::default()
        };
        self.tcp = FlowReportedTcpStats::default();
        // Cleared on the next aggregation so that an idle interval keeps them.
        self.reset_process_ids = true;
    }

    fn nat_outgoing_ports(&self, limit: usize) -> Vec<u16> {
        self.active
            .values()
            .chain(self.completed.values())
            .copied()
            .filter(|port| *port != 0)
            .take(limit)
            .collect()
    }
}

fn take_matching<F: Fn(&Tuple) -> bool>(refs: &mut TupleRefs, matches: &F) -> TupleRefs {
    let (taken, kept): (TupleRefs, TupleRefs) = std::mem::take(refs)
        .into_iter()
        .partition(|(tuple, _)| matches(tuple));
    *refs = kept;
    taken
}

/// Process identity an update is filed under.
struct ProcessKey {
    name: String,
    pid: u32,
    args: String,
}

impl ProcessKey {
    fn of(update: &MetricUpdate, include_process: bool) -> Self {
        if !include_process || update.process_name.is_empty() {
            return Self {
                name: FIELD_NOT_INCLUDED.to_string(),
                pid: 0,
                args: FIELD_NOT_INCLUDED.to_string(),
            };
        }
        Self {
            name: update.process_name.clone(),
            pid: update.process_id,
            args: update.process_args.clone(),
        }
    }
}

/// Process columns plus statistics, as emitted in a flow log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowProcessReportedStats {
    pub process_name: String,
    pub num_process_names: usize,
    pub process_id: String,
    pub num_process_ids: usize,
    pub process_args: Vec<String>,
    pub num_process_args: usize,
    pub nat_outgoing_ports: Vec<u16>,
    #[serde(flatten)]
    pub stats: FlowReportedStats,
    #[serde(flatten)]
    pub tcp: FlowReportedTcpStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessLimits {
    pub include_process: bool,
    pub process_limit: usize,
    pub process_args_limit: usize,
    pub nat_outgoing_port_limit: usize,
}

/// Statistics keyed by process name, in first-seen order. Without process
/// tracking everything lives under a single `-` entry.
#[derive(Debug, Clone)]
pub(crate) struct FlowStatsByProcess {
    by_name: HashMap<String, FlowStats>,
    order: Vec<String>,
    limits: ProcessLimits,
}

impl FlowStatsByProcess {
    pub(crate) fn new(update: &MetricUpdate, limits: ProcessLimits) -> Self {
        let mut stats = Self {
            by_name: HashMap::new(),
            order: Vec::new(),
            limits,
        };
        stats.aggregate(update);
        stats
    }

    pub(crate) fn aggregate(&mut self, update: &MetricUpdate) {
        let process = ProcessKey::of(update, self.limits.include_process);
        match self.by_name.get_mut(&process.name) {
            Some(stats) => stats.aggregate(update, &process),
            None => {
                self.order.push(process.name.clone());
                let stats = FlowStats::new(update, &process);
                self.by_name.insert(process.name, stats);
            }
        }
    }

    pub(crate) fn merge(&mut self, other: FlowStatsByProcess) {
        let mut other = other;
        for name in other.order {
            let Some(stats) = other.by_name.remove(&name) else {
                continue;
            };
            match self.by_name.get_mut(&name) {
                Some(existing) => existing.merge(stats),
                None => {
                    self.order.push(name.clone());
                    self.by_name.insert(name, stats);
                }
            }
        }
    }

    /// Move the flows accepted by `matches` out of every process. Processes
    /// left without any flow are dropped.
    pub(crate) fn split_off<F: Fn(&Tuple) -> bool>(&mut self, matches: &F) -> Option<FlowStatsByProcess> {
        let mut split = FlowStatsByProcess {
            by_name: HashMap::new(),
            order: Vec::new(),
            limits: self.limits,
        };
        let by_name = &mut self.by_name;
        self.order.retain(|name| {
            let Some(stats) = by_name.get_mut(name) else {
                return false;
            };
            if let Some(moved) = stats.split_off(matches) {
                split.order.push(name.clone());
                split.by_name.insert(name.clone(), moved);
            }
            if stats.refs.is_empty() {
                by_name.remove(name);
                return false;
            }
            true
        });
        if split.is_empty() {
            None
        } else {
            Some(split)
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub(crate) fn contains_active_refs(&self, update: &MetricUpdate) -> bool {
        let process = ProcessKey::of(update, self.limits.include_process);
        self.by_name
            .get(&process.name)
            .map(|stats| stats.active.contains_key(&update.tuple))
            .unwrap_or(false)
    }

    pub(crate) fn active_flows_count(&self) -> usize {
        self.by_name.values().map(FlowStats::active_count).sum()
    }

    pub(crate) fn reset(&mut self) {
        for stats in self.by_name.values_mut() {
            stats.reset();
        }
    }

    /// Drop processes without active flows; returns the remaining active count.
    pub(crate) fn gc(&mut self) -> usize {
        let by_name = &mut self.by_name;
        self.order.retain(|name| {
            let active = by_name.get(name).map(FlowStats::active_count).unwrap_or(0);
            if active == 0 {
                by_name.remove(name);
            }
            active > 0
        });
        self.active_flows_count()
    }

    /// At most `process_limit` entries in first-seen order, plus one entry
    /// folding the statistics of every remaining process.
    pub(crate) fn to_reported_stats(&self) -> Vec<FlowProcessReportedStats> {
        let limits = &self.limits;
        let mut reported = Vec::with_capacity(limits.process_limit + 1);

        let mut rest: Option<FlowProcessReportedStats> = None;
        for name in &self.order {
            let Some(stats) = self.by_name.get(name) else {
                continue;
            };
            let nat_ports = stats.nat_outgoing_ports(limits.nat_outgoing_port_limit);

            if name == FIELD_NOT_INCLUDED {
                reported.push(FlowProcessReportedStats {
                    process_name: FIELD_NOT_INCLUDED.to_string(),
                    num_process_names: 0,
                    process_id: FIELD_NOT_INCLUDED.to_string(),
                    num_process_ids: 0,
                    process_args: vec![FIELD_NOT_INCLUDED.to_string()],
                    num_process_args: 0,
                    nat_outgoing_ports: nat_ports,
                    stats: stats.reported,
                    tcp: stats.tcp,
                });
                continue;
            }

            let num_pids = stats.process_ids.len();
            let (args, num_args) = process_args(stats, num_pids, limits.process_args_limit);

            if reported.len() >= limits.process_limit {
                let agg = rest.get_or_insert_with(|| FlowProcessReportedStats {
                    process_name: FIELD_AGGREGATED.to_string(),
                    num_process_names: 0,
                    process_id: FIELD_AGGREGATED.to_string(),
                    num_process_ids: 0,
                    process_args: Vec::new(),
                    num_process_args: 0,
                    nat_outgoing_ports: Vec::new(),
                    stats: FlowReportedStats::default(),
                    tcp: FlowReportedTcpStats::default(),
                });
                agg.num_process_names += 1;
                agg.num_process_ids += num_pids;
                agg.num_process_args += num_args;
                for arg in args {
                    if agg.process_args.len() < limits.process_args_limit.max(1) {
                        agg.process_args.push(arg);
                    }
                }
                agg.stats.add(&stats.reported);
                agg.tcp.add(&stats.tcp);
                let room = limits
                    .nat_outgoing_port_limit
                    .saturating_sub(agg.nat_outgoing_ports.len());
                agg.nat_outgoing_ports.extend(nat_ports.into_iter().take(room));
                continue;
            }

            let pid = match num_pids {
                0 => FIELD_NOT_INCLUDED.to_string(),
                1 => stats
                    .process_ids
                    .iter()
                    .next()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| FIELD_NOT_INCLUDED.to_string()),
                _ => FIELD_AGGREGATED.to_string(),
            };
            reported.push(FlowProcessReportedStats {
                process_name: name.clone(),
                num_process_names: 1,
                process_id: pid,
                num_process_ids: num_pids,
                process_args: args,
                num_process_args: num_args,
                nat_outgoing_ports: nat_ports,
                stats: stats.reported,
                tcp: stats.tcp,
            });
        }

        if let Some(mut agg) = rest {
            if agg.process_args.is_empty() {
                agg.process_args.push(FIELD_NOT_INCLUDED.to_string());
            }
            reported.push(agg);
        }
        reported
    }
}

/// Arguments shown for one process and the count reported alongside them.
fn process_args(stats: &FlowStats, num_pids: usize, limit: usize) -> (Vec<String>, usize) {
    let num_args = stats.process_args.len();
    if num_args == 0 {
        return (vec![FIELD_NOT_INCLUDED.to_string()], 0);
    }
    if num_pids == 1 {
        // A single pid can still have arguments from two sources; keep the longest.
        let longest = stats
            .process_args
            .iter()
            .max_by_key(|arg| arg.len())
            .cloned()
            .unwrap_or_default();
        return (vec![longest], 1);
    }
    let take = if limit <= 1 { 1 } else { limit };
    (stats.process_args.iter().take(take).cloned().collect(), num_args)
}
