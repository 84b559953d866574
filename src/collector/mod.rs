//! Flow state aggregation engine
//!
//! The collector owns the flow table. Event sources talk to it over channels
//! and only the task running [`Collector::run`] touches a [`Data`] record, so
//! the table is never locked. Metric updates produced while handling an event
//! are queued and handed to the reporter fan-out once the event is done.

pub mod bounded_set;
pub mod counter;
pub mod data;
pub mod dump;
pub mod events;
pub mod l7;
pub mod rule_trace;

pub use bounded_set::BoundedSet;
pub use data::Data;
pub use events::{
    ConntrackCounters, ConntrackInfo, DataplaneStats, HttpData, PacketInfo, Protocol, Relativity,
    RuleHit, Statistic, StatisticAction, StatisticKind,
};
pub use l7::{L7LogReporter, L7Update};
pub use rule_trace::{RuleMatch, RuleTrace};

use crate::config::CollectorConfig;
use crate::endpoint::{self, Endpoint};
use crate::error::FlowscopeError;
use crate::lookup::{EgressDomainCache, Lookups, GLOBAL_CLIENT};
use crate::metric::{MetricUpdate, UpdateType};
use crate::metrics::CollectorMetrics;
use crate::policy::PolicyStore;
use crate::process::{NilProcessInfoCache, ProcessInfoCache, TrafficDirection};
use crate::rule::{RuleAction, RuleDirection, RuleId};
use crate::Result;
use flowscope_common::Tuple;
use prometheus::Registry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the dataplane statistics channel.
pub const DATAPLANE_STATS_CHANNEL_CAPACITY: usize = 1000;

/// Receiving ends of the collector's event channels.
pub struct CollectorInputs {
    pub conntrack: mpsc::Receiver<Vec<ConntrackInfo>>,
    pub packets: mpsc::Receiver<PacketInfo>,
    pub dataplane_stats: mpsc::Receiver<DataplaneStats>,
    pub dump_trigger: mpsc::Receiver<()>,
}

/// Sending ends handed to the event sources.
#[derive(Clone)]
pub struct CollectorSenders {
    pub conntrack: mpsc::Sender<Vec<ConntrackInfo>>,
    pub packets: mpsc::Sender<PacketInfo>,
    pub dataplane_stats: mpsc::Sender<DataplaneStats>,
    pub dump_trigger: mpsc::Sender<()>,
}

/// Create the collector's event channels.
pub fn channels(capacity: usize) -> (CollectorSenders, CollectorInputs) {
    let (conntrack_tx, conntrack_rx) = mpsc::channel(capacity);
    let (packets_tx, packets_rx) = mpsc::channel(capacity);
    let (stats_tx, stats_rx) = mpsc::channel(DATAPLANE_STATS_CHANNEL_CAPACITY);
    let (dump_tx, dump_rx) = mpsc::channel(1);
    (
        CollectorSenders {
            conntrack: conntrack_tx,
            packets: packets_tx,
            dataplane_stats: stats_tx,
            dump_trigger: dump_tx,
        },
        CollectorInputs {
            conntrack: conntrack_rx,
            packets: packets_rx,
            dataplane_stats: stats_rx,
            dump_trigger: dump_rx,
        },
    )
}

/// Joins conntrack and packet info events per connection and turns them
/// into metric updates for the reporters.
pub struct Collector {
    config: CollectorConfig,
    lookups: Arc<dyn Lookups>,
    domain_cache: Option<Arc<dyn EgressDomainCache>>,
    process_cache: Arc<dyn ProcessInfoCache>,
    l7_reporter: Option<Arc<dyn L7LogReporter>>,
    policy_store: PolicyStore,
    metrics: CollectorMetrics,
    table: HashMap<Tuple, Data>,
    outbox: Vec<MetricUpdate>,
    report_tx: mpsc::Sender<MetricUpdate>,
}

impl Collector {
    /// Create a collector with an empty flow table, sending its updates to
    /// `report_tx`.
    pub fn new(
        config: CollectorConfig,
        lookups: Arc<dyn Lookups>,
        report_tx: mpsc::Sender<MetricUpdate>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            lookups,
            domain_cache: None,
            process_cache: Arc::new(NilProcessInfoCache),
            l7_reporter: None,
            policy_store: PolicyStore::default(),
            metrics: CollectorMetrics::new()?,
            table: HashMap::new(),
            outbox: Vec::new(),
            report_tx,
        })
    }

    /// Resolve egress domains of remote addresses through `cache`.
    pub fn with_domain_cache(mut self, cache: Arc<dyn EgressDomainCache>) -> Self {
        self.domain_cache = Some(cache);
        self
    }

    /// Attach process information from `cache` to local flows.
    pub fn with_process_cache(mut self, cache: Arc<dyn ProcessInfoCache>) -> Self {
        self.process_cache = cache;
        self
    }

    /// Send the L7 updates built from dataplane stats to `reporter`.
    pub fn with_l7_reporter(mut self, reporter: Arc<dyn L7LogReporter>) -> Self {
        self.l7_reporter = Some(reporter);
        self
    }

    /// Compute the pending rule traces of local endpoints from `store`.
    pub fn with_policy_store(mut self, store: PolicyStore) -> Self {
        self.policy_store = store;
        self
    }

    pub fn metrics(&self) -> &CollectorMetrics {
        &self.metrics
    }

    pub fn metrics_registry(&self) -> Registry {
        self.metrics.registry()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, tuple: &Tuple) -> Option<&Data> {
        self.table.get(tuple)
    }

    /// Process events until `shutdown` fires.
    pub async fn run(mut self, mut inputs: CollectorInputs, shutdown: CancellationToken) {
        let mut export_ticker = time::interval(self.config.export_interval());
        export_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut policy_ticker = self.config.policy_evaluation_interval().map(|period| {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(
            "Collector started (export interval {:?}, age timeout {:?})",
            self.config.export_interval(),
            self.config.age_timeout()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Collector stopping with {} flows tracked", self.table.len());
                    break;
                }
                Some(batch) = inputs.conntrack.recv() => {
                    let start = Instant::now();
                    for info in batch {
                        self.handle_conntrack(info);
                    }
                    self.metrics.conntrack_latency.observe(start.elapsed().as_secs_f64());
                }
                Some(packet) = inputs.packets.recv() => {
                    let start = Instant::now();
                    self.handle_packet_info(packet);
                    self.metrics.packet_info_latency.observe(start.elapsed().as_secs_f64());
                }
                Some(stats) = inputs.dataplane_stats.recv() => {
                    let start = Instant::now();
                    self.handle_dataplane_stats(stats);
                    self.metrics.dataplane_stats_latency.observe(start.elapsed().as_secs_f64());
                }
                Some(()) = inputs.dump_trigger.recv() => {
                    let start = Instant::now();
                    match self.dump_stats() {
                        Ok(count) => info!(
                            "Dumped {} flows to {}",
                            count,
                            self.config.stats_dump_file_path.display()
                        ),
                        Err(e) => error!("Failed to dump flow table: {}", e),
                    }
                    self.metrics.dump_stats_latency.observe(start.elapsed().as_secs_f64());
                }
                _ = export_ticker.tick() => self.check_flows(),
                _ = tick(&mut policy_ticker) => self.evaluate_pending_policies().await,
            }
            self.flush_updates().await;
        }
    }

    /// Hand queued metric updates to the reporter fan-out.
    pub async fn flush_updates(&mut self) {
        let mut dropped = 0;
        let mut last_error = None;
        for update in std::mem::take(&mut self.outbox) {
            if let Err(e) = self.send_update(update).await {
                self.metrics.reporter_dropped_updates.inc();
                dropped += 1;
                last_error = Some(e);
            }
        }
        if let Some(e) = last_error {
            warn!("Dropped {} metric updates: {}", dropped, e);
        }
    }

    async fn send_update(&self, update: MetricUpdate) -> Result<()> {
        self.report_tx
            .send(update)
            .await
            .map_err(|_| FlowscopeError::ChannelClosed("report"))
    }

    fn put(&mut self, data: Data) {
        self.table.insert(data.tuple, data);
        self.metrics.set_flow_table_size(self.table.len());
    }

    /// Drop a record taken out of the table.
    fn discard(&mut self, data: Data) {
        if self.config.display_debug_trace_logs {
            debug!("Deleting flow {}", data.tuple);
        }
        drop(data);
        self.metrics.set_flow_table_size(self.table.len());
    }

    fn lookup_endpoint(&self, addr: &[u8; 16], can_check_egress_domains: bool) -> Option<Arc<Endpoint>> {
        if let Some(ep) = self.lookups.get_endpoint(addr) {
            return Some(ep);
        }
        if !self.config.enable_network_sets {
            return None;
        }
        if let Some(ep) = self.lookups.get_network_set(addr) {
            return Some(ep);
        }
        if !can_check_egress_domains {
            return None;
        }
        let domain = self.domain_cache.as_ref()?.get_watched_domain_for_ip(addr)?;
        self.lookups.get_network_set_from_egress_domain(&domain)
    }

    /// Take the record for `tuple` out of the table, creating it for an
    /// active flow with a local endpoint and refreshing its endpoints.
    ///
    /// The caller must hand the record back with `put` or `discard`.
    fn get_or_update(&mut self, tuple: Tuple, expired: bool, from_packet: bool) -> Option<Data> {
        let existing = self.table.remove(&tuple);
        if expired {
            return existing;
        }

        let src_ep = self.lookup_endpoint(&tuple.src, false);
        let src_local = endpoint::is_local(src_ep.as_ref());
        let dst_ep = self.lookup_endpoint(&tuple.dst, src_local);
        let dst_local = endpoint::is_local(dst_ep.as_ref());

        let mut data = match existing {
            None => {
                if !src_local && !dst_local {
                    return None;
                }
                Data::new(tuple, src_ep, dst_ep, self.config.max_original_source_ips)
            }
            Some(data) if data.reported && !from_packet && !data.unreported_packet_info => {
                return Some(data);
            }
            Some(mut data) if data.reported => {
                if endpoint::endpoint_changed(data.src_ep(), src_ep.as_ref())
                    || endpoint::endpoint_changed(data.dst_ep(), dst_ep.as_ref())
                {
                    self.handle_endpoint_or_rules_changed(&mut data);
                    if !src_local && !dst_local {
                        self.discard(data);
                        return None;
                    }
                }
                data.set_endpoints(src_ep, dst_ep);
                data
            }
            Some(mut data) => {
                data.merge_endpoints(src_ep, dst_ep);
                data
            }
        };

        if from_packet {
            data.unreported_packet_info = true;
        }
        self.update_dest_domains(&mut data);
        Some(data)
    }

    fn update_dest_domains(&self, data: &mut Data) {
        let Some(cache) = &self.domain_cache else {
            return;
        };
        let resolvable = data.dst_ep().map(|ep| ep.is_network_set()).unwrap_or(true);
        if !resolvable {
            return;
        }
        let client = if self.config.enable_destination_domains_by_client {
            data.tuple.src_ip().to_string()
        } else {
            GLOBAL_CLIENT.to_string()
        };
        let domains = cache.get_top_level_domains_for_ip(&client, &data.tuple.dst);
        data.maybe_set_dest_domains(domains);
    }

    /// Flush stats gathered under the old identity and start over.
    fn handle_endpoint_or_rules_changed(&mut self, data: &mut Data) {
        if self.report_metrics(data, false) {
            self.expire_metrics(data);
            data.reset_conntrack_counters();
            data.reset_application_counters();
            data.reset_tcp_stats();
            data.reported = false;
        }
    }

    pub fn handle_conntrack(&mut self, info: ConntrackInfo) {
        if self.config.display_debug_trace_logs {
            debug!("Collector event: {:?}", info);
        }
        let Some(mut data) = self.get_or_update(info.tuple, info.expired, false) else {
            return;
        };

        data.maybe_set_pre_dnat(info.is_dnat, &info.pre_dnat_tuple);
        data.set_proxied(info.is_proxy);
        data.set_nat_outgoing_port(info.nat_outgoing_port);
        data.set_conntrack_counters(info.counters.packets, info.counters.bytes);
        data.set_conntrack_counters_reverse(info.reply_counters.packets, info.reply_counters.bytes);

        if info.expired {
            // Unreportable flows stay until the sweep has had a chance to
            // gather service and process details.
            if self.report_metrics(&mut data, false) {
                self.expire_metrics(&mut data);
                self.discard(data);
                return;
            }
            data.set_expired();
        }
        self.put(data);
    }

    pub fn handle_packet_info(&mut self, packet: PacketInfo) {
        debug!("Collector event: packet info for {}", packet.tuple);
        let Some(mut data) = self.get_or_update(packet.tuple, false, true) else {
            return;
        };
        data.maybe_set_pre_dnat(packet.is_dnat, &packet.pre_dnat_tuple);

        let local_ep = match packet.direction {
            RuleDirection::Ingress => data.dst_ep(),
            RuleDirection::Egress => data.src_ep(),
        }
        .filter(|ep| ep.is_local())
        .cloned();
        let Some(local_ep) = local_ep else {
            self.put(data);
            return;
        };
        let Some(match_data) = local_ep.match_data(packet.direction) else {
            self.put(data);
            return;
        };

        for hit in &packet.rule_hits {
            let rule_id = &hit.rule_id;
            let slot = if rule_id.is_profile() {
                Some((rule_id.clone(), match_data.profile_match_index))
            } else if rule_id.is_end_of_tier() {
                // Deny becomes the tier's implicit drop; pass is kept to decide
                // whether staged end-of-tier drops are reported.
                match_data.tier_data.get(&rule_id.tier).and_then(|tier| match rule_id.action {
                    RuleAction::Deny => tier
                        .implicit_drop_rule_id
                        .clone()
                        .map(|drop| (drop, tier.end_of_tier_match_index)),
                    RuleAction::Pass => Some((rule_id.clone(), tier.end_of_tier_match_index)),
                    RuleAction::Allow => None,
                })
            } else {
                match_data
                    .policy_matches
                    .get(&rule_id.policy_id())
                    .map(|idx| (rule_id.clone(), *idx))
            };

            if let Some((rule_id, idx)) = slot {
                self.apply_rule_hit(&mut data, rule_id, idx, hit.hits, hit.bytes);
            }
        }

        if data.is_expired() && self.report_metrics(&mut data, false) {
            self.expire_metrics(&mut data);
            self.discard(data);
            return;
        }
        self.put(data);
    }

    fn apply_rule_hit(&mut self, data: &mut Data, rule_id: Arc<RuleId>, idx: usize, pkts: u64, bytes: u64) {
        if data.add_rule_id(rule_id.clone(), idx, pkts, bytes) == RuleMatch::IsDifferent {
            self.handle_endpoint_or_rules_changed(data);
            data.replace_rule_id(rule_id, idx, pkts, bytes);
        }
    }

    pub fn handle_dataplane_stats(&mut self, stats: DataplaneStats) {
        if self.config.display_debug_trace_logs {
            debug!("Received dataplane stats update {:?}", stats);
        }
        let tuple = match stats.tuple() {
            Ok(tuple) => tuple,
            Err(e) => {
                error!("Unable to extract tuple from dataplane statistics: {}", e);
                self.metrics.record_dataplane_stats_errors(1);
                return;
            }
        };

        // Statistics can arrive before conntrack or rule hits for the flow.
        let mut data = self.get_or_update(tuple, false, false);

        let mut http_data_count = 0u64;
        let mut is_l7_data = false;
        for stat in &stats.stats {
            if stat.relativity != Relativity::Delta {
                warn!(
                    "Ignoring {:?} statistic with {:?} relativity",
                    stat.kind, stat.relativity
                );
                continue;
            }
            match stat.kind {
                StatisticKind::HttpRequests => {
                    if let Some(data) = data.as_mut() {
                        match stat.action {
                            StatisticAction::Allowed => data.increase_http_requests_allowed(stat.value),
                            StatisticAction::Denied => data.increase_http_requests_denied(stat.value),
                        }
                    }
                }
                StatisticKind::HttpData => {
                    http_data_count = stat.value;
                    is_l7_data = true;
                }
                StatisticKind::IngressData => http_data_count = stat.value,
                StatisticKind::Unsupported(kind) => {
                    warn!("Ignoring unsupported statistic kind {}", kind);
                }
            }
        }

        let mut ips: Vec<IpAddr> = Vec::with_capacity(stats.http_data.len());
        for hd in &stats.http_data {
            if is_l7_data {
                self.log_l7(hd, data.as_ref(), tuple, http_data_count);
                continue;
            }
            let header = if !hd.x_real_ip.is_empty() {
                &hd.x_real_ip
            } else if !hd.x_forwarded_for.is_empty() {
                &hd.x_forwarded_for
            } else {
                continue;
            };
            // X-Forwarded-For lists the client first.
            let client = header.split(',').next().unwrap_or_default().trim();
            match client.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(_) => warn!("Bad original source IP {:?} for {}", header, tuple),
            }
        }

        if let Some(data) = data.as_mut() {
            if !ips.is_empty() {
                let total = if http_data_count == 0 {
                    ips.len()
                } else {
                    http_data_count as usize
                };
                data.add_original_source_ips(&BoundedSet::from_slice_with_total_count(
                    self.config.max_original_source_ips,
                    &ips,
                    total,
                ));
            } else if http_data_count != 0 && !is_l7_data {
                data.increase_num_unique_original_source_ips(http_data_count as usize);
            }
        }
        if is_l7_data && http_data_count != 0 && stats.http_data.is_empty() {
            // Overflow: the proxy only reports how many requests it dropped.
            self.log_l7(&HttpData::default(), data.as_ref(), tuple, http_data_count);
        }

        if let Some(data) = data {
            self.put(data);
        }
    }

    fn log_l7(&mut self, hd: &HttpData, data: Option<&Data>, tuple: Tuple, http_data_count: u64) {
        let Some(reporter) = self.l7_reporter.clone() else {
            return;
        };
        let update = l7::build_l7_update(self.lookups.as_ref(), hd, data, tuple, http_data_count);
        if let Err(e) = reporter.log(update) {
            warn!("Failed to log L7 update for {}: {}", tuple, e);
            self.metrics.record_dataplane_stats_errors(1);
        }
    }

    /// Periodic sweep: report what is ready, finish expired flows and age out
    /// idle ones.
    pub fn check_flows(&mut self) {
        let now = Instant::now();
        let initial_delay = self.config.initial_reporting_delay();
        let age_timeout = self.config.age_timeout();

        let tuples: Vec<Tuple> = self.table.keys().copied().collect();
        for tuple in tuples {
            // A shadow record may already have been removed by an earlier record.
            let Some(mut data) = self.table.remove(&tuple) else {
                continue;
            };

            if data.is_dirty()
                && (data.reported || now.duration_since(data.rule_updated_at()) > initial_delay)
            {
                self.check_pre_dnat_tuple(&data);
                self.report_metrics(&mut data, true);
            }

            if data.is_expired() && data.verdict_found() {
                if !data.reported {
                    self.report_metrics(&mut data, true);
                }
                self.expire_metrics(&mut data);
                self.discard(data);
                continue;
            }

            if now.duration_since(data.updated_at()) > age_timeout {
                debug!("Flow {} aged out", data.tuple);
                self.expire_metrics(&mut data);
                self.discard(data);
                continue;
            }

            self.table.insert(tuple, data);
        }
    }

    /// Remove a rule-only record whose tuple is the pre-DNAT tuple of `data`.
    ///
    /// Such a record is what a denied attempt at the service address leaves
    /// behind; it would otherwise be kept alive by the connection it shadows.
    fn check_pre_dnat_tuple(&mut self, data: &Data) {
        let Some(pre_dnat) = data.pre_dnat_tuple() else {
            return;
        };
        if pre_dnat == data.tuple {
            return;
        }
        match self.table.get(&pre_dnat) {
            Some(shadow)
                if !shadow.is_connection() && !shadow.egress.is_dirty() && !shadow.ingress.is_dirty() => {}
            _ => return,
        }
        if let Some(mut shadow) = self.table.remove(&pre_dnat) {
            debug!("Removing flow {} shadowing pre-DNAT tuple of {}", pre_dnat, data.tuple);
            self.report_metrics(&mut shadow, true);
            self.expire_metrics(&mut shadow);
            self.discard(shadow);
        }
    }

    fn lookup_process_info(&self, data: &mut Data) {
        let tuple = data.pre_dnat_tuple().unwrap_or(data.tuple);
        for direction in [TrafficDirection::Outbound, TrafficDirection::Inbound] {
            let mut info = self.process_cache.lookup(&tuple, direction);
            // Connect-time load balancing leaves new connections post-DNAT.
            if info.is_none() && self.config.is_bpf_dataplane {
                info = self.process_cache.lookup(&data.tuple, direction);
            }
            let Some(info) = info else {
                continue;
            };

            let unset = match direction {
                TrafficDirection::Outbound => data.source_process().is_unset(),
                TrafficDirection::Inbound => data.dest_process().is_unset(),
            };
            if !data.reported && unset {
                if self.config.display_debug_trace_logs {
                    debug!(
                        "Setting {} process {} ({}) for {}",
                        direction.as_str(),
                        info.name,
                        info.pid,
                        data.tuple
                    );
                }
                match direction {
                    TrafficDirection::Outbound => data.set_source_process(&info.name, &info.arguments, info.pid),
                    TrafficDirection::Inbound => data.set_dest_process(&info.name, &info.arguments, info.pid),
                }
            }
            if info.tcp_stats.is_dirty {
                data.set_tcp_socket_stats(&info.tcp_stats);
                self.process_cache.update(&tuple, false);
            }
        }
    }

    /// Report the record if everything needed is known, or unconditionally when
    /// `force` is set. Returns whether it was reported.
    fn report_metrics(&mut self, data: &mut Data, force: bool) -> bool {
        self.lookup_process_info(data);

        if !data.reported {
            let mut found_service = true;
            if self.config.enable_services && data.dst_svc().is_none() {
                if data.is_dnat() {
                    let svc = self.lookups.get_service_from_pre_dnat_dest(
                        data.pre_dnat_addr(),
                        data.pre_dnat_port(),
                        data.tuple.proto,
                    );
                    found_service = svc.is_some();
                    data.set_dst_svc(svc);
                } else if self.lookups.get_node(&data.tuple.dst).is_some() {
                    let svc = self
                        .lookups
                        .get_node_port_service(data.tuple.dst_port, data.tuple.proto);
                    found_service = svc.is_some();
                    data.set_dst_svc(svc);
                }
            }
            if !force && (!found_service || !data.verdict_found() || data.dst_ep().is_none()) {
                debug!("Delaying report of {} until the next sweep", data.tuple);
                return false;
            }
        }

        self.send_metrics(data, UpdateType::Report);
        data.reported = true;
        data.unreported_packet_info = false;
        true
    }

    fn expire_metrics(&mut self, data: &mut Data) {
        if data.reported {
            self.send_metrics(data, UpdateType::Expire);
        }
    }

    fn send_metrics(&mut self, data: &mut Data, update_type: UpdateType) {
        let expired = update_type == UpdateType::Expire;
        if data.is_connection() {
            if expired || data.is_dirty() {
                // An orig-IP-only flow still needs its own expire update.
                let mut send_orig_source_ips_expire = true;
                if data.egress.found_verdict() {
                    self.outbox.push(data.metric_update_egress_conn(update_type));
                }
                if data.ingress.found_verdict() {
                    send_orig_source_ips_expire = false;
                    self.outbox.push(data.metric_update_ingress_conn(update_type));
                }
                if (expired && data.orig_source_ips_active() && send_orig_source_ips_expire)
                    || data.num_unique_original_source_ips() != 0
                {
                    data.set_orig_source_ips_active(!expired);
                    self.outbox.push(data.metric_update_orig_source_ips(update_type));
                }
                // Connection counters supersede the rule trace counters.
                data.clear_conn_dirty_flag();
                data.egress.clear_dirty_flag();
                data.ingress.clear_dirty_flag();
            }
        } else {
            if (expired || data.egress.is_dirty()) && data.egress.found_verdict() {
                self.outbox.push(data.metric_update_egress_no_conn(update_type));
                data.egress.clear_dirty_flag();
            }
            if (expired || data.ingress.is_dirty()) && data.ingress.found_verdict() {
                self.outbox.push(data.metric_update_ingress_no_conn(update_type));
                data.ingress.clear_dirty_flag();
            }
            data.clear_dirty_flag_if_traces_clean();
        }
        data.clear_tcp_dirty_flag();
    }

    /// Recompute the pending rule trace of every local endpoint in the table.
    pub async fn evaluate_pending_policies(&mut self) {
        let mut changed = 0usize;
        for data in self.table.values_mut() {
            let sides = [
                (RuleDirection::Ingress, data.dst_ep().cloned()),
                (RuleDirection::Egress, data.src_ep().cloned()),
            ];
            for (direction, ep) in sides {
                let Some(ep) = ep.filter(|ep| ep.is_local()) else {
                    continue;
                };
                let rules = self.policy_store.evaluate(&ep, direction, &data.tuple).await;
                if data.set_pending_rule_ids(direction, rules) {
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            debug!("Updated {} pending rule traces", changed);
        }
    }

    pub fn dump_stats(&self) -> Result<usize> {
        dump::write_dump(&self.config.stats_dump_file_path, self.table.values())
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
