//! Collector to reporter fan-out to flow log aggregation

use async_trait::async_trait;
use flowscope::collector::{Collector, ConntrackCounters, ConntrackInfo, PacketInfo, RuleHit};
use flowscope::config::CollectorConfig;
use flowscope::endpoint::{Endpoint, Labels, MatchData, TierPolicies, Workload};
use flowscope::flowlog::{
    AggregationKind, FlowAction, FlowLog, FlowLogAggregator, FlowLogReporter, FlowReporter, LogDispatcher,
    LogOffset, Offsets,
};
use flowscope::lookup::{Lookups, ServiceInfo};
use flowscope::reporter::ReporterManager;
use flowscope::rule::{RuleAction, RuleDirection, RuleId};
use flowscope::Result;
use flowscope_common::{parse_16_bytes, protocol, Tuple};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

#[derive(Default)]
struct StaticLookups {
    endpoints: Mutex<HashMap<[u8; 16], Arc<Endpoint>>>,
}

impl StaticLookups {
    fn with_local(ip: &str, name: &str) -> Arc<Self> {
        let lookups = Arc::new(Self::default());
        let tiers = vec![TierPolicies::new("tier1", &[("policy1", "default")])];
        let ep = Endpoint::LocalWorkload(Workload {
            node: "node1".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            generate_name: None,
            labels: Labels::new(),
            ingress: MatchData::from_tiers(RuleDirection::Ingress, &tiers),
            egress: MatchData::from_tiers(RuleDirection::Egress, &tiers),
        });
        lookups
            .endpoints
            .lock()
            .expect("lock")
            .insert(addr(ip), Arc::new(ep));
        lookups
    }
}

impl Lookups for StaticLookups {
    fn get_endpoint(&self, addr: &[u8; 16]) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().expect("lock").get(addr).cloned()
    }

    fn get_network_set(&self, _addr: &[u8; 16]) -> Option<Arc<Endpoint>> {
        None
    }

    fn get_network_set_from_egress_domain(&self, _domain: &str) -> Option<Arc<Endpoint>> {
        None
    }

    fn get_service_from_pre_dnat_dest(&self, _addr: &[u8; 16], _port: u16, _proto: u8) -> Option<ServiceInfo> {
        None
    }

    fn get_node(&self, _addr: &[u8; 16]) -> Option<String> {
        None
    }

    fn get_node_port_service(&self, _port: u16, _proto: u8) -> Option<ServiceInfo> {
        None
    }
}

#[derive(Default)]
struct Collecting {
    logs: Mutex<Vec<FlowLog>>,
}

impl Collecting {
    fn take(&self) -> Vec<FlowLog> {
        std::mem::take(&mut *self.logs.lock().expect("lock"))
    }
}

#[async_trait]
impl LogDispatcher for Collecting {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn dispatch(&self, logs: Vec<FlowLog>) -> Result<()> {
        self.logs.lock().expect("lock").extend(logs);
        Ok(())
    }
}

#[derive(Default)]
struct Lag {
    behind: AtomicBool,
}

impl LogOffset for Lag {
    fn read(&self) -> Offsets {
        Offsets::new()
    }

    fn is_behind(&self, _offsets: &Offsets) -> bool {
        self.behind.load(Ordering::SeqCst)
    }

    fn increase_factor(&self, _offsets: &Offsets) -> i32 {
        1
    }
}

fn addr(ip: &str) -> [u8; 16] {
    parse_16_bytes(ip).expect("valid ip")
}

fn tuple(src_port: u16) -> Tuple {
    Tuple::new(addr("10.0.0.1"), addr("20.0.0.1"), protocol::TCP, src_port, 80)
}

fn rule(action: RuleAction) -> Arc<RuleId> {
    let index = if action == RuleAction::Allow { 0 } else { 1 };
    Arc::new(RuleId::new(
        "tier1",
        "policy1",
        "default",
        index,
        RuleDirection::Ingress,
        action,
    ))
}

fn packet(tuple: Tuple, action: RuleAction) -> PacketInfo {
    PacketInfo::new(
        tuple,
        RuleDirection::Ingress,
        vec![RuleHit {
            rule_id: rule(action),
            hits: 1,
            bytes: 100,
        }],
    )
}

fn conntrack(tuple: Tuple, pkts: u64, bytes: u64, rpkts: u64, rbytes: u64) -> ConntrackInfo {
    ConntrackInfo::new(
        tuple,
        ConntrackCounters::new(pkts, bytes),
        ConntrackCounters::new(rpkts, rbytes),
    )
}

struct Pipeline {
    collector: Collector,
    flow_logs: FlowLogReporter,
    allowed: Arc<Collecting>,
    denied: Arc<Collecting>,
    lag: Arc<Lag>,
}

impl Pipeline {
    fn new(level: AggregationKind) -> Self {
        let lag = Arc::new(Lag::default());
        let allowed = Arc::new(Collecting::default());
        let denied = Arc::new(Collecting::default());
        let flow_logs = FlowLogReporter::new(Duration::from_secs(3600), lag.clone())
            .with_aggregator(
                FlowLogAggregator::new(level).for_action(FlowAction::Allow),
                vec![allowed.clone() as Arc<dyn LogDispatcher>],
            )
            .with_aggregator(
                FlowLogAggregator::new(level).for_action(FlowAction::Deny),
                vec![denied.clone() as Arc<dyn LogDispatcher>],
            );

        let (mut manager, report_tx) = ReporterManager::new(64);
        manager.register(Arc::new(flow_logs.clone()));
        manager.spawn();

        let lookups = StaticLookups::with_local("20.0.0.1", "nginx");
        let collector =
            Collector::new(CollectorConfig::default(), lookups, report_tx).expect("Should create collector");
        Self {
            collector,
            flow_logs,
            allowed,
            denied,
            lag,
        }
    }

    /// Sweep, hand the updates to the fan-out and give it time to deliver.
    async fn sweep(&mut self) {
        self.collector.check_flows();
        self.deliver().await;
    }

    async fn deliver(&mut self) {
        self.collector.flush_updates().await;
        time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_reported_connection_becomes_flow_log() {
    let mut p = Pipeline::new(AggregationKind::Default);
    p.collector.handle_conntrack(conntrack(tuple(54123), 1, 100, 2, 250));
    p.collector.handle_packet_info(packet(tuple(54123), RuleAction::Allow));
    p.sweep().await;
    assert_eq!(p.flow_logs.flush().await, 0, "Nothing is reported before the initial delay");

    time::advance(Duration::from_secs(11)).await;
    p.sweep().await;
    assert_eq!(p.flow_logs.flush().await, 1);

    let logs = p.allowed.take();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.meta.action, FlowAction::Allow);
    assert_eq!(log.meta.reporter, FlowReporter::Dst);
    assert_eq!(log.meta.tuple.source_port, Some(54123));
    assert_eq!(log.meta.tuple.dest_port, Some(80));
    assert_eq!(log.meta.dest.name, "nginx");
    assert_eq!(log.process.stats.packets_in, 1);
    assert_eq!(log.process.stats.bytes_in, 100);
    assert_eq!(log.process.stats.packets_out, 2);
    assert_eq!(log.process.stats.bytes_out, 250);
    assert_eq!(log.process.stats.num_flows_started, 1);
    assert!(p.denied.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_counters_are_not_reported_twice() {
    let mut p = Pipeline::new(AggregationKind::Default);
    p.collector.handle_conntrack(conntrack(tuple(54123), 1, 100, 2, 250));
    p.collector.handle_packet_info(packet(tuple(54123), RuleAction::Allow));
    time::advance(Duration::from_secs(11)).await;
    p.sweep().await;

    // A second sweep with no new traffic adds nothing.
    p.sweep().await;
    p.collector.handle_conntrack(conntrack(tuple(54123), 4, 400, 2, 250));
    p.sweep().await;
    p.flow_logs.flush().await;

    let logs = p.allowed.take();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].process.stats.packets_in, 4);
    assert_eq!(logs[0].process.stats.bytes_in, 400);
    assert_eq!(logs[0].process.stats.packets_out, 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_flow_completes_once_verdict_arrives() {
    let mut p = Pipeline::new(AggregationKind::Default);
    p.collector.handle_conntrack(conntrack(tuple(54123), 1, 100, 2, 250));
    p.collector
        .handle_conntrack(conntrack(tuple(54123), 1, 100, 2, 250).expired());
    p.deliver().await;
    assert!(p.collector.get(&tuple(54123)).is_some(), "Unreportable records are kept");

    p.collector.handle_packet_info(packet(tuple(54123), RuleAction::Deny));
    p.deliver().await;
    assert!(p.collector.is_empty());

    p.flow_logs.flush().await;
    let logs = p.denied.take();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].meta.action, FlowAction::Deny);
    assert_eq!(logs[0].process.stats.num_flows_started, 1);
    assert_eq!(logs[0].process.stats.num_flows_completed, 1);
    assert!(p.allowed.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_unreportable_record_ages_out() {
    let mut p = Pipeline::new(AggregationKind::Default);
    p.collector.handle_conntrack(conntrack(tuple(54123), 1, 100, 2, 250));
    assert_eq!(p.collector.len(), 1);

    time::advance(Duration::from_secs(61)).await;
    p.sweep().await;
    assert!(p.collector.is_empty());
    assert_eq!(p.collector.metrics().flow_table_size(), 0);
    assert_eq!(p.flow_logs.flush().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_coarsens_and_merges_open_flows() {
    let mut p = Pipeline::new(AggregationKind::Default);
    for port in [1000, 1001] {
        p.collector.handle_conntrack(conntrack(tuple(port), 1, 100, 1, 100));
        p.collector.handle_packet_info(packet(tuple(port), RuleAction::Allow));
    }
    time::advance(Duration::from_secs(11)).await;
    p.sweep().await;

    p.lag.behind.store(true, Ordering::SeqCst);
    assert_eq!(p.flow_logs.flush().await, 2, "The interval is exported at its own level");
    assert_eq!(p.flow_logs.levels().await[0], AggregationKind::SourcePort);
    p.allowed.take();

    // New traffic on one connection pulls both open flows into the coarser key.
    p.collector.handle_conntrack(conntrack(tuple(1000), 3, 300, 1, 100));
    p.sweep().await;
    p.lag.behind.store(false, Ordering::SeqCst);
    assert_eq!(p.flow_logs.flush().await, 1);
    assert_eq!(p.flow_logs.levels().await[0], AggregationKind::Default);

    let logs = p.allowed.take();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].meta.tuple.source_port, None);
    assert_eq!(logs[0].process.stats.num_flows, 2);
    assert_eq!(logs[0].process.stats.packets_in, 2);
}
