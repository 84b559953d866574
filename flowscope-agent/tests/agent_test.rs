//! End-to-end tests for the node agent: events in, flow logs out

use flowscope::collector::{ConntrackCounters, ConntrackInfo, PacketInfo, RuleHit};
use flowscope::config::Config;
use flowscope::endpoint::{Endpoint, Labels, MatchData, TierPolicies, Workload};
use flowscope::rule::{RuleAction, RuleDirection, RuleId};
use flowscope_agent::Agent;
use flowscope_common::{protocol, Tuple};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn ip(s: &str) -> IpAddr {
    s.parse().expect("Should parse address")
}

fn nginx() -> Arc<Endpoint> {
    let tiers = vec![TierPolicies::new("tier1", &[("policy1", "default")])];
    Arc::new(Endpoint::LocalWorkload(Workload {
        node: "node1".to_string(),
        namespace: "default".to_string(),
        name: "nginx-7d9f".to_string(),
        generate_name: Some("nginx-".to_string()),
        labels: Labels::new(),
        ingress: MatchData::from_tiers(RuleDirection::Ingress, &tiers),
        egress: MatchData::from_tiers(RuleDirection::Egress, &tiers),
    }))
}

fn tuple(src_port: u16) -> Tuple {
    Tuple::from_ips(ip("10.0.0.1"), ip("10.0.0.2"), protocol::TCP, src_port, 80)
}

fn conntrack(tuple: Tuple) -> ConntrackInfo {
    ConntrackInfo::new(tuple, ConntrackCounters::new(3, 300), ConntrackCounters::new(2, 200))
}

fn allow(tuple: Tuple) -> PacketInfo {
    PacketInfo::new(
        tuple,
        RuleDirection::Ingress,
        vec![RuleHit {
            rule_id: Arc::new(RuleId::new(
                "tier1",
                "policy1",
                "default",
                0,
                RuleDirection::Ingress,
                RuleAction::Allow,
            )),
            hits: 1,
            bytes: 60,
        }],
    )
}

#[tokio::test]
async fn test_completed_connections_are_written_on_shutdown() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let log_path = dir.path().join("flows.log");
    let metrics_path = dir.path().join("flowscope.prom");

    let mut config = Config::default();
    config.flow_logs.file_path = Some(log_path.clone());
    config.prometheus_textfile_path = Some(metrics_path.clone());

    let agent = Agent::new(config);
    agent.endpoints().insert_endpoint(&[ip("10.0.0.2")], nginx());
    let running = agent.start().expect("Agent should start");

    for port in [40000, 40001] {
        running
            .senders()
            .conntrack
            .send(vec![conntrack(tuple(port))])
            .await
            .expect("Should send");
        running.senders().packets.send(allow(tuple(port))).await.expect("Should send");
        running
            .senders()
            .conntrack
            .send(vec![conntrack(tuple(port)).expired()])
            .await
            .expect("Should send");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.shutdown().await.expect("Agent should stop");

    let text = std::fs::read_to_string(&log_path).expect("Flow log written");
    let logs: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("Each line is JSON"))
        .collect();
    // Allowed flows default to prefix aggregation, so both connections share one log.
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log["action"], "allow");
    assert_eq!(log["reporter"], "dst");
    assert_eq!(log["dest"]["aggregated_name"], "nginx-*");
    assert_eq!(log["num_flows_started"], 2);
    assert_eq!(log["num_flows_completed"], 2);
    assert_eq!(log["packets_in"], 6);
    assert_eq!(log["bytes_out"], 400);

    let metrics = std::fs::read_to_string(&metrics_path).expect("Metrics textfile written");
    assert!(metrics.contains("flowscope_collector_flow_table_size"));
}

#[tokio::test]
async fn test_dump_trigger_writes_flow_table() {
    let dir = tempfile::tempdir().expect("Should create temp dir");
    let dump_path = dir.path().join("dump");
    let mut config = Config::default();
    config.collector.stats_dump_file_path = dump_path.clone();

    let agent = Agent::new(config);
    agent.endpoints().insert_endpoint(&[ip("10.0.0.2")], nginx());
    let running = agent.start().expect("Agent should start");

    running
        .senders()
        .conntrack
        .send(vec![conntrack(tuple(40000))])
        .await
        .expect("Should send");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(running.trigger_dump());
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.shutdown().await.expect("Agent should stop");

    let dump = std::fs::read_to_string(&dump_path).expect("Dump written");
    let summary = flowscope::collector::dump::summarize_dump(&dump);
    assert_eq!(summary.records, 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_start() {
    let mut config = Config::default();
    config.flow_logs.flush_interval_secs = 0;
    assert!(Agent::new(config).start().is_err());
}
