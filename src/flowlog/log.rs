use super::meta::FlowMeta;
use super::spec::FlowPolicySet;
use super::stats::FlowProcessReportedStats;
use crate::endpoint::Labels;
use serde::Serialize;
use std::net::IpAddr;

/// One aggregated flow record for an interval, ready to be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowLog {
    /// Interval start, unix seconds.
    pub start_time: u64,
    /// Interval end, unix seconds.
    pub end_time: u64,
    #[serde(flatten)]
    pub meta: FlowMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_labels: Option<Labels>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_labels: Option<Labels>,
    pub dest_domains: Vec<String>,
    pub original_source_ips: Vec<IpAddr>,
    pub num_original_source_ips: usize,
    #[serde(flatten)]
    pub process: FlowProcessReportedStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_policies: Option<FlowPolicySet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforced_policies: Option<FlowPolicySet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_policies: Option<FlowPolicySet>,
}

impl FlowLog {
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
