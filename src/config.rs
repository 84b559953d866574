//! Configuration surface for the collector and the flow log pipeline
//!
//! Loaded from YAML. Every field has a default so an empty document is a
//! valid configuration; `validate` rejects combinations that cannot work.

use crate::error::{FlowscopeError, Result};
use crate::flowlog::AggregationKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collector: CollectorConfig,
    pub flow_logs: FlowLogConfig,
    /// Refreshed by the agent with its self-metrics in Prometheus text format.
    pub prometheus_textfile_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Idle time after which a record is force-reported and removed.
    pub age_timeout_secs: u64,
    /// Grace period before a dirty, unreported record is force-reported.
    pub initial_reporting_delay_secs: u64,
    /// Sweep cadence.
    pub export_interval_secs: u64,
    /// Pending rule trace cadence; zero disables the ticker.
    pub policy_evaluation_interval_secs: u64,
    pub max_original_source_ips: usize,
    pub enable_network_sets: bool,
    pub enable_services: bool,
    pub enable_destination_domains_by_client: bool,
    /// Retry process lookups with the post-DNAT tuple on a miss.
    pub is_bpf_dataplane: bool,
    pub display_debug_trace_logs: bool,
    pub stats_dump_file_path: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            age_timeout_secs: 60,
            initial_reporting_delay_secs: 10,
            export_interval_secs: 1,
            policy_evaluation_interval_secs: 0,
            max_original_source_ips: 50,
            enable_network_sets: false,
            enable_services: false,
            enable_destination_domains_by_client: false,
            is_bpf_dataplane: false,
            display_debug_trace_logs: false,
            stats_dump_file_path: PathBuf::from("/var/log/flowscope/stats/dump"),
        }
    }
}

impl CollectorConfig {
    pub fn age_timeout(&self) -> Duration {
        Duration::from_secs(self.age_timeout_secs)
    }

    pub fn initial_reporting_delay(&self) -> Duration {
        Duration::from_secs(self.initial_reporting_delay_secs)
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }

    pub fn policy_evaluation_interval(&self) -> Option<Duration> {
        match self.policy_evaluation_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowLogConfig {
    pub flush_interval_secs: u64,
    /// Aggregation level index for allowed flows.
    pub aggregation_kind_for_allowed: u8,
    /// Aggregation level index for denied flows.
    pub aggregation_kind_for_denied: u8,
    pub include_labels: bool,
    pub include_policies: bool,
    pub include_service: bool,
    pub include_process: bool,
    pub per_flow_process_limit: usize,
    pub per_flow_process_args_limit: usize,
    pub nat_outgoing_port_limit: usize,
    pub max_original_source_ips: usize,
    pub max_domains: usize,
    /// JSON-lines output; flow logs are only aggregated when unset.
    pub file_path: Option<PathBuf>,
    /// Log shipper positions file used as the backpressure signal.
    pub positions_file_path: Option<PathBuf>,
    pub behind_threshold_bytes: u64,
}

impl Default for FlowLogConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 300,
            aggregation_kind_for_allowed: AggregationKind::PrefixName as u8,
            aggregation_kind_for_denied: AggregationKind::SourcePort as u8,
            include_labels: false,
            include_policies: false,
            include_service: false,
            include_process: false,
            per_flow_process_limit: 2,
            per_flow_process_args_limit: 5,
            nat_outgoing_port_limit: 3,
            max_original_source_ips: 50,
            max_domains: 5,
            file_path: None,
            positions_file_path: None,
            behind_threshold_bytes: 10 * 1024 * 1024,
        }
    }
}

impl FlowLogConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn allowed_kind(&self) -> AggregationKind {
        AggregationKind::from_level(i32::from(self.aggregation_kind_for_allowed))
    }

    pub fn denied_kind(&self) -> AggregationKind {
        AggregationKind::from_level(i32::from(self.aggregation_kind_for_denied))
    }
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let doc = std::fs::read_to_string(path)?;
        Self::from_yaml(&doc)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.collector;
        if c.export_interval_secs == 0 {
            return Err(FlowscopeError::ConfigError(
                "collector.export_interval_secs must be greater than zero".to_string(),
            ));
        }
        if c.initial_reporting_delay_secs > c.age_timeout_secs {
            return Err(FlowscopeError::ConfigError(format!(
                "collector.initial_reporting_delay_secs ({}) exceeds collector.age_timeout_secs ({})",
                c.initial_reporting_delay_secs, c.age_timeout_secs
            )));
        }

        let f = &self.flow_logs;
        if f.flush_interval_secs == 0 {
            return Err(FlowscopeError::ConfigError(
                "flow_logs.flush_interval_secs must be greater than zero".to_string(),
            ));
        }
        let max = AggregationKind::MAX as u8;
        for (name, level) in [
            ("aggregation_kind_for_allowed", f.aggregation_kind_for_allowed),
            ("aggregation_kind_for_denied", f.aggregation_kind_for_denied),
        ] {
            if level > max {
                return Err(FlowscopeError::ConfigError(format!(
                    "flow_logs.{} must be between 0 and {}, got {}",
                    name, max, level
                )));
            }
        }
        if f.include_process && f.per_flow_process_limit == 0 {
            return Err(FlowscopeError::ConfigError(
                "flow_logs.per_flow_process_limit must be greater than zero when processes are included"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
