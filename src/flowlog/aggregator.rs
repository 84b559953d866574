//! Groups metric updates into flow logs at an adjustable granularity

use super::log::FlowLog;
use super::meta::{FlowAction, FlowMeta};
use super::spec::{FlowSpec, SpecLimits};
use super::AggregationKind;
use crate::config::FlowLogConfig;
use crate::error::{FlowscopeError, Result};
use crate::metric::MetricUpdate;
use flowscope_common::Tuple;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
struct FlowEntry {
    spec: FlowSpec,
    /// Level the key was built at.
    level: AggregationKind,
    should_export: bool,
}

/// Aggregates metric updates by [`FlowMeta`] and turns them into flow logs
/// on every flush.
///
/// Keys always reflect the level in force when they were created. After a
/// level change, entries with an older level are not rewritten; they are
/// folded into the new key the next time one of their flows is fed.
#[derive(Debug)]
pub struct FlowLogAggregator {
    entries: HashMap<FlowMeta, FlowEntry>,
    default_level: AggregationKind,
    current_level: AggregationKind,
    /// Some entries were built at a level other than the current one.
    level_changed: bool,
    action_filter: Option<FlowAction>,
    include_labels: bool,
    include_policies: bool,
    include_service: bool,
    limits: SpecLimits,
    interval_start: u64,
    display_debug_trace_logs: bool,
}

impl FlowLogAggregator {
    pub fn new(level: AggregationKind) -> Self {
        Self {
            entries: HashMap::new(),
            default_level: level,
            current_level: level,
            level_changed: false,
            action_filter: None,
            include_labels: false,
            include_policies: false,
            include_service: false,
            limits: SpecLimits::default(),
            interval_start: unix_now(),
            display_debug_trace_logs: false,
        }
    }

    /// Aggregator for flows whose verdict is `action`, using the level and
    /// options configured for that action.
    pub fn from_config(config: &FlowLogConfig, action: FlowAction) -> Self {
        let level = match action {
            FlowAction::Allow => config.allowed_kind(),
            FlowAction::Deny => config.denied_kind(),
        };
        Self::new(level)
            .for_action(action)
            .include_labels(config.include_labels)
            .include_policies(config.include_policies)
            .include_service(config.include_service)
            .with_limits(SpecLimits {
                max_original_source_ips: config.max_original_source_ips,
                max_domains: config.max_domains,
                include_process: config.include_process,
                process_limit: config.per_flow_process_limit,
                process_args_limit: config.per_flow_process_args_limit,
                nat_outgoing_port_limit: config.nat_outgoing_port_limit,
            })
    }

    /// Only aggregate updates whose verdict is `action`.
    pub fn for_action(mut self, action: FlowAction) -> Self {
        self.action_filter = Some(action);
        self
    }

    pub fn include_labels(mut self, include: bool) -> Self {
        self.include_labels = include;
        self
    }

    pub fn include_policies(mut self, include: bool) -> Self {
        self.include_policies = include;
        self
    }

    pub fn include_service(mut self, include: bool) -> Self {
        self.include_service = include;
        self
    }

    pub fn with_limits(mut self, limits: SpecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_debug_trace_logs(mut self, enabled: bool) -> Self {
        self.display_debug_trace_logs = enabled;
        self
    }

    pub fn action_filter(&self) -> Option<FlowAction> {
        self.action_filter
    }

    pub fn current_level(&self) -> AggregationKind {
        self.current_level
    }

    pub fn default_level(&self) -> AggregationKind {
        self.default_level
    }

    pub fn level_changed(&self) -> bool {
        self.level_changed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Switch the level used for new keys without flushing.
    pub fn adjust_level(&mut self, level: AggregationKind) {
        if level != self.current_level {
            info!(
                "Flow log aggregation level changed from {} to {}",
                self.current_level, level
            );
            self.current_level = level;
            self.level_changed = true;
        }
    }

    pub fn feed(&mut self, update: &MetricUpdate) -> Result<()> {
        let rule = update.last_rule_id().ok_or_else(|| {
            FlowscopeError::InvalidMetricUpdate(format!("no rule id present: {}", update))
        })?;
        if let Some(filter) = self.action_filter {
            if FlowAction::from_rule_action(rule.action) != filter {
                return Ok(());
            }
        }

        let meta = FlowMeta::from_update(update, self.current_level, self.include_service)?;
        if let Some(entry) = self.entries.get_mut(&meta) {
            if self.display_debug_trace_logs {
                debug!("Aggregating {} into {:?}", update, meta.tuple);
            }
            entry.spec.aggregate(update);
            entry.should_export = true;
            return Ok(());
        }

        let mut spec = FlowSpec::new(update, &self.limits);
        if self.level_changed {
            self.absorb_stale_entries(&meta, update, &mut spec);
        }

        if self.display_debug_trace_logs {
            debug!("New flow log entry {:?} for {}", meta.tuple, update);
        }
        self.entries.insert(
            meta,
            FlowEntry {
                spec,
                level: self.current_level,
                should_export: true,
            },
        );
        Ok(())
    }

    /// Pull the flows of `meta` out of entries built at another level.
    ///
    /// A finer entry folds into `meta` as a whole. A coarser entry holds
    /// flows of several finer keys, so it only gives up the flows that
    /// belong to `meta` and is dropped once none are left.
    fn absorb_stale_entries(&mut self, meta: &FlowMeta, update: &MetricUpdate, spec: &mut FlowSpec) {
        let level = self.current_level;
        let stale: Vec<(FlowMeta, AggregationKind)> = self
            .entries
            .iter()
            .filter(|(key, entry)| match entry.level.cmp(&level) {
                Ordering::Equal => false,
                Ordering::Less => {
                    entry.spec.contains_active_refs(update) || (*key).clone().fold(level) == *meta
                }
                Ordering::Greater => {
                    entry.spec.contains_active_refs(update) || meta.clone().fold(entry.level) == **key
                }
            })
            .map(|(key, entry)| (key.clone(), entry.level))
            .collect();

        for (key, entry_level) in stale {
            if entry_level < level {
                if let Some(entry) = self.entries.remove(&key) {
                    debug!(
                        "Merging {:?} built at level {} into level {}",
                        key.tuple, entry_level, level
                    );
                    spec.merge(entry.spec);
                }
                continue;
            }
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if let Some(flows) = entry.spec.split_off(&|t: &Tuple| meta.tuple.matches(t)) {
                debug!(
                    "Moving flows of {:?} out of {:?} built at level {}",
                    meta.tuple, key.tuple, entry_level
                );
                spec.merge(flows);
            }
            if entry.spec.is_empty() {
                self.entries.remove(&key);
            }
        }
        self.level_changed = self.entries.values().any(|e| e.level != level);
    }

    /// Export the current interval and switch to `new_level`.
    ///
    /// Every exportable entry yields its flow logs. Afterwards entries
    /// without active flows are dropped, the rest start a new interval, and
    /// entries built at a level other than `new_level` stop exporting until
    /// they are merged forward.
    pub fn get_and_calibrate(&mut self, new_level: AggregationKind) -> Vec<FlowLog> {
        let end_time = unix_now();
        let start_time = self.interval_start;
        let include_labels = self.include_labels;
        let include_policies = self.include_policies;

        if new_level != self.current_level {
            info!(
                "Flow log aggregation level changed from {} to {}",
                self.current_level, new_level
            );
        }

        let mut logs = Vec::new();
        self.entries.retain(|meta, entry| {
            if entry.should_export {
                logs.extend(entry.spec.to_flow_logs(
                    meta,
                    start_time,
                    end_time,
                    include_labels,
                    include_policies,
                ));
            }
            if entry.spec.gc() == 0 {
                return false;
            }
            entry.spec.reset();
            if entry.level != new_level {
                entry.should_export = false;
            }
            true
        });

        self.interval_start = end_time;
        self.current_level = new_level;
        self.level_changed = self.entries.values().any(|e| e.level != new_level);
        debug!(
            "Flushed {} flow logs, {} entries remain at level {}",
            logs.len(),
            self.entries.len(),
            new_level
        );
        logs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flowlog::FlowReporter;
    use crate::metric::UpdateType;
    use crate::rule::{RuleAction, RuleDirection, RuleId};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    pub fn update(update_type: UpdateType, src_port: u16, action: RuleAction) -> MetricUpdate {
        let tuple = Tuple::from_ips(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            6,
            src_port,
            80,
        );
        let mut mu = MetricUpdate::new(update_type, tuple);
        mu.rule_ids = vec![Arc::new(RuleId::new(
            "tier1",
            "policy1",
            "default",
            0,
            RuleDirection::Ingress,
            action,
        ))];
        mu.in_metric.delta_packets = 1;
        mu.in_metric.delta_bytes = 10;
        mu
    }

    fn allow(src_port: u16) -> MetricUpdate {
        update(UpdateType::Report, src_port, RuleAction::Allow)
    }

    #[test]
    fn test_default_level_keeps_source_ports_apart() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");

        let logs = agg.get_and_calibrate(AggregationKind::Default);
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.meta.reporter == FlowReporter::Dst));
    }

    #[test]
    fn test_source_port_level_groups_updates() {
        let mut agg = FlowLogAggregator::new(AggregationKind::SourcePort);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");

        let logs = agg.get_and_calibrate(AggregationKind::SourcePort);
        assert_eq!(logs.len(), 1);
        let stats = &logs[0].process.stats;
        assert_eq!(stats.num_flows, 2);
        assert_eq!(stats.num_flows_started, 2);
        assert_eq!(stats.packets_in, 2);
        assert_eq!(logs[0].meta.tuple.source_port, None);
    }

    #[test]
    fn test_action_filter_skips_other_verdicts() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default).for_action(FlowAction::Deny);
        agg.feed(&allow(1000)).expect("feed");
        assert!(agg.is_empty());

        agg.feed(&update(UpdateType::Report, 1000, RuleAction::Deny))
            .expect("feed");
        let logs = agg.get_and_calibrate(AggregationKind::Default);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].meta.action, FlowAction::Deny);
    }

    #[test]
    fn test_update_without_rule_is_rejected() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default);
        let mut mu = allow(1000);
        mu.rule_ids.clear();
        assert!(agg.feed(&mu).is_err());
        assert!(agg.is_empty());
    }

    #[test]
    fn test_flush_resets_open_flows_and_drops_completed() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");
        agg.feed(&update(UpdateType::Expire, 1001, RuleAction::Allow))
            .expect("feed");

        assert_eq!(agg.get_and_calibrate(AggregationKind::Default).len(), 2);
        assert_eq!(agg.len(), 1);

        // The open flow is reported again with a fresh interval.
        let logs = agg.get_and_calibrate(AggregationKind::Default);
        assert_eq!(logs.len(), 1);
        let stats = &logs[0].process.stats;
        assert_eq!(stats.num_flows, 1);
        assert_eq!(stats.num_flows_started, 0);
        assert_eq!(stats.packets_in, 0);
        assert!(logs[0].start_time <= logs[0].end_time);
    }

    #[test]
    fn test_level_change_merges_unexported_statistics() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");

        agg.adjust_level(AggregationKind::SourcePort);
        assert!(agg.level_changed());
        agg.feed(&allow(1001)).expect("feed");
        assert_eq!(agg.len(), 1);

        let logs = agg.get_and_calibrate(AggregationKind::SourcePort);
        assert_eq!(logs.len(), 1);
        let stats = &logs[0].process.stats;
        assert_eq!(stats.packets_in, 4);
        assert_eq!(stats.bytes_in, 40);
        assert_eq!(stats.num_flows, 2);
        assert_eq!(stats.num_flows_started, 2);
        assert!(!agg.level_changed());
    }

    #[test]
    fn test_level_change_at_flush_keeps_flow_counts() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");

        assert_eq!(agg.get_and_calibrate(AggregationKind::SourcePort).len(), 2);
        assert_eq!(agg.current_level(), AggregationKind::SourcePort);
        assert!(agg.level_changed());

        // Entries of the old level wait to be merged and are not exported.
        assert!(agg.get_and_calibrate(AggregationKind::SourcePort).is_empty());

        agg.feed(&allow(1000)).expect("feed");
        let logs = agg.get_and_calibrate(AggregationKind::SourcePort);
        assert_eq!(logs.len(), 1);
        let stats = &logs[0].process.stats;
        assert_eq!(stats.packets_in, 1);
        assert_eq!(stats.num_flows, 2);
        assert_eq!(stats.num_flows_started, 0);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_recovery_to_finer_level_counts_each_flow_once() {
        let mut agg = FlowLogAggregator::new(AggregationKind::Default);
        agg.adjust_level(AggregationKind::SourcePort);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");
        assert_eq!(agg.get_and_calibrate(AggregationKind::Default).len(), 1);
        assert!(agg.level_changed());

        agg.feed(&allow(1000)).expect("feed");
        assert_eq!(agg.len(), 2, "Only the flow on port 1000 leaves the coarse entry");
        agg.feed(&allow(1001)).expect("feed");
        assert_eq!(agg.len(), 2);
        assert!(!agg.level_changed());
        for port in [1000, 1001] {
            agg.feed(&update(UpdateType::Expire, port, RuleAction::Allow))
                .expect("feed");
        }

        let mut logs = agg.get_and_calibrate(AggregationKind::Default);
        logs.sort_by_key(|l| l.meta.tuple.source_port);
        assert_eq!(logs.len(), 2);
        for (log, port) in logs.iter().zip([1000, 1001]) {
            let stats = &log.process.stats;
            assert_eq!(log.meta.tuple.source_port, Some(port));
            assert_eq!(stats.num_flows, 1);
            assert_eq!(stats.num_flows_started, 0);
            assert_eq!(stats.num_flows_completed, 1);
            assert_eq!(stats.packets_in, 2);
        }

        assert_eq!(agg.len(), 0);
        assert!(agg.get_and_calibrate(AggregationKind::Default).is_empty());
    }

    #[test]
    fn test_recovery_keeps_unclaimed_flows_in_coarse_entry() {
        let mut agg = FlowLogAggregator::new(AggregationKind::SourcePort);
        agg.feed(&allow(1000)).expect("feed");
        agg.feed(&allow(1001)).expect("feed");
        agg.get_and_calibrate(AggregationKind::Default);

        agg.feed(&update(UpdateType::Expire, 1000, RuleAction::Allow))
            .expect("feed");
        let logs = agg.get_and_calibrate(AggregationKind::Default);
        assert_eq!(logs.len(), 1, "The coarse entry waits for its own flows");
        assert_eq!(logs[0].process.stats.num_flows, 1);
        assert_eq!(agg.len(), 1);
        assert!(agg.level_changed());

        agg.feed(&update(UpdateType::Expire, 1001, RuleAction::Allow))
            .expect("feed");
        assert!(!agg.level_changed());
        assert_eq!(agg.get_and_calibrate(AggregationKind::Default).len(), 1);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_from_config_applies_levels_and_filters() {
        let config = FlowLogConfig::default();
        let allowed = FlowLogAggregator::from_config(&config, FlowAction::Allow);
        let denied = FlowLogAggregator::from_config(&config, FlowAction::Deny);
        assert_eq!(allowed.default_level(), AggregationKind::PrefixName);
        assert_eq!(denied.default_level(), AggregationKind::SourcePort);
        assert_eq!(denied.action_filter(), Some(FlowAction::Deny));
    }
}
