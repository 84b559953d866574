//! Accumulated state behind one aggregation key

use super::log::FlowLog;
use super::meta::FlowMeta;
use super::stats::{FlowStatsByProcess, ProcessLimits};
use crate::collector::bounded_set::BoundedSet;
use crate::endpoint::Labels;
use crate::metric::MetricUpdate;
use crate::rule::RuleId;
use flowscope_common::Tuple;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// `<index>|<tier>|<policy>|<action>|<rule index>` strings of one rule trace.
pub type FlowPolicySet = BTreeSet<String>;

/// Caps applied to the accumulators of every spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecLimits {
    pub max_original_source_ips: usize,
    pub max_domains: usize,
    pub include_process: bool,
    pub process_limit: usize,
    pub process_args_limit: usize,
    pub nat_outgoing_port_limit: usize,
}

impl Default for SpecLimits {
    fn default() -> Self {
        Self {
            max_original_source_ips: 50,
            max_domains: 5,
            include_process: false,
            process_limit: 2,
            process_args_limit: 5,
            nat_outgoing_port_limit: 3,
        }
    }
}

impl SpecLimits {
    fn process_limits(&self) -> ProcessLimits {
        ProcessLimits {
            include_process: self.include_process,
            process_limit: self.process_limit,
            process_args_limit: self.process_args_limit,
            nat_outgoing_port_limit: self.nat_outgoing_port_limit,
        }
    }
}

/// Build the policy strings of a trace. Staged policies are dropped when
/// `include_staged` is false, and the indices of the remaining entries close
/// the gap they leave.
pub fn policy_set(rule_ids: &[Arc<RuleId>], include_staged: bool) -> FlowPolicySet {
    let mut set = FlowPolicySet::new();
    let mut staged = 0;
    for (idx, rule) in rule_ids.iter().enumerate() {
        if !include_staged && rule.is_staged() {
            staged += 1;
            continue;
        }
        set.insert(format!(
            "{}|{}|{}",
            idx - staged,
            rule.flow_log_policy_name(),
            rule.index_str()
        ));
    }
    set
}

fn push_unique(sets: &mut Vec<FlowPolicySet>, set: FlowPolicySet) {
    if !sets.contains(&set) {
        sets.push(set);
    }
}

/// Labels present with the same value on both sides.
fn intersect_labels(a: &Labels, b: &Labels) -> Labels {
    a.iter()
        .filter(|(k, v)| b.get(*k) == Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn labels_of(update: &MetricUpdate) -> (Labels, Labels) {
    let src = update
        .src_ep
        .as_ref()
        .map(|ep| ep.labels().clone())
        .unwrap_or_default();
    let dst = update
        .dst_ep
        .as_ref()
        .map(|ep| ep.labels().clone())
        .unwrap_or_default();
    (src, dst)
}

/// Everything one aggregation entry accumulates between two flushes.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    stats: FlowStatsByProcess,
    original_source_ips: BoundedSet,
    src_labels: Option<Labels>,
    dst_labels: Option<Labels>,
    all_policy_sets: Vec<FlowPolicySet>,
    enforced_policy_sets: Vec<FlowPolicySet>,
    pending_policy_set: FlowPolicySet,
    domains: BTreeSet<String>,
    max_domains: usize,
    /// Labels, policies and domains are rebuilt from the first update after a
    /// flush so that an idle interval does not lose them.
    reset_aggregated_data: bool,
}

impl FlowSpec {
    /// Create a spec holding the single update `update`.
    pub fn new(update: &MetricUpdate, limits: &SpecLimits) -> Self {
        let original_source_ips = match &update.orig_source_ips {
            Some(ips) => BoundedSet::from_slice_with_total_count(
                limits.max_original_source_ips,
                &ips.to_ips(),
                ips.total_count(),
            ),
            None => BoundedSet::new(limits.max_original_source_ips),
        };
        let (src, dst) = labels_of(update);
        let mut spec = Self {
            stats: FlowStatsByProcess::new(update, limits.process_limits()),
            original_source_ips,
            src_labels: Some(src),
            dst_labels: Some(dst),
            all_policy_sets: vec![policy_set(&update.rule_ids, true)],
            enforced_policy_sets: vec![policy_set(&update.rule_ids, false)],
            pending_policy_set: policy_set(&update.pending_rule_ids, true),
            domains: BTreeSet::new(),
            max_domains: limits.max_domains,
            reset_aggregated_data: false,
        };
        spec.aggregate_domains(&update.dst_domains);
        spec
    }

    pub fn aggregate(&mut self, update: &MetricUpdate) {
        if self.reset_aggregated_data {
            self.clear_aggregated_data();
        }

        let (src, dst) = labels_of(update);
        self.src_labels = Some(match self.src_labels.take() {
            Some(existing) => intersect_labels(&existing, &src),
            None => src,
        });
        self.dst_labels = Some(match self.dst_labels.take() {
            Some(existing) => intersect_labels(&existing, &dst),
            None => dst,
        });

        push_unique(&mut self.all_policy_sets, policy_set(&update.rule_ids, true));
        push_unique(&mut self.enforced_policy_sets, policy_set(&update.rule_ids, false));
        self.aggregate_domains(&update.dst_domains);
        if let Some(ips) = &update.orig_source_ips {
            self.original_source_ips.combine(ips);
        }
        self.stats.aggregate(update);

        self.pending_policy_set = policy_set(&update.pending_rule_ids, true);
    }

    /// Absorb an entry built at another aggregation level. Flows and
    /// statistics that `other` has not exported yet carry over exactly once.
    pub fn merge(&mut self, other: FlowSpec) {
        if self.reset_aggregated_data {
            self.clear_aggregated_data();
        }
        if !other.reset_aggregated_data {
            self.src_labels = match (self.src_labels.take(), other.src_labels) {
                (Some(a), Some(b)) => Some(intersect_labels(&a, &b)),
                (a, b) => a.or(b),
            };
            self.dst_labels = match (self.dst_labels.take(), other.dst_labels) {
                (Some(a), Some(b)) => Some(intersect_labels(&a, &b)),
                (a, b) => a.or(b),
            };
            for set in other.all_policy_sets {
                push_unique(&mut self.all_policy_sets, set);
            }
            for set in other.enforced_policy_sets {
                push_unique(&mut self.enforced_policy_sets, set);
            }
            let domains: Vec<String> = other.domains.into_iter().collect();
            self.aggregate_domains(&domains);
        }
        self.original_source_ips.combine(&other.original_source_ips);
        self.stats.merge(other.stats);
    }

    /// Move the flows accepted by `matches` into a spec of their own. The
    /// descriptive data is shared; original source IPs go with the split.
    pub fn split_off<F: Fn(&Tuple) -> bool>(&mut self, matches: &F) -> Option<FlowSpec> {
        let stats = self.stats.split_off(matches)?;
        let max_ips = self.original_source_ips.max_size();
        Some(FlowSpec {
            stats,
            original_source_ips: std::mem::replace(&mut self.original_source_ips, BoundedSet::new(max_ips)),
            src_labels: self.src_labels.clone(),
            dst_labels: self.dst_labels.clone(),
            all_policy_sets: self.all_policy_sets.clone(),
            enforced_policy_sets: self.enforced_policy_sets.clone(),
            pending_policy_set: self.pending_policy_set.clone(),
            domains: self.domains.clone(),
            max_domains: self.max_domains,
            reset_aggregated_data: self.reset_aggregated_data,
        })
    }

    /// No flow is left in this spec.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    fn clear_aggregated_data(&mut self) {
        self.all_policy_sets.clear();
        self.enforced_policy_sets.clear();
        self.pending_policy_set.clear();
        self.src_labels = None;
        self.dst_labels = None;
        self.domains.clear();
        self.reset_aggregated_data = false;
    }

    fn aggregate_domains(&mut self, domains: &[String]) {
        for name in domains {
            if self.domains.len() >= self.max_domains {
                return;
            }
            self.domains.insert(name.clone());
        }
    }

    pub fn contains_active_refs(&self, update: &MetricUpdate) -> bool {
        self.stats.contains_active_refs(update)
    }

    pub fn active_flows_count(&self) -> usize {
        self.stats.active_flows_count()
    }

    /// Drop per-process state without active flows; returns the active count.
    pub fn gc(&mut self) -> usize {
        self.stats.gc()
    }

    /// Start a new interval. Flows still open carry over.
    pub fn reset(&mut self) {
        self.stats.reset();
        self.original_source_ips.reset();
        self.reset_aggregated_data = true;
    }

    /// One flow log per process group and, when policies are included, per
    /// distinct rule trace observed.
    pub fn to_flow_logs(
        &self,
        meta: &FlowMeta,
        start_time: u64,
        end_time: u64,
        include_labels: bool,
        include_policies: bool,
    ) -> Vec<FlowLog> {
        let base = |stats| FlowLog {
            start_time,
            end_time,
            meta: meta.clone(),
            source_labels: include_labels.then(|| self.src_labels.clone().unwrap_or_default()),
            dest_labels: include_labels.then(|| self.dst_labels.clone().unwrap_or_default()),
            dest_domains: self.domains.iter().cloned().collect(),
            original_source_ips: self.original_source_ips.to_ips(),
            num_original_source_ips: self.original_source_ips.total_count(),
            process: stats,
            all_policies: None,
            enforced_policies: None,
            pending_policies: None,
        };

        let mut logs = Vec::new();
        for stats in self.stats.to_reported_stats() {
            if !include_policies {
                logs.push(base(stats));
                continue;
            }
            if self.all_policy_sets.len() > 1 {
                warn!(
                    "Flow {:?} split into {} flow logs, multiple rule traces observed",
                    meta.tuple,
                    self.all_policy_sets.len()
                );
            }
            let paired = self.all_policy_sets.len() == self.enforced_policy_sets.len();
            if !paired {
                warn!(
                    "Flow {:?} has {} rule traces but {} enforced traces, enforced policies omitted",
                    meta.tuple,
                    self.all_policy_sets.len(),
                    self.enforced_policy_sets.len()
                );
            }
            for (i, all) in self.all_policy_sets.iter().enumerate() {
                let mut log = base(stats.clone());
                log.all_policies = Some(all.clone());
                log.enforced_policies = if paired {
                    self.enforced_policy_sets.get(i).cloned()
                } else {
                    None
                };
                log.pending_policies = Some(self.pending_policy_set.clone());
                logs.push(log);
            }
        }
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowlog::AggregationKind;
    use crate::metric::UpdateType;
    use crate::rule::{RuleAction, RuleDirection};
    use flowscope_common::Tuple;
    use std::net::{IpAddr, Ipv4Addr};

    fn rule(tier: &str, name: &str, action: RuleAction) -> Arc<RuleId> {
        Arc::new(RuleId::new(
            tier,
            name,
            "namespace1",
            0,
            RuleDirection::Ingress,
            action,
        ))
    }

    fn update(rules: Vec<Arc<RuleId>>) -> MetricUpdate {
        let tuple = Tuple::from_ips(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            6,
            1000,
            80,
        );
        let mut mu = MetricUpdate::new(UpdateType::Report, tuple);
        mu.rule_ids = rules;
        mu.in_metric.delta_packets = 1;
        mu
    }

    #[test]
    fn test_policy_set_strings_and_staged_indices() {
        let rules = vec![
            rule("tier1", "staged:policy0", RuleAction::Deny),
            rule("tier1", "policy1", RuleAction::Allow),
        ];
        let all = policy_set(&rules, true);
        assert!(all.contains("0|tier1|namespace1/tier1.staged:policy0|deny|0"));
        assert!(all.contains("1|tier1|namespace1/tier1.policy1|allow|0"));

        let enforced = policy_set(&rules, false);
        assert_eq!(enforced.len(), 1);
        assert!(enforced.contains("0|tier1|namespace1/tier1.policy1|allow|0"));
    }

    #[test]
    fn test_distinct_traces_split_flow_logs() {
        let limits = SpecLimits::default();
        let first = update(vec![rule("tier1", "policy1", RuleAction::Allow)]);
        let second = update(vec![rule("tier1", "policy2", RuleAction::Allow)]);
        let mut spec = FlowSpec::new(&first, &limits);
        spec.aggregate(&second);
        spec.aggregate(&first);

        let meta = FlowMeta::from_update(&first, AggregationKind::Default, false).expect("key");
        let logs = spec.to_flow_logs(&meta, 0, 10, false, true);
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.enforced_policies.is_some()));
        assert!(logs[0].source_labels.is_none());

        let logs = spec.to_flow_logs(&meta, 0, 10, false, false);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].all_policies.is_none());
        assert_eq!(logs[0].process.stats.packets_in, 3);
    }

    #[test]
    fn test_domains_capped() {
        let limits = SpecLimits {
            max_domains: 2,
            ..Default::default()
        };
        let mut mu = update(vec![rule("tier1", "policy1", RuleAction::Allow)]);
        mu.dst_domains = vec!["a.com".into(), "b.com".into(), "c.com".into()];
        let spec = FlowSpec::new(&mu, &limits);
        assert_eq!(spec.domains.len(), 2);
    }

    #[test]
    fn test_reset_rebuilds_aggregated_data_lazily() {
        let limits = SpecLimits::default();
        let first = update(vec![rule("tier1", "policy1", RuleAction::Allow)]);
        let mut spec = FlowSpec::new(&first, &limits);
        spec.reset();
        // Nothing arrived since the reset, so the previous trace is kept.
        assert_eq!(spec.all_policy_sets.len(), 1);

        let second = update(vec![rule("tier1", "policy2", RuleAction::Allow)]);
        spec.aggregate(&second);
        assert_eq!(spec.all_policy_sets, vec![policy_set(&second.rule_ids, true)]);
        assert_eq!(spec.active_flows_count(), 1);
    }
}
