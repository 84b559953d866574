//! Endpoint identity resolved for flow addresses
//!
//! Endpoints are snapshots handed out by the resolver as `Arc<Endpoint>`.
//! Records hold the most recent snapshot they saw; two snapshots describe the
//! same endpoint when their keys are equal, regardless of which allocation
//! they came from.

use crate::rule::{PolicyId, RuleDirection, RuleId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type Labels = BTreeMap<String, String>;

/// Placeholder for a metadata field that does not apply or was aggregated away.
pub const FIELD_NOT_INCLUDED: &str = "-";

/// Where the rules of a tier place their hits in a rule trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierData {
    /// Rule reported when the tier's end-of-tier action is a deny.
    pub implicit_drop_rule_id: Option<Arc<RuleId>>,
    pub end_of_tier_match_index: usize,
}

/// Per-direction policy layout of a local endpoint.
///
/// Every policy applying to the endpoint owns one slot of the rule trace, in
/// evaluation order; each tier owns an extra slot for its end-of-tier action,
/// and profiles share the final slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchData {
    pub policy_matches: HashMap<PolicyId, usize>,
    pub tier_data: HashMap<String, TierData>,
    pub profile_match_index: usize,
}

/// Ordered description of a tier used to lay out [`MatchData`].
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicies {
    pub tier: String,
    /// `(name, namespace)` of each policy, in evaluation order. Global policies
    /// use an empty namespace.
    pub policies: Vec<(String, String)>,
}

impl TierPolicies {
    pub fn new(tier: &str, policies: &[(&str, &str)]) -> Self {
        Self {
            tier: tier.to_string(),
            policies: policies
                .iter()
                .map(|(name, ns)| (name.to_string(), ns.to_string()))
                .collect(),
        }
    }
}

impl MatchData {
    pub fn from_tiers(direction: RuleDirection, tiers: &[TierPolicies]) -> Self {
        let mut data = MatchData::default();
        let mut idx = 0;
        for tier in tiers {
            let mut last_policy = None;
            for (name, namespace) in &tier.policies {
                data.policy_matches
                    .insert(PolicyId::new(&tier.tier, name, namespace), idx);
                last_policy = Some((name, namespace));
                idx += 1;
            }
            let implicit_drop_rule_id = last_policy.map(|(name, namespace)| {
                Arc::new(RuleId::implicit_drop(&tier.tier, name, namespace, direction))
            });
            data.tier_data.insert(
                tier.tier.clone(),
                TierData {
                    implicit_drop_rule_id,
                    end_of_tier_match_index: idx,
                },
            );
            idx += 1;
        }
        data.profile_match_index = idx;
        data
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub node: String,
    pub namespace: String,
    pub name: String,
    /// Name prefix shared by replicas of the same controller.
    pub generate_name: Option<String>,
    pub labels: Labels,
    pub ingress: MatchData,
    pub egress: MatchData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostEndpoint {
    pub hostname: String,
    pub name: String,
    pub local: bool,
    pub labels: Labels,
    pub ingress: MatchData,
    pub egress: MatchData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSet {
    /// `None` for global network sets.
    pub namespace: Option<String>,
    pub name: String,
    pub labels: Labels,
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    LocalWorkload(Workload),
    RemoteWorkload(Workload),
    Host(HostEndpoint),
    NetworkSet(NetworkSet),
}

impl Endpoint {
    pub fn is_local(&self) -> bool {
        match self {
            Endpoint::LocalWorkload(_) => true,
            Endpoint::Host(h) => h.local,
            Endpoint::RemoteWorkload(_) | Endpoint::NetworkSet(_) => false,
        }
    }

    /// Stable identity used to detect endpoint changes.
    pub fn key(&self) -> String {
        match self {
            Endpoint::LocalWorkload(w) | Endpoint::RemoteWorkload(w) => {
                format!("wep:{}/{}/{}", w.node, w.namespace, w.name)
            }
            Endpoint::Host(h) => format!("hep:{}/{}", h.hostname, h.name),
            Endpoint::NetworkSet(n) => match &n.namespace {
                Some(ns) => format!("ns:{}/{}", ns, n.name),
                None => format!("ns:{}", n.name),
            },
        }
    }

    /// Policy layout for traffic entering this endpoint; only local endpoints have one.
    pub fn ingress_match_data(&self) -> Option<&MatchData> {
        match self {
            Endpoint::LocalWorkload(w) => Some(&w.ingress),
            Endpoint::Host(h) if h.local => Some(&h.ingress),
            _ => None,
        }
    }

    pub fn egress_match_data(&self) -> Option<&MatchData> {
        match self {
            Endpoint::LocalWorkload(w) => Some(&w.egress),
            Endpoint::Host(h) if h.local => Some(&h.egress),
            _ => None,
        }
    }

    pub fn match_data(&self, direction: RuleDirection) -> Option<&MatchData> {
        match direction {
            RuleDirection::Ingress => self.ingress_match_data(),
            RuleDirection::Egress => self.egress_match_data(),
        }
    }

    pub fn labels(&self) -> &Labels {
        match self {
            Endpoint::LocalWorkload(w) | Endpoint::RemoteWorkload(w) => &w.labels,
            Endpoint::Host(h) => &h.labels,
            Endpoint::NetworkSet(n) => &n.labels,
        }
    }

    pub fn is_network_set(&self) -> bool {
        matches!(self, Endpoint::NetworkSet(_))
    }

    /// Short printable name used in dumps.
    pub fn display_name(&self) -> String {
        match self {
            Endpoint::LocalWorkload(w) | Endpoint::RemoteWorkload(w) => {
                format!("WEP({}/{}/{})", w.node, w.namespace, w.name)
            }
            Endpoint::Host(h) => format!("HEP({}/{})", h.hostname, h.name),
            Endpoint::NetworkSet(n) => format!(
                "NS({}/{})",
                n.namespace.as_deref().unwrap_or(FIELD_NOT_INCLUDED),
                n.name
            ),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Endpoint {}

/// True when `new` does not describe the same endpoint as `old`.
pub fn endpoint_changed(old: Option<&Arc<Endpoint>>, new: Option<&Arc<Endpoint>>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(a), Some(b)) => !Arc::ptr_eq(a, b) && a.key() != b.key(),
        _ => true,
    }
}

pub fn is_local(ep: Option<&Arc<Endpoint>>) -> bool {
    ep.map(|e| e.is_local()).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointType {
    #[serde(rename = "wep")]
    Workload,
    #[serde(rename = "hep")]
    Host,
    #[serde(rename = "ns")]
    NetworkSet,
    #[serde(rename = "net")]
    Network,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Workload => "wep",
            EndpointType::Host => "hep",
            EndpointType::NetworkSet => "ns",
            EndpointType::Network => "net",
        }
    }
}

/// Endpoint description as it appears in a flow log key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointMetadata {
    #[serde(rename = "type")]
    pub kind: EndpointType,
    pub namespace: String,
    pub name: String,
    pub aggregated_name: String,
}

impl EndpointMetadata {
    /// Metadata for `ep`, or for the bare address when no endpoint is known.
    pub fn from_endpoint(ep: Option<&Endpoint>, addr: [u8; 16]) -> Self {
        match ep {
            Some(Endpoint::LocalWorkload(w)) | Some(Endpoint::RemoteWorkload(w)) => {
                let aggregated_name = match &w.generate_name {
                    Some(prefix) if !prefix.is_empty() => format!("{}*", prefix),
                    _ => w.name.clone(),
                };
                Self {
                    kind: EndpointType::Workload,
                    namespace: w.namespace.clone(),
                    name: w.name.clone(),
                    aggregated_name,
                }
            }
            Some(Endpoint::Host(h)) => Self {
                kind: EndpointType::Host,
                namespace: FIELD_NOT_INCLUDED.to_string(),
                name: h.name.clone(),
                aggregated_name: h.hostname.clone(),
            },
            Some(Endpoint::NetworkSet(n)) => Self {
                kind: EndpointType::NetworkSet,
                namespace: n
                    .namespace
                    .clone()
                    .unwrap_or_else(|| FIELD_NOT_INCLUDED.to_string()),
                name: n.name.clone(),
                aggregated_name: n.name.clone(),
            },
            None => {
                let aggregated_name = if flowscope_common::is_private(addr) {
                    "pvt"
                } else {
                    "pub"
                };
                Self {
                    kind: EndpointType::Network,
                    namespace: FIELD_NOT_INCLUDED.to_string(),
                    name: FIELD_NOT_INCLUDED.to_string(),
                    aggregated_name: aggregated_name.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rule::RuleAction;

    pub fn local_workload(name: &str, tiers: &[TierPolicies]) -> Endpoint {
        Endpoint::LocalWorkload(Workload {
            node: "node1".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            generate_name: None,
            labels: Labels::new(),
            ingress: MatchData::from_tiers(RuleDirection::Ingress, tiers),
            egress: MatchData::from_tiers(RuleDirection::Egress, tiers),
        })
    }

    #[test]
    fn test_match_data_layout() {
        let tiers = vec![
            TierPolicies::new("tier1", &[("policy1", "default"), ("policy2", "default")]),
            TierPolicies::new("tier2", &[("gnp1", "")]),
        ];
        let md = MatchData::from_tiers(RuleDirection::Ingress, &tiers);

        assert_eq!(md.policy_matches[&PolicyId::new("tier1", "policy1", "default")], 0);
        assert_eq!(md.policy_matches[&PolicyId::new("tier1", "policy2", "default")], 1);
        assert_eq!(md.tier_data["tier1"].end_of_tier_match_index, 2);
        assert_eq!(md.policy_matches[&PolicyId::new("tier2", "gnp1", "")], 3);
        assert_eq!(md.tier_data["tier2"].end_of_tier_match_index, 4);
        assert_eq!(md.profile_match_index, 5);

        let drop = md.tier_data["tier1"]
            .implicit_drop_rule_id
            .as_ref()
            .expect("Tier with policies should have an implicit drop");
        assert_eq!(drop.name, "policy2");
        assert_eq!(drop.action, RuleAction::Deny);
    }

    #[test]
    fn test_endpoint_equality_is_by_key() {
        let a = Arc::new(local_workload("nginx", &[]));
        let mut w = match local_workload("nginx", &[]) {
            Endpoint::LocalWorkload(w) => w,
            _ => unreachable!(),
        };
        w.labels.insert("app".to_string(), "web".to_string());
        let b = Arc::new(Endpoint::LocalWorkload(w));
        let c = Arc::new(local_workload("redis", &[]));

        assert_eq!(*a, *b);
        assert!(!endpoint_changed(Some(&a), Some(&b)));
        assert!(endpoint_changed(Some(&a), Some(&c)));
        assert!(endpoint_changed(Some(&a), None));
        assert!(!endpoint_changed(None, None));
    }

    #[test]
    fn test_metadata_for_workload_and_unknown() {
        let ep = Endpoint::RemoteWorkload(Workload {
            node: "node2".to_string(),
            namespace: "kube-system".to_string(),
            name: "kube-dns-7cc87d595-pxvxb".to_string(),
            generate_name: Some("kube-dns-7cc87d595-".to_string()),
            labels: Labels::new(),
            ingress: MatchData::default(),
            egress: MatchData::default(),
        });
        assert!(!ep.is_local());
        assert!(ep.ingress_match_data().is_none());

        let meta = EndpointMetadata::from_endpoint(Some(&ep), [0; 16]);
        assert_eq!(meta.kind, EndpointType::Workload);
        assert_eq!(meta.aggregated_name, "kube-dns-7cc87d595-*");

        let pvt = flowscope_common::parse_16_bytes("10.1.2.3").expect("Should parse");
        let pub_ = flowscope_common::parse_16_bytes("8.8.8.8").expect("Should parse");
        assert_eq!(EndpointMetadata::from_endpoint(None, pvt).aggregated_name, "pvt");
        let meta = EndpointMetadata::from_endpoint(None, pub_);
        assert_eq!(meta.aggregated_name, "pub");
        assert_eq!(meta.kind.as_str(), "net");
        assert_eq!(meta.name, FIELD_NOT_INCLUDED);
    }
}
