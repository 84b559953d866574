//! Policy rule identity attached to rule-hit events and rule traces

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tier name used for profile rules, which are not part of any tier.
pub const PROFILE_TIER: &str = "__PROFILE__";
/// Placeholder used for every name field of the unknown rule.
pub const UNKNOWN: &str = "__UNKNOWN__";
/// Prefix carried by the names of staged (not enforced) policies.
pub const STAGED_PREFIX: &str = "staged:";

/// Rule index of the implicit drop at the end of a tier.
pub const INDEX_IMPLICIT_DROP: i32 = -1;
/// Rule index of the unknown rule.
pub const INDEX_UNKNOWN: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Pass,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Deny => "deny",
            RuleAction::Pass => "pass",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

impl RuleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleDirection::Ingress => "ingress",
            RuleDirection::Egress => "egress",
        }
    }
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a policy (or profile) independently of the rule that matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId {
    pub tier: String,
    pub name: String,
    pub namespace: String,
}

impl PolicyId {
    pub fn new(tier: &str, name: &str, namespace: &str) -> Self {
        Self {
            tier: tier.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

/// A single rule within a policy, as reported by the dataplane.
///
/// An empty `tier` denotes a profile rule. An empty `name` with a tier set
/// denotes the end-of-tier action of that tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId {
    pub tier: String,
    pub name: String,
    pub namespace: String,
    pub direction: RuleDirection,
    pub index: i32,
    pub action: RuleAction,
}

impl RuleId {
    pub fn new(
        tier: &str,
        name: &str,
        namespace: &str,
        index: i32,
        direction: RuleDirection,
        action: RuleAction,
    ) -> Self {
        Self {
            tier: tier.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            direction,
            index,
            action,
        }
    }

    /// Profile rule: a rule that is not part of a tier.
    pub fn profile(name: &str, index: i32, direction: RuleDirection, action: RuleAction) -> Self {
        Self::new("", name, "", index, direction, action)
    }

    /// End-of-tier action for `tier`.
    pub fn end_of_tier(tier: &str, direction: RuleDirection, action: RuleAction) -> Self {
        Self::new(tier, "", "", 0, direction, action)
    }

    /// Implicit drop of a policy, hit when none of its rules matched.
    pub fn implicit_drop(tier: &str, name: &str, namespace: &str, direction: RuleDirection) -> Self {
        Self::new(
            tier,
            name,
            namespace,
            INDEX_IMPLICIT_DROP,
            direction,
            RuleAction::Deny,
        )
    }

    /// Sentinel for metric updates that carry no resolved rule trace.
    pub fn unknown() -> Self {
        Self::new(
            UNKNOWN,
            UNKNOWN,
            UNKNOWN,
            INDEX_UNKNOWN,
            RuleDirection::Ingress,
            RuleAction::Allow,
        )
    }

    pub fn policy_id(&self) -> PolicyId {
        PolicyId::new(&self.tier, &self.name, &self.namespace)
    }

    pub fn is_profile(&self) -> bool {
        self.tier.is_empty()
    }

    pub fn is_end_of_tier(&self) -> bool {
        self.name.is_empty() && !self.tier.is_empty()
    }

    pub fn is_end_of_tier_pass(&self) -> bool {
        self.is_end_of_tier() && self.action == RuleAction::Pass
    }

    pub fn is_implicit_drop(&self) -> bool {
        self.index == INDEX_IMPLICIT_DROP && !self.name.is_empty()
    }

    pub fn is_staged(&self) -> bool {
        self.name.starts_with(STAGED_PREFIX)
    }

    pub fn is_unknown(&self) -> bool {
        self.index == INDEX_UNKNOWN && self.tier == UNKNOWN
    }

    /// Staged matches and passes never decide the fate of a packet.
    pub fn is_verdict(&self) -> bool {
        !self.is_staged() && self.action != RuleAction::Pass
    }

    pub fn index_str(&self) -> String {
        if self.index < 0 {
            "-".to_string()
        } else {
            self.index.to_string()
        }
    }

    /// `<tier>|<qualified name>|<action>` as it appears in flow log policy strings.
    pub fn flow_log_policy_name(&self) -> String {
        if self.is_unknown() {
            return format!("{}|{}|{}", UNKNOWN, UNKNOWN, self.action);
        }
        if self.is_profile() {
            return format!("{}|{}.{}|{}", PROFILE_TIER, PROFILE_TIER, self.name, self.action);
        }
        if self.namespace.is_empty() {
            format!("{}|{}.{}|{}", self.tier, self.tier, self.name, self.action)
        } else {
            format!(
                "{}|{}/{}.{}|{}",
                self.tier, self.namespace, self.tier, self.name, self.action
            )
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tier={} name={} namespace={} direction={} index={} action={}",
            self.tier, self.name, self.namespace, self.direction, self.index, self.action
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_classification() {
        let profile = RuleId::profile("kns.default", 0, RuleDirection::Ingress, RuleAction::Allow);
        assert!(profile.is_profile());
        assert!(!profile.is_end_of_tier());

        let eot = RuleId::end_of_tier("tier1", RuleDirection::Egress, RuleAction::Pass);
        assert!(eot.is_end_of_tier());
        assert!(eot.is_end_of_tier_pass());
        assert!(!eot.is_verdict());

        let drop = RuleId::implicit_drop("tier1", "policy1", "ns1", RuleDirection::Ingress);
        assert!(drop.is_implicit_drop());
        assert!(drop.is_verdict());

        let staged = RuleId::new(
            "tier1",
            "staged:policy1",
            "ns1",
            0,
            RuleDirection::Ingress,
            RuleAction::Deny,
        );
        assert!(staged.is_staged());
        assert!(!staged.is_verdict());

        assert!(RuleId::unknown().is_unknown());
    }

    #[test]
    fn test_flow_log_policy_name() {
        let namespaced = RuleId::new(
            "tier1",
            "policy1",
            "namespace1",
            3,
            RuleDirection::Ingress,
            RuleAction::Allow,
        );
        assert_eq!(
            namespaced.flow_log_policy_name(),
            "tier1|namespace1/tier1.policy1|allow"
        );
        assert_eq!(namespaced.index_str(), "3");

        let global = RuleId::new("default", "gnp", "", 0, RuleDirection::Egress, RuleAction::Deny);
        assert_eq!(global.flow_log_policy_name(), "default|default.gnp|deny");

        let drop = RuleId::implicit_drop("tier1", "policy1", "", RuleDirection::Ingress);
        assert_eq!(drop.index_str(), "-");
    }
}
