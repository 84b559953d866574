//! Per-direction record of the policy rules a flow has hit

use crate::collector::counter::Counter;
use crate::rule::{RuleAction, RuleId};
use std::fmt;
use std::sync::Arc;

const RULE_TRACE_INIT_LEN: usize = 10;

/// Outcome of applying a rule hit to a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    /// The slot already held this rule.
    Unchanged,
    /// The slot was empty and now holds the rule.
    Set,
    /// The slot (or an earlier slot skipped by this hit) holds a different
    /// rule; the record must be reported and reset before replacing it.
    IsDifferent,
}

/// Rules hit in one direction, indexed by match slot.
///
/// Slots come from the local endpoint's [`MatchData`](crate::endpoint::MatchData):
/// hits within a direction arrive in slot order, so a hit that skips over an
/// occupied slot means the path through the policies has changed.
#[derive(Debug, Clone)]
pub struct RuleTrace {
    path: Vec<Option<Arc<RuleId>>>,
    pkts: Counter,
    bytes: Counter,
    dirty: bool,
    verdict_idx: Option<usize>,
    last_match_idx: usize,
}

impl Default for RuleTrace {
    fn default() -> Self {
        Self {
            path: vec![None; RULE_TRACE_INIT_LEN],
            pkts: Counter::default(),
            bytes: Counter::default(),
            dirty: false,
            verdict_idx: None,
            last_match_idx: 0,
        }
    }
}

impl RuleTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn maybe_resize_path(&mut self, match_idx: usize) {
        if match_idx >= self.path.len() {
            let grow = (match_idx / RULE_TRACE_INIT_LEN + 1) * RULE_TRACE_INIT_LEN;
            self.path.resize(self.path.len() + grow, None);
        }
    }

    pub fn add_rule_id(&mut self, rid: Arc<RuleId>, match_idx: usize, pkts: u64, bytes: u64) -> RuleMatch {
        self.maybe_resize_path(match_idx);

        for i in (self.last_match_idx + 1)..match_idx {
            if self.path[i].is_some() {
                return RuleMatch::IsDifferent;
            }
        }

        let result = match &self.path[match_idx] {
            None => {
                self.path[match_idx] = Some(rid.clone());
                RuleMatch::Set
            }
            Some(existing) if **existing != *rid => return RuleMatch::IsDifferent,
            Some(_) => RuleMatch::Unchanged,
        };

        self.dirty = true;
        if rid.is_verdict() {
            self.pkts.increase(pkts);
            self.bytes.increase(bytes);
            self.verdict_idx = Some(match_idx);
        }
        self.last_match_idx = match_idx;
        result
    }

    /// Overwrite the slot after a [`RuleMatch::IsDifferent`], clearing any
    /// slots the new hit skipped.
    pub fn replace_rule_id(&mut self, rid: Arc<RuleId>, match_idx: usize, pkts: u64, bytes: u64) {
        self.maybe_resize_path(match_idx);
        for i in (self.last_match_idx + 1)..match_idx {
            self.path[i] = None;
        }

        let is_verdict = rid.is_verdict();
        self.path[match_idx] = Some(rid);
        self.last_match_idx = match_idx;
        self.dirty = true;

        if is_verdict {
            self.pkts.reset_and_set(pkts);
            self.bytes.reset_and_set(bytes);
            self.verdict_idx = Some(match_idx);
        }
    }

    /// Index of the last slot still belonging to the tier of the slot at `from`.
    fn end_of_tier_index(&self, from: usize, verdict_idx: usize) -> usize {
        let tier = match &self.path[from] {
            Some(r) => &r.tier,
            None => return verdict_idx,
        };
        for j in (from + 1)..=verdict_idx {
            if let Some(r) = &self.path[j] {
                if &r.tier != tier {
                    return j - 1;
                }
            }
        }
        verdict_idx
    }

    /// Rules to report, up to and including the verdict.
    ///
    /// Enforced matches end their tier. Staged matches are all reported; a
    /// staged implicit drop only counts when its tier ended in a pass. End of
    /// tier passes are internal bookkeeping and never reported.
    pub fn reported_rules(&self) -> Vec<Arc<RuleId>> {
        let verdict_idx = match self.verdict_idx {
            Some(idx) => idx,
            None => return Vec::new(),
        };

        let mut rules = Vec::with_capacity(verdict_idx + 1);
        let mut i = 0;
        while i <= verdict_idx {
            let r = match &self.path[i] {
                Some(r) if !r.is_end_of_tier_pass() => r,
                _ => {
                    i += 1;
                    continue;
                }
            };

            if r.is_staged() {
                if r.is_implicit_drop() {
                    let final_idx = self.end_of_tier_index(i, verdict_idx);
                    let ends_in_pass = self.path[final_idx]
                        .as_ref()
                        .map(|f| f.is_end_of_tier_pass())
                        .unwrap_or(false);
                    if !ends_in_pass {
                        i += 1;
                        continue;
                    }
                }
                rules.push(r.clone());
                i += 1;
                continue;
            }

            rules.push(r.clone());
            i = self.end_of_tier_index(i, verdict_idx) + 1;
        }
        rules
    }

    /// Whether the reported rules contain an enforced or staged deny.
    pub fn has_deny_rule(&self) -> bool {
        self.reported_rules()
            .iter()
            .any(|r| r.action == RuleAction::Deny)
    }

    pub fn verdict_rule_id(&self) -> Option<&Arc<RuleId>> {
        self.verdict_idx.and_then(|idx| self.path[idx].as_ref())
    }

    pub fn found_verdict(&self) -> bool {
        self.verdict_idx.is_some()
    }

    /// Final action, or pass while the verdict is unknown.
    pub fn action(&self) -> RuleAction {
        self.verdict_rule_id()
            .map(|r| r.action)
            .unwrap_or(RuleAction::Pass)
    }

    pub fn to_verdict_string(&self) -> String {
        match self.verdict_rule_id() {
            Some(r) => format!("{}/{}/{}/{}", r.tier, r.name, r.index, r.action),
            None => String::new(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty_flag(&mut self) {
        self.dirty = false;
        self.pkts.reset_delta();
        self.bytes.reset_delta();
    }

    pub fn packets(&self) -> &Counter {
        &self.pkts
    }

    pub fn bytes(&self) -> &Counter {
        &self.bytes
    }

    /// Rule slots in order, including empty ones, for comparison with a
    /// recomputed trace.
    pub fn matched_rules(&self) -> Vec<Arc<RuleId>> {
        self.path.iter().flatten().cloned().collect()
    }
}

impl fmt::Display for RuleTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .reported_rules()
            .iter()
            .map(|r| format!("({})", r))
            .collect();
        write!(
            f,
            "path=[{}], action={} ctr={{packets={} bytes={}}}",
            parts.join(", "),
            self.action(),
            self.pkts.absolute(),
            self.bytes.absolute()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleDirection;

    fn rule(tier: &str, name: &str, action: RuleAction) -> Arc<RuleId> {
        Arc::new(RuleId::new(tier, name, "ns", 0, RuleDirection::Ingress, action))
    }

    #[test]
    fn test_verdict_sets_counters() {
        let mut rt = RuleTrace::new();
        let allow = rule("tier1", "policy1", RuleAction::Allow);

        assert_eq!(rt.add_rule_id(allow.clone(), 0, 1, 100), RuleMatch::Set);
        assert!(rt.found_verdict());
        assert!(rt.is_dirty());
        assert_eq!(rt.action(), RuleAction::Allow);
        assert_eq!(rt.packets().delta(), 1);

        assert_eq!(rt.add_rule_id(allow, 0, 2, 200), RuleMatch::Unchanged);
        assert_eq!(rt.packets().delta(), 3);
        assert_eq!(rt.bytes().delta(), 300);

        rt.clear_dirty_flag();
        assert!(!rt.is_dirty());
        assert_eq!(rt.packets().delta(), 0);
        assert_eq!(rt.packets().absolute(), 3);
    }

    #[test]
    fn test_different_rule_in_slot() {
        let mut rt = RuleTrace::new();
        rt.add_rule_id(rule("tier1", "policy1", RuleAction::Allow), 0, 1, 10);

        let deny = rule("tier1", "policy1", RuleAction::Deny);
        assert_eq!(rt.add_rule_id(deny.clone(), 0, 1, 10), RuleMatch::IsDifferent);
        assert_eq!(rt.action(), RuleAction::Allow);

        rt.replace_rule_id(deny, 0, 5, 50);
        assert_eq!(rt.action(), RuleAction::Deny);
        assert_eq!(rt.packets().absolute(), 5);
        assert!(rt.has_deny_rule());
    }

    #[test]
    fn test_skipped_slot_is_a_change() {
        let mut rt = RuleTrace::new();
        rt.add_rule_id(rule("tier1", "staged:p1", RuleAction::Deny), 0, 1, 10);
        rt.add_rule_id(rule("tier1", "p2", RuleAction::Pass), 1, 1, 10);
        rt.add_rule_id(rule("tier2", "p3", RuleAction::Allow), 3, 1, 10);

        // A later packet goes straight to slot 0 then 3 again: fine.
        assert_eq!(
            rt.add_rule_id(rule("tier1", "staged:p1", RuleAction::Deny), 0, 1, 10),
            RuleMatch::Unchanged
        );
        // Skipping from slot 0 past the occupied slot 1 to slot 3 is not.
        assert_eq!(
            rt.add_rule_id(rule("tier2", "p3", RuleAction::Allow), 3, 1, 10),
            RuleMatch::IsDifferent
        );
    }

    #[test]
    fn test_reported_rules_skip_rest_of_enforced_tier() {
        let mut rt = RuleTrace::new();
        let staged = rule("tier1", "staged:p1", RuleAction::Deny);
        let pass = Arc::new(RuleId::end_of_tier("tier1", RuleDirection::Ingress, RuleAction::Pass));
        let enforced = rule("tier2", "p2", RuleAction::Allow);

        rt.add_rule_id(staged.clone(), 0, 1, 10);
        rt.add_rule_id(pass, 1, 1, 10);
        rt.add_rule_id(enforced.clone(), 2, 1, 10);

        let reported = rt.reported_rules();
        assert_eq!(reported, vec![staged, enforced]);
        assert!(rt.has_deny_rule());
        assert_eq!(rt.to_verdict_string(), "tier2/p2/0/allow");
    }

    #[test]
    fn test_staged_implicit_drop_needs_end_of_tier_pass() {
        let drop = Arc::new(RuleId::implicit_drop(
            "tier1",
            "staged:p1",
            "ns",
            RuleDirection::Ingress,
        ));
        let allow = rule("tier2", "p2", RuleAction::Allow);

        let mut without_pass = RuleTrace::new();
        without_pass.add_rule_id(drop.clone(), 0, 1, 10);
        without_pass.add_rule_id(allow.clone(), 2, 1, 10);
        assert_eq!(without_pass.reported_rules(), vec![allow.clone()]);

        let mut with_pass = RuleTrace::new();
        with_pass.add_rule_id(drop.clone(), 0, 1, 10);
        with_pass.add_rule_id(
            Arc::new(RuleId::end_of_tier("tier1", RuleDirection::Ingress, RuleAction::Pass)),
            1,
            1,
            10,
        );
        with_pass.add_rule_id(allow.clone(), 2, 1, 10);
        assert_eq!(with_pass.reported_rules(), vec![drop, allow]);
    }

    #[test]
    fn test_path_grows_for_large_indexes() {
        let mut rt = RuleTrace::new();
        rt.add_rule_id(rule("tier1", "p1", RuleAction::Allow), 25, 1, 10);
        assert!(rt.found_verdict());
        assert_eq!(rt.matched_rules().len(), 1);
    }
}
