//! Aggregation keys

use super::AggregationKind;
use crate::endpoint::{EndpointMetadata, FIELD_NOT_INCLUDED};
use crate::error::{FlowscopeError, Result};
use crate::metric::MetricUpdate;
use crate::rule::{RuleAction, RuleDirection};
use flowscope_common::Tuple;
use serde::Serialize;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    Allow,
    Deny,
}

impl FlowAction {
    pub fn from_rule_action(action: RuleAction) -> Self {
        match action {
            RuleAction::Deny => FlowAction::Deny,
            _ => FlowAction::Allow,
        }
    }
}

/// Which side of the flow produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowReporter {
    Src,
    Dst,
}

impl FlowReporter {
    pub fn from_direction(direction: RuleDirection) -> Self {
        match direction {
            RuleDirection::Ingress => FlowReporter::Dst,
            RuleDirection::Egress => FlowReporter::Src,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowService {
    pub namespace: String,
    pub name: String,
    pub port_name: String,
    pub port_num: u16,
}

impl FlowService {
    pub fn empty() -> Self {
        Self {
            namespace: FIELD_NOT_INCLUDED.to_string(),
            name: FIELD_NOT_INCLUDED.to_string(),
            port_name: FIELD_NOT_INCLUDED.to_string(),
            port_num: 0,
        }
    }

    fn from_update(update: &MetricUpdate) -> Self {
        match &update.dst_service {
            Some(svc) if !svc.name.is_empty() => Self {
                namespace: svc.namespace.clone(),
                name: svc.name.clone(),
                port_name: svc.port_name.clone(),
                port_num: update.dst_service_port,
            },
            _ => Self::empty(),
        }
    }
}

/// Tuple as it appears in a key. Folded fields are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowTuple {
    pub source_ip: Option<IpAddr>,
    pub dest_ip: Option<IpAddr>,
    pub proto: u8,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
}

impl FlowTuple {
    /// Whether `tuple` has the value of every field this key keeps.
    pub fn matches(&self, tuple: &Tuple) -> bool {
        self.proto == tuple.proto
            && self.source_ip.map_or(true, |ip| ip == tuple.src_ip())
            && self.dest_ip.map_or(true, |ip| ip == tuple.dst_ip())
            && self.source_port.map_or(true, |port| port == tuple.src_port)
            && self.dest_port.map_or(true, |port| port == tuple.dst_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowMeta {
    #[serde(flatten)]
    pub tuple: FlowTuple,
    pub source: EndpointMetadata,
    pub dest: EndpointMetadata,
    pub dest_service: FlowService,
    pub action: FlowAction,
    pub reporter: FlowReporter,
}

impl FlowMeta {
    /// Key for `update` at aggregation level `kind`.
    ///
    /// Fails when the update carries no rule at all, since the action and
    /// reporter side cannot be derived.
    pub fn from_update(update: &MetricUpdate, kind: AggregationKind, include_service: bool) -> Result<Self> {
        let rule = update.last_rule_id().ok_or_else(|| {
            FlowscopeError::InvalidMetricUpdate(format!("no rule id present: {}", update))
        })?;
        let t = &update.tuple;

        let meta = Self {
            tuple: FlowTuple {
                source_ip: Some(t.src_ip()),
                dest_ip: Some(t.dst_ip()),
                proto: t.proto,
                source_port: Some(t.src_port),
                dest_port: Some(t.dst_port),
            },
            source: EndpointMetadata::from_endpoint(update.src_ep.as_deref(), t.src),
            dest: EndpointMetadata::from_endpoint(update.dst_ep.as_deref(), t.dst),
            dest_service: if include_service {
                FlowService::from_update(update)
            } else {
                FlowService::empty()
            },
            action: FlowAction::from_rule_action(rule.action),
            reporter: FlowReporter::from_direction(rule.direction),
        };
        Ok(meta.fold(kind))
    }

    /// Project this key onto `kind`. Folding is idempotent and only ever
    /// removes detail, so a key can be folded to any level at or above the
    /// one it was built for.
    pub fn fold(mut self, kind: AggregationKind) -> Self {
        if kind >= AggregationKind::SourcePort {
            self.tuple.source_port = None;
        }
        if kind >= AggregationKind::PrefixName {
            self.tuple.source_ip = None;
            self.tuple.dest_ip = None;
            self.source.name = FIELD_NOT_INCLUDED.to_string();
            self.dest.name = FIELD_NOT_INCLUDED.to_string();
        }
        if kind >= AggregationKind::NoDestPorts {
            self.tuple.dest_port = None;
            self.dest_service.port_name = FIELD_NOT_INCLUDED.to_string();
        }
        self
    }
}
