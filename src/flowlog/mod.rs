//! Flow log aggregation
//!
//! Metric updates from the collector are grouped under an aggregation key
//! whose granularity is one of four levels. Each level folds more of the
//! flow identity away than the one before it, so raising the level reduces
//! the number of flow logs produced per flush.

pub mod aggregator;
pub mod dispatcher;
pub mod log;
pub mod meta;
pub mod offset;
pub mod reporter;
pub mod spec;
pub mod stats;

pub use aggregator::FlowLogAggregator;
pub use dispatcher::{JsonLinesDispatcher, LogDispatcher};
pub use log::FlowLog;
pub use meta::{FlowAction, FlowMeta, FlowReporter, FlowService, FlowTuple};
pub use offset::{LogOffset, NoOpLogOffset, Offsets, PositionsFileLogOffset};
pub use reporter::FlowLogReporter;
pub use spec::{FlowSpec, SpecLimits};

use std::fmt;

/// Aggregation granularity, from the full 5-tuple to per-destination-service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum AggregationKind {
    /// Full 5-tuple.
    #[default]
    Default = 0,
    /// Source port folded.
    SourcePort = 1,
    /// Addresses and source port folded, endpoints grouped by name prefix.
    PrefixName = 2,
    /// As `PrefixName`, with the destination port folded too.
    NoDestPorts = 3,
}

impl AggregationKind {
    pub const MIN: AggregationKind = AggregationKind::Default;
    pub const MAX: AggregationKind = AggregationKind::NoDestPorts;

    pub const ALL: [AggregationKind; 4] = [
        AggregationKind::Default,
        AggregationKind::SourcePort,
        AggregationKind::PrefixName,
        AggregationKind::NoDestPorts,
    ];

    /// Level for an arbitrary index, clamped to `[MIN, MAX]`.
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => AggregationKind::Default,
            1 => AggregationKind::SourcePort,
            2 => AggregationKind::PrefixName,
            _ => AggregationKind::NoDestPorts,
        }
    }

    pub fn level(self) -> i32 {
        self as i32
    }

    /// Coarser by `steps`, saturating at `MAX`.
    pub fn increase(self, steps: i32) -> Self {
        Self::from_level(self.level().saturating_add(steps))
    }

    /// Finer by `steps`, saturating at `MIN`.
    pub fn decrease(self, steps: i32) -> Self {
        Self::from_level(self.level().saturating_sub(steps))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Default => "default",
            AggregationKind::SourcePort => "source-port",
            AggregationKind::PrefixName => "prefix-name",
            AggregationKind::NoDestPorts => "no-dest-ports",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AggregationKind::Default => "full 5-tuple",
            AggregationKind::SourcePort => "source port folded",
            AggregationKind::PrefixName => {
                "addresses and source port folded, endpoints grouped by name prefix"
            }
            AggregationKind::NoDestPorts => "as prefix-name with destination ports folded",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
