use crate::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::time::Duration;
use tokio::time::Instant;

const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Self-metrics of the collector task.
///
/// Owned by the collector and updated only from its task; `registry()` hands
/// a read-only view to the exporter.
pub struct CollectorMetrics {
    registry: Registry,
    pub conntrack_latency: Histogram,
    pub packet_info_latency: Histogram,
    pub dump_stats_latency: Histogram,
    pub dataplane_stats_latency: Histogram,
    dataplane_stats_errors_per_minute: IntGauge,
    flow_table_size: IntGauge,
    pub reporter_dropped_updates: IntCounter,
    error_window_start: Instant,
    errors_in_window: u64,
}

impl CollectorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let h = Histogram::with_opts(HistogramOpts::new(name, help))?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };
        let conntrack_latency = histogram(
            "flowscope_collector_conntrack_processing_latency_seconds",
            "Latency of processing a batch of conntrack entries.",
        )?;
        let packet_info_latency = histogram(
            "flowscope_collector_packet_info_processing_latency_seconds",
            "Latency of processing a rule-hit packet event.",
        )?;
        let dump_stats_latency = histogram(
            "flowscope_collector_dumpstats_latency_seconds",
            "Latency of writing the flow table dump.",
        )?;
        let dataplane_stats_latency = histogram(
            "flowscope_collector_dataplanestats_update_processing_latency_seconds",
            "Latency of merging a dataplane statistics update into the flow table.",
        )?;

        let dataplane_stats_errors_per_minute = IntGauge::new(
            "flowscope_collector_dataplanestats_update_processing_errors_per_minute",
            "Errors encountered while merging dataplane statistics in the last minute.",
        )?;
        registry.register(Box::new(dataplane_stats_errors_per_minute.clone()))?;

        let flow_table_size = IntGauge::new(
            "flowscope_collector_flow_table_size",
            "Number of flow records currently held by the collector.",
        )?;
        registry.register(Box::new(flow_table_size.clone()))?;

        let reporter_dropped_updates = IntCounter::new(
            "flowscope_collector_reporter_dropped_updates",
            "Metric updates that could not be handed to the reporter task.",
        )?;
        registry.register(Box::new(reporter_dropped_updates.clone()))?;

        Ok(Self {
            registry,
            conntrack_latency,
            packet_info_latency,
            dump_stats_latency,
            dataplane_stats_latency,
            dataplane_stats_errors_per_minute,
            flow_table_size,
            reporter_dropped_updates,
            error_window_start: Instant::now(),
            errors_in_window: 0,
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn set_flow_table_size(&self, size: usize) {
        self.flow_table_size.set(size as i64);
    }

    pub fn flow_table_size(&self) -> i64 {
        self.flow_table_size.get()
    }

    /// Count dataplane statistics errors in a rolling one-minute window.
    pub fn record_dataplane_stats_errors(&mut self, errors: u64) {
        let now = Instant::now();
        if now.duration_since(self.error_window_start) > ERROR_WINDOW {
            self.error_window_start = now;
            self.errors_in_window = errors;
        } else {
            self.errors_in_window += errors;
        }
        self.dataplane_stats_errors_per_minute
            .set(self.errors_in_window as i64);
    }

    pub fn dataplane_stats_errors_per_minute(&self) -> i64 {
        self.dataplane_stats_errors_per_minute.get()
    }
}
