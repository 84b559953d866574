pub mod collector;
pub mod exporter;

pub use collector::CollectorMetrics;
pub use exporter::PrometheusExporter;
