pub mod collector;
pub mod exporter;

pub use collector::ApiMetrics;
pub use exporter::PrometheusExporter;
