use crate::metrics::collector::ApiMetrics;
use crate::Result;
use prometheus::{Encoder, TextEncoder};

/// Renders the metrics registry in the Prometheus text exposition format
#[derive(Clone)]
pub struct PrometheusExporter {
    metrics: ApiMetrics,
}

impl PrometheusExporter {
    pub fn new(metrics: ApiMetrics) -> Self {
        Self { metrics }
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    pub fn render(&self) -> Result<String> {
        let families = self.metrics.registry().gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::ApiError::MetricsError(e.to_string()))
    }
}
