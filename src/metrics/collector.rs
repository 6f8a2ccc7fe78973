use crate::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

/// Request and third-party lifecycle metrics, registered on a private registry
///
/// Cheap to clone; every clone updates the same series.
#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    third_party_resources: IntGauge,
    teardown_failures: IntCounter,
}

impl ApiMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("apiplane_requests_total", "API requests by verb and HTTP status"),
            &["verb", "code"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "apiplane_request_duration_seconds",
                "API request latency by verb",
            ),
            &["verb"],
        )?;
        let third_party_resources = IntGauge::new(
            "apiplane_third_party_resources",
            "Third-party resource types currently installed",
        )?;
        let teardown_failures = IntCounter::new(
            "apiplane_teardown_failures_total",
            "Routes or keys left behind by third-party resource removal",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(third_party_resources.clone()))?;
        registry.register(Box::new(teardown_failures.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            third_party_resources,
            teardown_failures,
        })
    }

    pub fn observe_request(&self, verb: &str, code: u16, elapsed: Duration) {
        let code = code.to_string();
        self.requests_total
            .with_label_values(&[verb, code.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[verb])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_third_party_resources(&self, count: usize) {
        self.third_party_resources
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_teardown_failures(&self, count: usize) {
        self.teardown_failures.inc_by(count as u64);
    }

    pub fn requests(&self, verb: &str, code: u16) -> u64 {
        let code = code.to_string();
        self.requests_total
            .with_label_values(&[verb, code.as_str()])
            .get()
    }

    pub fn third_party_resources(&self) -> i64 {
        self.third_party_resources.get()
    }

    pub fn teardown_failures(&self) -> u64 {
        self.teardown_failures.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
