use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Metrics collector for the frontend.
pub struct MetricsCollector {
    registry: Registry,

    /// Total HTTP requests by method and status class
    pub http_requests_total: IntCounterVec,

    /// Request latency histogram
    pub http_request_duration: HistogramVec,

    /// Active client connections gauge
    pub active_connections: IntGauge,

    /// Connections closed by the overload drop policy
    pub dropped_connections: IntCounter,

    /// Translation cache hits / misses
    pub tcache_hits: IntCounter,
    pub tcache_misses: IntCounter,

    /// Upstream failures by error class
    pub upstream_failures: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("ferry_http_requests_total", "Total HTTP requests"),
            &["method", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("ferry_http_request_duration_seconds", "Request latency")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["method"],
        )?;

        let active_connections = IntGauge::new(
            "ferry_active_connections",
            "Number of active client connections",
        )?;

        let dropped_connections = IntCounter::new(
            "ferry_dropped_connections_total",
            "Connections closed by the overload drop policy",
        )?;

        let tcache_hits =
            IntCounter::new("ferry_tcache_hits_total", "Translation cache hits")?;
        let tcache_misses =
            IntCounter::new("ferry_tcache_misses_total", "Translation cache misses")?;

        let upstream_failures = IntCounterVec::new(
            Opts::new("ferry_upstream_failures_total", "Upstream failures"),
            &["class"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(dropped_connections.clone()))?;
        registry.register(Box::new(tcache_hits.clone()))?;
        registry.register(Box::new(tcache_misses.clone()))?;
        registry.register(Box::new(upstream_failures.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            active_connections,
            dropped_connections,
            tcache_hits,
            tcache_misses,
            upstream_failures,
        })
    }

    /// Record a completed HTTP request.
    pub fn record_request(&self, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.http_request_duration
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    /// Get Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to create metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_gather() {
        let m = MetricsCollector::new().unwrap();
        m.record_request("GET", 200, 0.005);
        m.record_request("GET", 502, 0.1);
        m.tcache_hits.inc();
        let text = m.gather_text();
        assert!(text.contains("ferry_http_requests_total"));
        assert!(text.contains("ferry_tcache_hits_total"));
    }
}
