//! Gateway metrics
//!
//! A dedicated registry (not the process-global default) so tests can
//! build as many instances as they like.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub rpc_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("highpress_http_requests_total", "HTTP requests handled by the gateway"),
            &["path", "status"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;

        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "highpress_http_request_duration_seconds",
                "HTTP request latency",
            ),
            &["path"],
        )?;
        registry.register(Box::new(http_duration.clone()))?;

        let rpc_failures = IntCounterVec::new(
            Opts::new("highpress_rpc_failures_total", "Outbound RPC failures by error kind"),
            &["service", "kind"],
        )?;
        registry.register(Box::new(rpc_failures.clone()))?;

        Ok(Self { registry, http_requests, http_duration, rpc_failures })
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.http_requests.with_label_values(&["/api/v1/health", "200"]).inc();
        metrics.rpc_failures.with_label_values(&["high-go-press-counter", "network"]).inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("highpress_http_requests_total"));
        assert!(text.contains("highpress_rpc_failures_total"));
    }

    #[test]
    fn independent_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.http_requests.with_label_values(&["/x", "200"]).inc();
        assert!(b.encode().unwrap().contains("highpress_http_requests_total"));
    }
}
