//! Prometheus metrics for the monitor.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("ct_monitor_requests_total", "Requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )
        .expect("requests counter");
        registry
            .register(Box::new(requests.clone()))
            .expect("register metric");
        Self { registry, requests }
    }

    pub fn gather_text(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("encode metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
