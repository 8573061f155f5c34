use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};

pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "requests_total",
        "Total number of HTTP requests by route, method, and status",
        &["route", "method", "status"]
    )
    .expect("failed to register requests_total metric")
});

pub static UPSTREAM_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "upstream_errors_total",
        "Total number of upstream errors by error type",
        &["error_type"]
    )
    .expect("failed to register upstream_errors_total metric")
});

pub static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "request_latency_seconds",
        "Request latency in seconds by route",
        &["route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("failed to register request_latency_seconds metric")
});

pub static ACTIVE_CONNECTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "active_connections",
        "Number of currently active connections"
    )
    .expect("failed to register active_connections metric")
});

pub static BACKEND_INFLIGHT_CALLS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "backend_inflight_calls",
        "Number of backend calls currently in flight"
    )
    .expect("failed to register backend_inflight_calls metric")
});

static ACTIVE_CONNECTIONS_COUNTER: AtomicU64 = AtomicU64::new(0);
static BACKEND_INFLIGHT_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct ConnectionGuard;

impl ConnectionGuard {
    pub fn new() -> Self {
        let count = ACTIVE_CONNECTIONS_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
        ACTIVE_CONNECTIONS.set(count as f64);
        ConnectionGuard
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = ACTIVE_CONNECTIONS_COUNTER.fetch_sub(1, Ordering::SeqCst) - 1;
        ACTIVE_CONNECTIONS.set(count as f64);
    }
}

/// Scope guard around one backend call; makes the fan-out bound observable
/// on the `/metrics` endpoint.
pub struct BackendCallGuard;

impl BackendCallGuard {
    pub fn new() -> Self {
        let count = BACKEND_INFLIGHT_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
        BACKEND_INFLIGHT_CALLS.set(count as f64);
        BackendCallGuard
    }
}

impl Drop for BackendCallGuard {
    fn drop(&mut self) {
        let count = BACKEND_INFLIGHT_COUNTER.fetch_sub(1, Ordering::SeqCst) - 1;
        BACKEND_INFLIGHT_CALLS.set(count as f64);
    }
}

pub fn record_request(route: &str, method: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[route, method, &status.to_string()])
        .inc();
}

pub fn record_upstream_error(error_type: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

pub fn observe_request_latency(route: &str, latency_seconds: f64) {
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[route])
        .observe(latency_seconds);
}

pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("failed to convert metrics to string: {}", e))
}
