//! Tracing initialization and the in-process metrics registry.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::Result;

/// Initialize the global tracing subscriber from `config.log`. JSON output
/// by default; `format = "pretty"` switches to a human-readable layout for
/// local development; `format = "journald"` (requires the `journald`
/// feature) logs straight to the systemd journal instead of stdout.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "journald")]
    if config.log.format == "journald" {
        use tracing_subscriber::prelude::*;
        let journald = tracing_journald::layer()
            .map_err(|e| crate::error::Error::Internal(format!("journald unavailable: {e}")))?;
        tracing_subscriber::registry().with(filter).with(journald).init();
        tracing::info!("tracing initialized (journald)");
        return Ok(());
    }

    if config.log.format == "pretty" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }

    tracing::info!("tracing initialized");
    Ok(())
}

pub fn shutdown_tracing() {
    tracing::info!("tracing shutdown complete");
}

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A fixed-bucket latency histogram; bucket boundaries in milliseconds.
#[derive(Debug)]
struct Histogram {
    bounds_ms: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(bounds_ms: Vec<f64>) -> Self {
        let buckets = (0..=bounds_ms.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds_ms,
            buckets,
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_ms: f64) {
        let bucket = self
            .bounds_ms
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(self.bounds_ms.len());
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (self.count.load(Ordering::Relaxed), self.sum_ms.load(Ordering::Relaxed))
    }
}

const LATENCY_BUCKETS_MS: &[f64] = &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

/// Process-wide counters and histograms. Cardinality on labeled metrics
/// (route id, status, reason) is bounded by the number of configured
/// routes and error kinds, so a `DashMap` keyed by label tuple is safe.
pub struct Metrics {
    requests_total: DashMap<(String, u16, String), Counter>,
    auth_failures: DashMap<String, Counter>,
    rate_limit_denials: DashMap<String, Counter>,
    upstream_errors: DashMap<String, Counter>,
    request_latency: Histogram,
    upstream_latency: Histogram,
    in_flight: AtomicI64,
    upstream_pool_in_use: AtomicI64,
    store_available: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_total: DashMap::new(),
            auth_failures: DashMap::new(),
            rate_limit_denials: DashMap::new(),
            upstream_errors: DashMap::new(),
            request_latency: Histogram::new(LATENCY_BUCKETS_MS.to_vec()),
            upstream_latency: Histogram::new(LATENCY_BUCKETS_MS.to_vec()),
            in_flight: AtomicI64::new(0),
            upstream_pool_in_use: AtomicI64::new(0),
            store_available: AtomicI64::new(1),
        }
    }

    pub fn record_request(&self, route_id: &str, method: &str, status: u16, total_ms: f64) {
        self.requests_total
            .entry((route_id.to_string(), status, method.to_string()))
            .or_default()
            .incr();
        self.request_latency.observe(total_ms);
    }

    pub fn record_upstream_latency(&self, upstream_ms: f64) {
        self.upstream_latency.observe(upstream_ms);
    }

    pub fn record_auth_failure(&self, reason: &str) {
        self.auth_failures.entry(reason.to_string()).or_default().incr();
    }

    pub fn record_rate_limit_denial(&self, rule_key: &str) {
        self.rate_limit_denials.entry(rule_key.to_string()).or_default().incr();
    }

    pub fn record_upstream_error(&self, kind: &str) {
        self.upstream_errors.entry(kind.to_string()).or_default().incr();
    }

    pub fn in_flight_inc(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight_dec(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn upstream_pool_inc(&self) {
        self.upstream_pool_in_use.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_pool_dec(&self) {
        self.upstream_pool_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_store_available(&self, available: bool) {
        self.store_available.store(available as i64, Ordering::Relaxed);
    }

    /// Render in Prometheus text exposition format for the `/metrics` admin endpoint.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP gateway_requests_total Total requests by route, status, and method\n");
        out.push_str("# TYPE gateway_requests_total counter\n");
        for entry in self.requests_total.iter() {
            let ((route, status, method), counter) = (entry.key(), entry.value());
            out.push_str(&format!(
                "gateway_requests_total{{route=\"{}\",status=\"{}\",method=\"{}\"}} {}\n",
                route,
                status,
                method,
                counter.get()
            ));
        }

        out.push_str("# HELP gateway_auth_failures_total Authentication failures by reason\n");
        out.push_str("# TYPE gateway_auth_failures_total counter\n");
        for entry in self.auth_failures.iter() {
            out.push_str(&format!(
                "gateway_auth_failures_total{{reason=\"{}\"}} {}\n",
                entry.key(),
                entry.value().get()
            ));
        }

        out.push_str("# HELP gateway_rate_limit_denials_total Rate-limit denials by key\n");
        out.push_str("# TYPE gateway_rate_limit_denials_total counter\n");
        for entry in self.rate_limit_denials.iter() {
            out.push_str(&format!(
                "gateway_rate_limit_denials_total{{key=\"{}\"}} {}\n",
                entry.key(),
                entry.value().get()
            ));
        }

        out.push_str("# HELP gateway_upstream_errors_total Upstream errors by kind\n");
        out.push_str("# TYPE gateway_upstream_errors_total counter\n");
        for entry in self.upstream_errors.iter() {
            out.push_str(&format!(
                "gateway_upstream_errors_total{{kind=\"{}\"}} {}\n",
                entry.key(),
                entry.value().get()
            ));
        }

        let (req_count, req_sum) = self.request_latency.snapshot();
        out.push_str("# HELP gateway_request_duration_ms_count Total requests observed for latency\n");
        out.push_str(&format!("gateway_request_duration_ms_count {}\n", req_count));
        out.push_str(&format!("gateway_request_duration_ms_sum {}\n", req_sum));

        let (up_count, up_sum) = self.upstream_latency.snapshot();
        out.push_str(&format!("gateway_upstream_duration_ms_count {}\n", up_count));
        out.push_str(&format!("gateway_upstream_duration_ms_sum {}\n", up_sum));

        out.push_str(&format!(
            "gateway_in_flight_requests {}\n",
            self.in_flight.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "gateway_upstream_pool_in_use {}\n",
            self.upstream_pool_in_use.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "gateway_store_available {}\n",
            self.store_available.load(Ordering::Relaxed)
        ));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders_request_counts() {
        let metrics = Metrics::new();
        metrics.record_request("ping", "GET", 200, 12.5);
        metrics.record_request("ping", "GET", 200, 8.0);
        metrics.record_request("ping", "GET", 500, 20.0);

        let rendered = metrics.render();
        assert!(rendered.contains("gateway_requests_total{route=\"ping\",status=\"200\",method=\"GET\"} 2"));
        assert!(rendered.contains("gateway_requests_total{route=\"ping\",status=\"500\",method=\"GET\"} 1"));
    }

    #[test]
    fn histogram_buckets_observations_by_latency() {
        let metrics = Metrics::new();
        metrics.record_request("r", "GET", 200, 3.0);
        metrics.record_request("r", "GET", 200, 6000.0);
        let rendered = metrics.render();
        assert!(rendered.contains("gateway_request_duration_ms_count 2"));
    }

    #[test]
    fn in_flight_gauge_tracks_increments_and_decrements() {
        let metrics = Metrics::new();
        metrics.in_flight_inc();
        metrics.in_flight_inc();
        metrics.in_flight_dec();
        assert!(metrics.render().contains("gateway_in_flight_requests 1"));
    }

    #[test]
    fn store_availability_gauge_reflects_latest_probe() {
        let metrics = Metrics::new();
        metrics.set_store_available(false);
        assert!(metrics.render().contains("gateway_store_available 0"));
    }

    #[test]
    fn upstream_pool_gauge_tracks_increments_and_decrements() {
        let metrics = Metrics::new();
        metrics.upstream_pool_inc();
        metrics.upstream_pool_inc();
        metrics.upstream_pool_dec();
        assert!(metrics.render().contains("gateway_upstream_pool_in_use 1"));
    }
}
