use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics facade for the coordinator. Calls are no-ops until a recorder is installed.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_idempotency_request(&self, outcome: &'static str) {
        counter!("idempotency_requests_total", "outcome" => outcome).increment(1);
    }

    pub fn record_inflight_join(&self) {
        counter!("idempotency_inflight_joins_total").increment(1);
    }

    pub fn record_lock_acquired(&self) {
        counter!("idempotency_lock_acquisitions_total", "result" => "acquired").increment(1);
    }

    pub fn record_lock_contended(&self) {
        counter!("idempotency_lock_acquisitions_total", "result" => "contended").increment(1);
    }

    pub fn record_poll_timeout(&self) {
        counter!("idempotency_poll_timeouts_total").increment(1);
    }

    pub fn record_backend_fallback(&self) {
        counter!("idempotency_backend_fallbacks_total").increment(1);
    }

    pub fn record_entry_write_failure(&self) {
        counter!("idempotency_entry_write_failures_total").increment(1);
    }

    pub fn record_handler_latency(&self, duration_ms: f64, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        histogram!("idempotency_handler_duration_ms", "status" => class).record(duration_ms);
    }

    pub fn record_http_request(&self, method: &str, status: u16, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Coordinated requests by outcome");
    describe_counter!("idempotency_inflight_joins_total", Unit::Count, "Requests that joined an execution in flight on the same instance");
    describe_counter!("idempotency_lock_acquisitions_total", Unit::Count, "Distributed lock attempts by result");
    describe_counter!("idempotency_poll_timeouts_total", Unit::Count, "Pollers that gave up waiting for another instance");
    describe_counter!("idempotency_backend_fallbacks_total", Unit::Count, "Requests moved from the shared cache to the file store");
    describe_counter!("idempotency_entry_write_failures_total", Unit::Count, "Entries that could not be persisted");
    describe_histogram!("idempotency_handler_duration_ms", Unit::Milliseconds, "Handler execution latency in milliseconds");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 10.0);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = get_metrics();
        metrics.record_idempotency_request("fresh");
        metrics.record_handler_latency(3.5, 201);
        metrics.record_handler_latency(3.5, 503);
        metrics.record_http_request("POST", 409, 1.0);
    }
}
