//! Prometheus metrics.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line.

use crate::asset_path::Namespace;
use crate::config::ResolveMode;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once and return its render handle.
///
/// Safe to call repeatedly; later calls reuse the first recorder.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                warn!("A metrics recorder is already installed; /metrics will be empty");
            }
            handle
        })
        .clone()
}

pub fn record_request(namespace: Namespace, mode: ResolveMode, status: u16) {
    counter!(
        "vcserve_requests_total",
        "namespace" => namespace.as_str(),
        "mode" => mode.as_str(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(namespace: Namespace, start: Instant) {
    histogram!("vcserve_request_duration_seconds", "namespace" => namespace.as_str())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_hit() {
    counter!("vcserve_cache_hits_total").increment(1);
}

pub fn record_cache_miss() {
    counter!("vcserve_cache_misses_total").increment(1);
}

pub fn record_coalesced() {
    counter!("vcserve_coalesced_requests_total").increment(1);
}

pub fn record_origin_fetch(namespace: Namespace) {
    counter!("vcserve_origin_fetches_total", "namespace" => namespace.as_str()).increment(1);
}

pub fn record_origin_error() {
    counter!("vcserve_origin_errors_total").increment(1);
}

pub fn record_cache_write_failure() {
    counter!("vcserve_cache_write_failures_total").increment(1);
}
