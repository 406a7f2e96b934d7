#[cfg(feature = "server")]
use axum::{http::StatusCode, response::IntoResponse};
#[cfg(feature = "server")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "server")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
#[cfg(feature = "server")]
use std::sync::OnceLock;

#[cfg(feature = "server")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[cfg(feature = "server")]
pub fn init_metrics() {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Metrics recorder already initialized");
                return;
            }

            // Initialize metrics with zero values
            counter!("domain_queries_total", "provider" => "unknown", "outcome" => "unknown")
                .absolute(0);
            counter!("domain_cache_hits_total").absolute(0);
            counter!("domain_cache_misses_total").absolute(0);
            counter!("domain_errors_total", "error_type" => "unknown").absolute(0);
            counter!("domain_rate_limited_total").absolute(0);
            counter!("domain_pool_rejections_total").absolute(0);
            gauge!("domain_providers_enabled").set(0.0);
            histogram!("domain_request_duration_seconds").record(0.0);
        }
        Err(e) => {
            tracing::warn!("Failed to install metrics recorder: {}", e);
        }
    }
}

#[cfg(feature = "server")]
pub fn record_query(provider: &str, outcome: &str) {
    counter!("domain_queries_total", "provider" => provider.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

#[cfg(feature = "server")]
pub fn increment_cache_hits() {
    counter!("domain_cache_hits_total").increment(1);
}

#[cfg(feature = "server")]
pub fn increment_cache_misses() {
    counter!("domain_cache_misses_total").increment(1);
}

#[cfg(feature = "server")]
pub fn increment_errors(error_type: &str) {
    counter!("domain_errors_total", "error_type" => error_type.to_string()).increment(1);
}

#[cfg(feature = "server")]
pub fn increment_rate_limited() {
    counter!("domain_rate_limited_total").increment(1);
}

#[cfg(feature = "server")]
pub fn increment_pool_rejections() {
    counter!("domain_pool_rejections_total").increment(1);
}

#[cfg(feature = "server")]
pub fn set_providers_enabled(count: usize) {
    gauge!("domain_providers_enabled").set(count as f64);
}

#[cfg(feature = "server")]
pub fn record_query_time(duration_ms: u64) {
    let duration_seconds = duration_ms as f64 / 1000.0;
    histogram!("domain_request_duration_seconds").record(duration_seconds);
}

#[cfg(feature = "server")]
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Metrics not initialized".to_string()),
    }
}
