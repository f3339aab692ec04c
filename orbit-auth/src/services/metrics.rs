use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// HTTP
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

// Token lifecycle
pub static TOKENS_ISSUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static GRANT_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static TOKENS_REVOKED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static REFRESH_REUSE_DETECTED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Registers every collector once. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let issued = IntCounterVec::new(
        Opts::new("oauth_tokens_issued_total", "Access tokens issued, by grant"),
        &["grant"],
    )?;
    let failures = IntCounterVec::new(
        Opts::new("oauth_grant_failures_total", "Failed token requests, by grant and error"),
        &["grant", "error"],
    )?;
    let revoked = IntCounterVec::new(
        Opts::new("oauth_tokens_revoked_total", "Revoked credentials, by kind"),
        &["kind"],
    )?;
    let reuse = IntCounter::new(
        "refresh_token_reuse_detected_total",
        "Presentations of an already-rotated refresh token",
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(issued.clone()))?;
    registry.register(Box::new(failures.clone()))?;
    registry.register(Box::new(revoked.clone()))?;
    registry.register(Box::new(reuse.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = TOKENS_ISSUED_TOTAL.set(issued);
    let _ = GRANT_FAILURES_TOTAL.set(failures);
    let _ = TOKENS_REVOKED_TOTAL.set(revoked);
    let _ = REFRESH_REUSE_DETECTED_TOTAL.set(reuse);
    Ok(())
}

pub fn record_token_issued(grant: &str) {
    if let Some(counter) = TOKENS_ISSUED_TOTAL.get() {
        counter.with_label_values(&[grant]).inc();
    }
}

pub fn record_grant_failure(grant: &str, error: &str) {
    if let Some(counter) = GRANT_FAILURES_TOTAL.get() {
        counter.with_label_values(&[grant, error]).inc();
    }
}

pub fn record_revocation(kind: &str, count: usize) {
    if let Some(counter) = TOKENS_REVOKED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc_by(count as u64);
    }
}

pub fn record_refresh_reuse() {
    if let Some(counter) = REFRESH_REUSE_DETECTED_TOTAL.get() {
        counter.inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
