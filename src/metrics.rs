//! Prometheus metrics exposed on the admin `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder, IntCounterVec,
    IntGauge, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Requests handled, labeled by protocol and match outcome.
pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "mockd_requests_total",
        "Requests handled by protocol and outcome",
        &["protocol", "outcome"],
        REGISTRY
    )
    .expect("register mockd_requests_total")
});

/// Chaos injections, labeled by kind.
pub static CHAOS_INJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "mockd_chaos_injected_total",
        "Chaos faults injected by kind",
        &["kind"],
        REGISTRY
    )
    .expect("register mockd_chaos_injected_total")
});

/// Currently registered mocks.
pub static MOCKS_REGISTERED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_with_registry!(
        "mockd_mocks_registered",
        "Number of mocks currently registered",
        REGISTRY
    )
    .expect("register mockd_mocks_registered")
});

/// Open streaming sessions (SSE, WebSocket, gRPC streams, MQTT subscriptions).
pub static ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_with_registry!(
        "mockd_active_streams",
        "Open streaming sessions",
        REGISTRY
    )
    .expect("register mockd_active_streams")
});

pub fn record_request(protocol: &str, matched: bool) {
    let outcome = if matched { "matched" } else { "unmatched" };
    REQUESTS_TOTAL.with_label_values(&[protocol, outcome]).inc();
}

pub fn record_chaos(kind: &str) {
    CHAOS_INJECTED_TOTAL.with_label_values(&[kind]).inc();
}

/// Render the Prometheus text exposition.
pub fn gather() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition() {
        record_request("http", true);
        record_request("http", false);
        record_chaos("latency");
        MOCKS_REGISTERED.set(3);

        let text = gather();
        assert!(text.contains("mockd_requests_total"));
        assert!(text.contains("mockd_chaos_injected_total"));
        assert!(text.contains("mockd_mocks_registered 3"));
    }
}
