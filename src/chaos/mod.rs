//! Chaos injection: latency, error, and timeout faults applied to matched
//! requests, configured globally or per path, with named profiles and
//! stateful faults (circuit breaker, retry-after windows).

mod breaker;
mod injector;
mod profiles;

pub use breaker::{CircuitBreaker, CircuitState, RetryAfterTracker};
pub use injector::{ChaosDecision, ChaosInjector, ChaosOutcome};
pub use profiles::{profile, profile_names};

use serde::{Deserialize, Serialize};

/// Latency fault: a delay drawn from [min, max] milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyFault {
    pub min_ms: u64,
    pub max_ms: u64,
    /// "uniform" (default) or "normal" (bell-ish around the midpoint).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub distribution: String,
    #[serde(default = "one")]
    pub probability: f64,
}

/// Error fault: a status drawn uniformly from the candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRateFault {
    pub probability: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_codes: Vec<u16>,
}

/// Timeout fault: hold the connection, then close without a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutFault {
    pub probability: f64,
    /// How long to hold before dropping; 0 means until the write deadline.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub hold_ms: u64,
}

/// Circuit breaker simulation: after `trip_after` requests the breaker opens
/// for `open_ms`, rejecting with `status`; one half-open probe then closes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerFault {
    #[serde(default = "default_trip_after")]
    pub trip_after: u64,
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,
    #[serde(default = "default_breaker_status")]
    pub status: u16,
}

fn default_trip_after() -> u64 {
    5
}
fn default_open_ms() -> u64 {
    10_000
}
fn default_breaker_status() -> u16 {
    503
}

/// Retry-after window: once triggered, rejects with `status` and a
/// `Retry-After` header until the window elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAfterFault {
    pub probability: f64,
    #[serde(default = "default_retry_secs")]
    pub retry_after_secs: u64,
    #[serde(default = "default_retry_status")]
    pub status: u16,
}

fn default_retry_secs() -> u64 {
    5
}
fn default_retry_status() -> u16 {
    429
}

/// Fault bundle applied by a matching rule or the global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<ErrorRateFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<RetryAfterFault>,
}

impl FaultSet {
    fn clamp(&mut self) {
        if let Some(l) = &mut self.latency {
            l.probability = l.probability.clamp(0.0, 1.0);
            if l.min_ms > l.max_ms {
                std::mem::swap(&mut l.min_ms, &mut l.max_ms);
            }
        }
        if let Some(e) = &mut self.error_rate {
            e.probability = e.probability.clamp(0.0, 1.0);
        }
        if let Some(t) = &mut self.timeout {
            t.probability = t.probability.clamp(0.0, 1.0);
        }
        if let Some(r) = &mut self.retry_after {
            r.probability = r.probability.clamp(0.0, 1.0);
        }
    }
}

/// Per-path override. A matching rule preempts the global fault set for its
/// requests even when its own probability rolls fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosRule {
    /// Regex matched against the request path.
    pub path_pattern: String,
    /// Optional method filter; empty matches every method.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(flatten)]
    pub faults: FaultSet,
}

/// The full chaos configuration as read and written by the admin surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub global: FaultSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ChaosRule>,
}

impl ChaosConfig {
    /// Clamp every probability into [0, 1]. Applied on every write so an
    /// out-of-range value is never observable.
    pub fn clamp(&mut self) {
        self.global.clamp();
        for rule in &mut self.rules {
            rule.faults.clamp();
        }
    }
}

fn one() -> f64 {
    1.0
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Counters surfaced on the admin chaos endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosStats {
    pub total_requests: u64,
    pub injected_faults: u64,
    pub latency_injected: u64,
    pub errors_injected: u64,
    pub timeouts_injected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_bounds_probabilities() {
        let mut config: ChaosConfig = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "errorRate": {"probability": 3.5, "statusCodes": [500]},
            "latency": {"minMs": 50, "maxMs": 10, "probability": -1.0},
            "rules": [
                {"pathPattern": "^/x", "timeout": {"probability": 99.0}}
            ]
        }))
        .unwrap();
        config.clamp();

        assert_eq!(config.global.error_rate.as_ref().unwrap().probability, 1.0);
        let latency = config.global.latency.as_ref().unwrap();
        assert_eq!(latency.probability, 0.0);
        // min/max swapped into order.
        assert_eq!((latency.min_ms, latency.max_ms), (10, 50));
        assert_eq!(
            config.rules[0].faults.timeout.as_ref().unwrap().probability,
            1.0
        );
    }
}
