//! The chaos injector: rolls the configured probabilities for each matched
//! request and reports what to inject. Handlers apply the outcome; the
//! injector itself never touches the wire.

use super::breaker::{CircuitBreaker, RetryAfterTracker};
use super::{ChaosConfig, ChaosStats, FaultSet};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;

/// What to do to the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaosOutcome {
    None,
    /// Hold the connection for `hold_ms` (0 = until the write deadline),
    /// then close without writing.
    Timeout { hold_ms: u64 },
    /// Short-circuit with this status.
    Error {
        status: u16,
        retry_after_secs: Option<u64>,
    },
}

/// Outcome plus any latency to add before responding. Latency applies even
/// to error outcomes; handlers sleep `max(mock delay, latency_ms)`.
#[derive(Debug, Clone)]
pub struct ChaosDecision {
    pub outcome: ChaosOutcome,
    pub latency_ms: u64,
}

impl ChaosDecision {
    fn none() -> Self {
        Self {
            outcome: ChaosOutcome::None,
            latency_ms: 0,
        }
    }
}

struct CompiledRule {
    pattern: regex::Regex,
    methods: Vec<String>,
    faults: FaultSet,
}

struct Inner {
    config: ChaosConfig,
    rules: Vec<CompiledRule>,
}

/// Shared injector. Config writes swap the compiled rule set under the write
/// lock; decisions take the read lock only.
pub struct ChaosInjector {
    inner: RwLock<Inner>,
    stats: Mutex<ChaosStats>,
    /// Stateful fault instances keyed by rule index ("global" for the
    /// top-level fault set).
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    retry_trackers: Mutex<HashMap<String, RetryAfterTracker>>,
}

impl Default for ChaosInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosInjector {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                config: ChaosConfig::default(),
                rules: Vec::new(),
            }),
            stats: Mutex::new(ChaosStats::default()),
            breakers: Mutex::new(HashMap::new()),
            retry_trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the configuration. Probabilities are clamped, rules compiled,
    /// stateful fault instances rebuilt. Invalid rule regexes are reported.
    pub fn set_config(&self, mut config: ChaosConfig) -> Result<(), String> {
        config.clamp();

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let pattern = regex::Regex::new(&rule.path_pattern)
                .map_err(|e| format!("rule pattern {:?}: {e}", rule.path_pattern))?;
            rules.push(CompiledRule {
                pattern,
                methods: rule.methods.iter().map(|m| m.to_uppercase()).collect(),
                faults: rule.faults.clone(),
            });
        }

        let mut breakers = self.breakers.lock();
        let mut trackers = self.retry_trackers.lock();
        breakers.clear();
        trackers.clear();
        if let Some(cb) = &config.global.circuit_breaker {
            breakers.insert("global".to_string(), CircuitBreaker::new(cb.clone()));
        }
        if let Some(ra) = &config.global.retry_after {
            trackers.insert("global".to_string(), RetryAfterTracker::new(ra.clone()));
        }
        for (i, rule) in config.rules.iter().enumerate() {
            if let Some(cb) = &rule.faults.circuit_breaker {
                breakers.insert(format!("rule{i}"), CircuitBreaker::new(cb.clone()));
            }
            if let Some(ra) = &rule.faults.retry_after {
                trackers.insert(format!("rule{i}"), RetryAfterTracker::new(ra.clone()));
            }
        }
        drop(breakers);
        drop(trackers);

        let mut inner = self.inner.write();
        inner.config = config;
        inner.rules = rules;
        Ok(())
    }

    pub fn config(&self) -> ChaosConfig {
        self.inner.read().config.clone()
    }

    pub fn enabled(&self) -> bool {
        self.inner.read().config.enabled
    }

    pub fn stats(&self) -> ChaosStats {
        self.stats.lock().clone()
    }

    pub fn reset(&self) {
        let _ = self.set_config(ChaosConfig::default());
        *self.stats.lock() = ChaosStats::default();
    }

    /// Decide what chaos (if any) to inject for a request.
    ///
    /// Per-path rules preempt the global set: once a rule matches the path
    /// and method, global faults are not consulted for this request even if
    /// every rule-level roll fails.
    pub fn decide(&self, method: &str, path: &str) -> ChaosDecision {
        let inner = self.inner.read();
        if !inner.config.enabled {
            return ChaosDecision::none();
        }

        self.stats.lock().total_requests += 1;

        let method = method.to_uppercase();
        for (i, rule) in inner.rules.iter().enumerate() {
            if !rule.pattern.is_match(path) {
                continue;
            }
            if !rule.methods.is_empty() && !rule.methods.iter().any(|m| m == &method) {
                continue;
            }
            return self.roll(&rule.faults, &format!("rule{i}"));
        }

        self.roll(&inner.config.global, "global")
    }

    fn roll(&self, faults: &FaultSet, key: &str) -> ChaosDecision {
        let mut rng = rand::thread_rng();
        let mut decision = ChaosDecision::none();

        // Stateful faults first: the state machine decides, not a roll.
        if faults.circuit_breaker.is_some() {
            if let Some(status) = self.breakers.lock().get_mut(key).and_then(|b| b.check()) {
                self.note_error();
                decision.outcome = ChaosOutcome::Error {
                    status,
                    retry_after_secs: None,
                };
                return decision;
            }
        }
        if faults.retry_after.is_some() {
            let roll = rng.gen::<f64>();
            if let Some((status, secs)) = self
                .retry_trackers
                .lock()
                .get_mut(key)
                .and_then(|t| t.check(roll))
            {
                self.note_error();
                decision.outcome = ChaosOutcome::Error {
                    status,
                    retry_after_secs: Some(secs),
                };
                return decision;
            }
        }

        // Timeout preempts error preempts plain latency.
        if let Some(timeout) = &faults.timeout {
            if rng.gen::<f64>() < timeout.probability {
                let mut stats = self.stats.lock();
                stats.injected_faults += 1;
                stats.timeouts_injected += 1;
                decision.outcome = ChaosOutcome::Timeout {
                    hold_ms: timeout.hold_ms,
                };
                return decision;
            }
        }

        if let Some(latency) = &faults.latency {
            if rng.gen::<f64>() < latency.probability {
                decision.latency_ms = draw_latency(&mut rng, latency);
                let mut stats = self.stats.lock();
                stats.injected_faults += 1;
                stats.latency_injected += 1;
            }
        }

        if let Some(error) = &faults.error_rate {
            if rng.gen::<f64>() < error.probability {
                let status = if error.status_codes.is_empty() {
                    503
                } else {
                    error.status_codes[rng.gen_range(0..error.status_codes.len())]
                };
                self.note_error();
                decision.outcome = ChaosOutcome::Error {
                    status,
                    retry_after_secs: None,
                };
                return decision;
            }
        }

        decision
    }

    fn note_error(&self) {
        let mut stats = self.stats.lock();
        stats.injected_faults += 1;
        stats.errors_injected += 1;
    }
}

fn draw_latency(rng: &mut impl Rng, fault: &super::LatencyFault) -> u64 {
    if fault.max_ms <= fault.min_ms {
        return fault.min_ms;
    }
    match fault.distribution.as_str() {
        // Sum of two uniforms: triangular around the midpoint, close enough
        // to a normal for traffic shaping.
        "normal" => {
            let a = rng.gen_range(fault.min_ms..=fault.max_ms);
            let b = rng.gen_range(fault.min_ms..=fault.max_ms);
            (a + b) / 2
        }
        _ => rng.gen_range(fault.min_ms..=fault.max_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn injector_with(config: serde_json::Value) -> ChaosInjector {
        let injector = ChaosInjector::new();
        injector
            .set_config(serde_json::from_value(config).unwrap())
            .unwrap();
        injector
    }

    #[test]
    fn disabled_injects_nothing() {
        let injector = injector_with(json!({
            "enabled": false,
            "errorRate": {"probability": 1.0, "statusCodes": [500]}
        }));
        for _ in 0..50 {
            assert_eq!(injector.decide("GET", "/x").outcome, ChaosOutcome::None);
        }
    }

    #[test]
    fn certain_error_always_fires() {
        let injector = injector_with(json!({
            "enabled": true,
            "errorRate": {"probability": 1.0, "statusCodes": [503]}
        }));
        for _ in 0..20 {
            match injector.decide("GET", "/x").outcome {
                ChaosOutcome::Error { status, .. } => assert_eq!(status, 503),
                other => panic!("expected error outcome, got {other:?}"),
            }
        }
    }

    #[test]
    fn certain_latency_stays_in_range() {
        let injector = injector_with(json!({
            "enabled": true,
            "latency": {"minMs": 100, "maxMs": 100, "probability": 1.0}
        }));
        for _ in 0..20 {
            let decision = injector.decide("GET", "/x");
            assert_eq!(decision.latency_ms, 100);
            assert_eq!(decision.outcome, ChaosOutcome::None);
        }
    }

    #[test]
    fn path_rule_preempts_global_even_when_roll_fails() {
        // The rule on /quiet has zero-probability faults; global would
        // always error. Requests to /quiet must see neither.
        let injector = injector_with(json!({
            "enabled": true,
            "errorRate": {"probability": 1.0, "statusCodes": [500]},
            "rules": [
                {"pathPattern": "^/quiet", "errorRate": {"probability": 0.0, "statusCodes": [500]}}
            ]
        }));
        for _ in 0..20 {
            assert_eq!(injector.decide("GET", "/quiet").outcome, ChaosOutcome::None);
        }
        assert!(matches!(
            injector.decide("GET", "/loud").outcome,
            ChaosOutcome::Error { .. }
        ));
    }

    #[test]
    fn rule_method_filter_applies() {
        let injector = injector_with(json!({
            "enabled": true,
            "rules": [
                {"pathPattern": "^/api", "methods": ["POST"],
                 "errorRate": {"probability": 1.0, "statusCodes": [500]}}
            ]
        }));
        assert!(matches!(
            injector.decide("POST", "/api/x").outcome,
            ChaosOutcome::Error { .. }
        ));
        assert_eq!(injector.decide("GET", "/api/x").outcome, ChaosOutcome::None);
    }

    #[test]
    fn timeout_wins_over_error() {
        let injector = injector_with(json!({
            "enabled": true,
            "timeout": {"probability": 1.0, "holdMs": 50},
            "errorRate": {"probability": 1.0, "statusCodes": [500]}
        }));
        assert_eq!(
            injector.decide("GET", "/x").outcome,
            ChaosOutcome::Timeout { hold_ms: 50 }
        );
    }

    #[test]
    fn out_of_range_probability_clamped_on_write() {
        let injector = injector_with(json!({
            "enabled": true,
            "errorRate": {"probability": 7.0, "statusCodes": [500]}
        }));
        assert_eq!(
            injector.config().global.error_rate.unwrap().probability,
            1.0
        );
    }

    #[test]
    fn invalid_rule_regex_rejected() {
        let injector = ChaosInjector::new();
        let err = injector
            .set_config(
                serde_json::from_value(json!({
                    "enabled": true,
                    "rules": [{"pathPattern": "(["}]
                }))
                .unwrap(),
            )
            .unwrap_err();
        assert!(err.contains("rule pattern"));
    }

    #[test]
    fn stats_count_injections() {
        let injector = injector_with(json!({
            "enabled": true,
            "errorRate": {"probability": 1.0, "statusCodes": [500]}
        }));
        for _ in 0..5 {
            injector.decide("GET", "/x");
        }
        let stats = injector.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.errors_injected, 5);
    }
}
