//! Pre-built chaos profiles, applied by name through the admin API.

use super::ChaosConfig;
use serde_json::json;

const PROFILE_NAMES: &[&str] = &[
    "slow-api",
    "degraded",
    "flaky",
    "offline",
    "timeout",
    "rate-limited",
    "mobile-3g",
    "satellite",
    "dns-flaky",
    "overloaded",
];

/// Names of every built-in profile.
pub fn profile_names() -> &'static [&'static str] {
    PROFILE_NAMES
}

/// Look up a built-in profile by name.
pub fn profile(name: &str) -> Option<ChaosConfig> {
    let value = match name {
        "slow-api" => json!({
            "enabled": true,
            "latency": {"minMs": 500, "maxMs": 2000, "probability": 1.0}
        }),
        "degraded" => json!({
            "enabled": true,
            "latency": {"minMs": 200, "maxMs": 800, "probability": 1.0},
            "errorRate": {"probability": 0.05, "statusCodes": [503]}
        }),
        "flaky" => json!({
            "enabled": true,
            "latency": {"minMs": 0, "maxMs": 100, "probability": 1.0},
            "errorRate": {"probability": 0.20, "statusCodes": [500, 502, 503]}
        }),
        "offline" => json!({
            "enabled": true,
            "errorRate": {"probability": 1.0, "statusCodes": [503]}
        }),
        "timeout" => json!({
            "enabled": true,
            "timeout": {"probability": 1.0, "holdMs": 30000}
        }),
        "rate-limited" => json!({
            "enabled": true,
            "latency": {"minMs": 50, "maxMs": 200, "probability": 1.0},
            "errorRate": {"probability": 0.30, "statusCodes": [429]}
        }),
        "mobile-3g" => json!({
            "enabled": true,
            "latency": {"minMs": 300, "maxMs": 800, "probability": 1.0},
            "errorRate": {"probability": 0.02, "statusCodes": [503]}
        }),
        "satellite" => json!({
            "enabled": true,
            "latency": {"minMs": 600, "maxMs": 2000, "probability": 1.0},
            "errorRate": {"probability": 0.05, "statusCodes": [503]}
        }),
        "dns-flaky" => json!({
            "enabled": true,
            "errorRate": {"probability": 0.10, "statusCodes": [503]}
        }),
        "overloaded" => json!({
            "enabled": true,
            "latency": {"minMs": 1000, "maxMs": 5000, "distribution": "normal", "probability": 1.0},
            "errorRate": {"probability": 0.15, "statusCodes": [503, 529]}
        }),
        _ => return None,
    };
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_advertised_profile_resolves() {
        for name in profile_names() {
            let config = profile(name).unwrap_or_else(|| panic!("profile {name} missing"));
            assert!(config.enabled, "profile {name} should be enabled");
        }
    }

    #[test]
    fn unknown_profile_is_none() {
        assert!(profile("no-such-profile").is_none());
    }

    #[test]
    fn flaky_profile_declares_twenty_percent_errors() {
        let config = profile("flaky").unwrap();
        let error = config.global.error_rate.unwrap();
        assert_eq!(error.probability, 0.20);
        assert_eq!(error.status_codes, vec![500, 502, 503]);
    }
}
