//! Stateful faults: circuit breaker and retry-after window simulation.

use super::{CircuitBreakerFault, RetryAfterFault};
use std::time::{Duration, Instant};

/// Breaker states, mirroring the usual closed/open/half-open machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Simulates an upstream whose breaker trips after a burst of traffic.
pub struct CircuitBreaker {
    config: CircuitBreakerFault,
    state: CircuitState,
    requests_in_closed: u64,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerFault) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            requests_in_closed: 0,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Record a request. Returns the rejection status while the breaker is
    /// open, `None` while traffic passes.
    pub fn check(&mut self) -> Option<u16> {
        match self.state {
            CircuitState::Closed => {
                self.requests_in_closed += 1;
                if self.requests_in_closed >= self.config.trip_after {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
                None
            }
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= Duration::from_millis(self.config.open_ms) {
                    // Half-open: let this probe through.
                    self.state = CircuitState::HalfOpen;
                    None
                } else {
                    Some(self.config.status)
                }
            }
            CircuitState::HalfOpen => {
                // Probe passed; close and start a fresh window.
                self.state = CircuitState::Closed;
                self.requests_in_closed = 1;
                self.opened_at = None;
                None
            }
        }
    }
}

/// Once triggered, rejects every request until the retry deadline passes.
pub struct RetryAfterTracker {
    config: RetryAfterFault,
    blocked_until: Option<Instant>,
}

impl RetryAfterTracker {
    pub fn new(config: RetryAfterFault) -> Self {
        Self {
            config,
            blocked_until: None,
        }
    }

    /// `roll` is the caller's probability sample in [0, 1).
    /// Returns (status, retry-after seconds) while the window is active.
    pub fn check(&mut self, roll: f64) -> Option<(u16, u64)> {
        if let Some(deadline) = self.blocked_until {
            if Instant::now() < deadline {
                return Some((self.config.status, self.config.retry_after_secs));
            }
            self.blocked_until = None;
        }
        if roll < self.config.probability {
            self.blocked_until =
                Some(Instant::now() + Duration::from_secs(self.config.retry_after_secs));
            return Some((self.config.status, self.config.retry_after_secs));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_config(trip_after: u64, open_ms: u64) -> CircuitBreakerFault {
        serde_json::from_value(serde_json::json!({
            "tripAfter": trip_after,
            "openMs": open_ms
        }))
        .unwrap()
    }

    #[test]
    fn breaker_trips_after_threshold() {
        let mut b = CircuitBreaker::new(breaker_config(3, 60_000));
        assert_eq!(b.check(), None);
        assert_eq!(b.check(), None);
        assert_eq!(b.check(), None); // third request trips it
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.check(), Some(503));
    }

    #[test]
    fn breaker_half_opens_after_window() {
        let mut b = CircuitBreaker::new(breaker_config(1, 0));
        assert_eq!(b.check(), None); // trips immediately
        // openMs of zero expires at once: next request is the half-open probe.
        assert_eq!(b.check(), None);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.check(), None); // probe closes it
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn retry_after_window_blocks_until_deadline() {
        let config: RetryAfterFault = serde_json::from_value(serde_json::json!({
            "probability": 1.0,
            "retryAfterSecs": 60,
            "status": 429
        }))
        .unwrap();
        let mut tracker = RetryAfterTracker::new(config);
        assert_eq!(tracker.check(0.0), Some((429, 60)));
        // Still inside the window regardless of the roll.
        assert_eq!(tracker.check(0.99), Some((429, 60)));
    }

    #[test]
    fn retry_after_zero_probability_never_triggers() {
        let config: RetryAfterFault = serde_json::from_value(serde_json::json!({
            "probability": 0.0
        }))
        .unwrap();
        let mut tracker = RetryAfterTracker::new(config);
        assert_eq!(tracker.check(0.5), None);
    }
}
