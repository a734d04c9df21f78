//! Verification counters: per-mock call counts plus a short ring of recent
//! invocation snapshots for `verify` assertions and request inspection.

use crate::matching::RequestSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How many invocation snapshots are retained per mock.
const INVOCATION_RING: usize = 50;

/// A captured invocation of a mock.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
}

/// Assertion mode for `verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerifyMode {
    Exactly,
    AtLeast,
    AtMost,
    Never,
}

/// Result of a verification check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub mock_id: String,
    pub call_count: u64,
    pub passed: bool,
    pub mode: VerifyMode,
    pub expected: u64,
}

#[derive(Default)]
struct MockCounters {
    count: AtomicU64,
    invocations: Mutex<VecDeque<Invocation>>,
}

/// Store of per-mock verification state.
#[derive(Default)]
pub struct VerificationStore {
    counters: Mutex<HashMap<String, Arc<MockCounters>>>,
}

impl VerificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, mock_id: &str) -> Arc<MockCounters> {
        let mut map = self.counters.lock();
        Arc::clone(map.entry(mock_id.to_string()).or_default())
    }

    /// Record an invocation of a mock. Called by dispatch on every match.
    pub fn record(&self, mock_id: &str, snapshot: &RequestSnapshot) {
        let counters = self.counters(mock_id);
        counters.count.fetch_add(1, Ordering::Relaxed);

        let mut ring = counters.invocations.lock();
        if ring.len() >= INVOCATION_RING {
            ring.pop_front();
        }
        ring.push_back(Invocation {
            timestamp: chrono::Utc::now(),
            method: snapshot.method.clone(),
            path: snapshot.path.clone(),
            query: snapshot.raw_query.clone(),
            body: snapshot.body.clone(),
        });
    }

    pub fn call_count(&self, mock_id: &str) -> u64 {
        self.counters
            .lock()
            .get(mock_id)
            .map(|c| c.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn invocations(&self, mock_id: &str) -> Vec<Invocation> {
        self.counters
            .lock()
            .get(mock_id)
            .map(|c| c.invocations.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn verify(&self, mock_id: &str, mode: VerifyMode, expected: u64) -> VerifyResult {
        let count = self.call_count(mock_id);
        let passed = match mode {
            VerifyMode::Exactly => count == expected,
            VerifyMode::AtLeast => count >= expected,
            VerifyMode::AtMost => count <= expected,
            VerifyMode::Never => count == 0,
        };
        VerifyResult {
            mock_id: mock_id.to_string(),
            call_count: count,
            passed,
            mode,
            expected,
        }
    }

    /// Reset one mock's counters, or everything when `mock_id` is `None`.
    pub fn reset(&self, mock_id: Option<&str>) {
        let mut map = self.counters.lock();
        match mock_id {
            Some(id) => {
                map.remove(id);
            }
            None => map.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap() -> RequestSnapshot {
        RequestSnapshot {
            method: "GET".into(),
            path: "/x".into(),
            ..Default::default()
        }
    }

    #[test]
    fn counts_and_verifies() {
        let store = VerificationStore::new();
        for _ in 0..3 {
            store.record("m1", &snap());
        }
        assert_eq!(store.call_count("m1"), 3);
        assert!(store.verify("m1", VerifyMode::Exactly, 3).passed);
        assert!(store.verify("m1", VerifyMode::AtLeast, 2).passed);
        assert!(store.verify("m1", VerifyMode::AtMost, 2).call_count == 3);
        assert!(!store.verify("m1", VerifyMode::AtMost, 2).passed);
        assert!(store.verify("untouched", VerifyMode::Never, 0).passed);
    }

    #[test]
    fn invocation_ring_is_bounded() {
        let store = VerificationStore::new();
        for _ in 0..(INVOCATION_RING + 10) {
            store.record("m1", &snap());
        }
        assert_eq!(store.invocations("m1").len(), INVOCATION_RING);
        assert_eq!(store.call_count("m1"), (INVOCATION_RING + 10) as u64);
    }

    #[test]
    fn reset_scopes() {
        let store = VerificationStore::new();
        store.record("a", &snap());
        store.record("b", &snap());
        store.reset(Some("a"));
        assert_eq!(store.call_count("a"), 0);
        assert_eq!(store.call_count("b"), 1);
        store.reset(None);
        assert_eq!(store.call_count("b"), 0);
    }
}
