//! Bounded request history: every handled request, matched or not, lands
//! here. A fixed-capacity FIFO — push evicts the oldest entry; reads copy
//! under the lock so queries never block writers for long.

use crate::matching::{NearMiss, RequestSnapshot};
use crate::mock::MockType;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Summary of the response a request received.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSummary {
    pub status_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body_preview: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub chaos_injected: bool,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// One logged request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub protocol: MockType,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Id of the mock that served the request; empty when unmatched.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mock_id: String,
    pub matched: bool,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    pub response: ResponseSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub near_misses: Vec<NearMiss>,
}

/// Query filters for the admin surface.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub protocol: Option<MockType>,
    pub unmatched_only: bool,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: usize,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Fixed-capacity request log.
pub struct RequestLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

const BODY_PREVIEW_LIMIT: usize = 4096;

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 1,
            }),
        }
    }

    /// Append an entry, evicting the oldest at capacity. A zero-capacity log
    /// accepts the write and drops it.
    pub fn push(
        &self,
        protocol: MockType,
        snapshot: &RequestSnapshot,
        mock_id: Option<&str>,
        response: ResponseSummary,
        near_misses: Vec<NearMiss>,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if self.capacity == 0 {
            return id;
        }

        let mut body = snapshot.body.clone();
        if body.len() > BODY_PREVIEW_LIMIT {
            let mut cut = BODY_PREVIEW_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        let entry = LogEntry {
            id,
            protocol,
            timestamp: chrono::Utc::now(),
            mock_id: mock_id.unwrap_or_default().to_string(),
            matched: mock_id.is_some(),
            method: snapshot.method.clone(),
            path: snapshot.path.clone(),
            query: snapshot.raw_query.clone(),
            headers: snapshot.headers.clone(),
            body,
            response,
            near_misses,
        };

        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        id
    }

    /// Newest-first query with filters.
    pub fn query(&self, q: &LogQuery) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        let mut out: Vec<LogEntry> = inner
            .entries
            .iter()
            .rev()
            .filter(|e| {
                if q.unmatched_only && e.matched {
                    return false;
                }
                if let Some(p) = q.protocol {
                    if e.protocol != p {
                        return false;
                    }
                }
                if let Some(since) = q.since {
                    if e.timestamp < since {
                        return false;
                    }
                }
                if let Some(until) = q.until {
                    if e.timestamp > until {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        if q.limit > 0 {
            out.truncate(q.limit);
        }
        out
    }

    pub fn get(&self, id: u64) -> Option<LogEntry> {
        self.inner.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(method: &str, path: &str) -> RequestSnapshot {
        RequestSnapshot {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    fn ok() -> ResponseSummary {
        ResponseSummary {
            status_code: 200,
            ..Default::default()
        }
    }

    #[test]
    fn oldest_entries_evict_at_capacity() {
        let log = RequestLog::new(3);
        for i in 0..5 {
            log.push(
                MockType::Http,
                &snap("GET", &format!("/r{i}")),
                Some("m"),
                ok(),
                vec![],
            );
        }
        let entries = log.query(&LogQuery::default());
        assert_eq!(entries.len(), 3);
        // Newest first.
        assert_eq!(entries[0].path, "/r4");
        assert_eq!(entries[2].path, "/r2");
    }

    #[test]
    fn zero_capacity_accepts_writes_reads_empty() {
        let log = RequestLog::new(0);
        let id = log.push(MockType::Http, &snap("GET", "/x"), None, ok(), vec![]);
        assert!(id > 0);
        assert!(log.query(&LogQuery::default()).is_empty());
    }

    #[test]
    fn unmatched_filter() {
        let log = RequestLog::new(10);
        log.push(MockType::Http, &snap("GET", "/hit"), Some("m"), ok(), vec![]);
        log.push(MockType::Http, &snap("GET", "/miss"), None, ok(), vec![]);
        let q = LogQuery {
            unmatched_only: true,
            ..Default::default()
        };
        let entries = log.query(&q);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/miss");
        assert!(!entries[0].matched);
    }

    #[test]
    fn protocol_filter() {
        let log = RequestLog::new(10);
        log.push(MockType::Http, &snap("GET", "/h"), Some("m"), ok(), vec![]);
        log.push(MockType::Grpc, &snap("POST", "/svc/M"), Some("g"), ok(), vec![]);
        let q = LogQuery {
            protocol: Some(MockType::Grpc),
            ..Default::default()
        };
        let entries = log.query(&q);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].protocol, MockType::Grpc);
    }
}
