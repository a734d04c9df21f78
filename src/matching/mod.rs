//! Request matching and dispatch.
//!
//! A protocol-agnostic rule engine: for each incoming request the dispatcher
//! filters the current mock set to the request's protocol, scores every
//! enabled matcher, and selects the winner by priority, then specificity
//! score, then insertion order. When nothing matches, a near-miss breakdown
//! explains per mock which fields agreed and which did not.

mod http;
pub mod jsonpath;
mod nearmiss;
mod path;
mod topic;

pub use http::{match_http, HttpMatchOutcome};
pub use nearmiss::{collect_near_misses, match_breakdown, FieldResult, NearMiss};
pub use path::{extract_path_params, match_glob, match_path, match_path_pattern, max_path_score};
pub use topic::topic_matches;

use crate::mock::{Mock, MockSpec};
use std::collections::HashMap;
use std::sync::Arc;

// Specificity score ladder. Exact path constraints outrank patterns, which
// outrank placeholders and globs; body predicates are the strongest signal.
pub const SCORE_METHOD: i32 = 10;
pub const SCORE_PATH_EXACT: i32 = 15;
pub const SCORE_PATH_PATTERN: i32 = 13;
pub const SCORE_PATH_NAMED_PARAMS: i32 = 12;
pub const SCORE_PATH_WILDCARD: i32 = 10;
pub const SCORE_HEADER: i32 = 5;
pub const SCORE_QUERY_PARAM: i32 = 5;
pub const SCORE_BODY_EQUALS: i32 = 25;
pub const SCORE_BODY_PATTERN: i32 = 22;
pub const SCORE_BODY_CONTAINS: i32 = 20;
pub const SCORE_JSONPATH_CONDITION: i32 = 8;
pub const SCORE_MTLS_REQUIRE_AUTH: i32 = 5;
pub const SCORE_MTLS_CN: i32 = 10;
pub const SCORE_MTLS_CN_PATTERN: i32 = 8;
pub const SCORE_MTLS_FIELD: i32 = 5;

/// Client certificate identity surfaced by the mTLS-enabled listeners.
#[derive(Debug, Clone, Default)]
pub struct MtlsIdentity {
    pub verified: bool,
    pub common_name: String,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub san_dns: Vec<String>,
    pub san_ip: Vec<String>,
    pub san_uri: Vec<String>,
}

/// Protocol-neutral snapshot of an incoming request's identifying fields.
/// Matchers and templates read from this; nothing here borrows the wire.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    pub query: HashMap<String, String>,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
    pub client_addr: String,
    pub mtls: Option<MtlsIdentity>,
}

impl RequestSnapshot {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// The winning mock for a request, with everything downstream stages need.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub mock: Arc<Mock>,
    pub score: i32,
    pub outcome: HttpMatchOutcome,
}

/// Select the single best mock for an HTTP-family request.
///
/// `mocks` must be in registry insertion order; ties on priority and score
/// resolve to the lowest insertion index, which keeps dispatch deterministic
/// across processes loading the same config.
pub fn dispatch_http(mocks: &[Arc<Mock>], snapshot: &RequestSnapshot) -> Option<DispatchResult> {
    let mut best: Option<(i32, i32, usize, HttpMatchOutcome, Arc<Mock>)> = None;

    for (index, mock) in mocks.iter().enumerate() {
        if !mock.enabled {
            continue;
        }
        let matcher = match &mock.spec {
            MockSpec::Http(spec) => &spec.matcher,
            MockSpec::Sse(spec) => &spec.matcher,
            _ => continue,
        };
        let Some(outcome) = match_http(matcher, snapshot) else {
            continue;
        };

        let priority = mock.priority();
        let candidate = (priority, outcome.score, index);
        let wins = match &best {
            None => true,
            Some((bp, bs, bi, _, _)) => {
                candidate.0 > *bp
                    || (candidate.0 == *bp && candidate.1 > *bs)
                    || (candidate.0 == *bp && candidate.1 == *bs && candidate.2 < *bi)
            }
        };
        if wins {
            best = Some((priority, outcome.score, index, outcome, Arc::clone(mock)));
        }
    }

    best.map(|(_, score, _, outcome, mock)| DispatchResult {
        mock,
        score,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::Mock;
    use serde_json::json;

    fn mock_with(id: &str, priority: i32, path: &str) -> Arc<Mock> {
        Arc::new(
            serde_json::from_value(json!({
                "id": id,
                "type": "http",
                "http": {
                    "priority": priority,
                    "matcher": {"method": "GET", "path": path},
                    "response": {"statusCode": 200, "body": "ok"}
                }
            }))
            .unwrap(),
        )
    }

    fn get(path: &str) -> RequestSnapshot {
        RequestSnapshot {
            method: "GET".into(),
            path: path.into(),
            ..Default::default()
        }
    }

    #[test]
    fn higher_priority_wins() {
        let mocks = vec![mock_with("low", 5, "/x"), mock_with("high", 10, "/x")];
        let result = dispatch_http(&mocks, &get("/x")).unwrap();
        assert_eq!(result.mock.id, "high");
    }

    #[test]
    fn equal_priority_falls_back_to_insertion_order() {
        let mocks = vec![mock_with("first", 10, "/x"), mock_with("second", 10, "/x")];
        let result = dispatch_http(&mocks, &get("/x")).unwrap();
        assert_eq!(result.mock.id, "first");
    }

    #[test]
    fn specificity_beats_insertion_order_within_priority() {
        // Glob inserted first, exact second: exact is more specific and wins.
        let mocks = vec![mock_with("glob", 0, "/api/*"), mock_with("exact", 0, "/api/users")];
        let result = dispatch_http(&mocks, &get("/api/users")).unwrap();
        assert_eq!(result.mock.id, "exact");
    }

    #[test]
    fn disabled_mocks_are_skipped() {
        let mut disabled = (*mock_with("off", 10, "/x")).clone();
        disabled.enabled = false;
        let mocks = vec![Arc::new(disabled), mock_with("on", 0, "/x")];
        let result = dispatch_http(&mocks, &get("/x")).unwrap();
        assert_eq!(result.mock.id, "on");
    }

    #[test]
    fn no_match_returns_none() {
        let mocks = vec![mock_with("a", 0, "/x")];
        assert!(dispatch_http(&mocks, &get("/y")).is_none());
    }

    #[test]
    fn empty_matcher_matches_everything() {
        let empty: Arc<Mock> = Arc::new(
            serde_json::from_value(json!({
                "id": "catchall",
                "type": "http",
                "http": {
                    "matcher": {},
                    "response": {"statusCode": 200, "body": "any"}
                }
            }))
            .unwrap(),
        );
        let result = dispatch_http(&[empty], &get("/whatever")).unwrap();
        assert_eq!(result.mock.id, "catchall");
        assert_eq!(result.score, 0);
    }
}
