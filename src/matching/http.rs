//! HTTP matcher evaluation: every declared constraint must hold, and the
//! accumulated score ranks equal-priority candidates by specificity.

use super::path::{extract_path_params, match_glob, match_path, match_path_pattern};
use super::{jsonpath, MtlsIdentity, RequestSnapshot};
use super::{
    SCORE_BODY_CONTAINS, SCORE_BODY_EQUALS, SCORE_BODY_PATTERN, SCORE_HEADER,
    SCORE_JSONPATH_CONDITION, SCORE_METHOD, SCORE_MTLS_CN, SCORE_MTLS_CN_PATTERN,
    SCORE_MTLS_FIELD, SCORE_MTLS_REQUIRE_AUTH, SCORE_PATH_PATTERN, SCORE_QUERY_PARAM,
};
use crate::mock::{HttpMatcher, MtlsMatch};
use std::collections::HashMap;

/// Everything a successful match produces beyond the score: values the
/// template context exposes as `request.pathParam.*`, `request.pathPattern.*`
/// and `request.jsonPath.*`.
#[derive(Debug, Clone, Default)]
pub struct HttpMatchOutcome {
    pub score: i32,
    pub path_params: HashMap<String, String>,
    pub pattern_captures: HashMap<String, String>,
    pub jsonpath_values: HashMap<String, serde_json::Value>,
}

/// Evaluate a matcher against a request snapshot.
/// Returns `None` when any declared constraint fails.
pub fn match_http(matcher: &HttpMatcher, snapshot: &RequestSnapshot) -> Option<HttpMatchOutcome> {
    // Path and pathPattern are mutually exclusive; validation rejects this,
    // but a malformed registry entry must still never match.
    if !matcher.path.is_empty() && !matcher.path_pattern.is_empty() {
        return None;
    }

    let mut outcome = HttpMatchOutcome::default();

    if !matcher.method.is_empty() {
        if !matcher.method.eq_ignore_ascii_case(&snapshot.method) {
            return None;
        }
        outcome.score += SCORE_METHOD;
    }

    if !matcher.path.is_empty() {
        let path_score = match_path(&matcher.path, &snapshot.path);
        if path_score == 0 {
            return None;
        }
        outcome.score += path_score;
        if matcher.path.contains('{') {
            outcome.path_params = extract_path_params(&matcher.path, &snapshot.path);
        }
    }

    if !matcher.path_pattern.is_empty() {
        let (score, captures) = match_path_pattern(&matcher.path_pattern, &snapshot.path);
        if score == 0 {
            return None;
        }
        outcome.score += SCORE_PATH_PATTERN;
        outcome.pattern_captures = captures;
    }

    for (name, expected) in &matcher.headers {
        if !header_matches(snapshot, name, expected) {
            return None;
        }
        outcome.score += SCORE_HEADER;
    }

    for (name, expected) in &matcher.query_params {
        if snapshot.query.get(name).map(String::as_str) != Some(expected.as_str()) {
            return None;
        }
        outcome.score += SCORE_QUERY_PARAM;
    }

    if !matcher.body_equals.is_empty() {
        if snapshot.body != matcher.body_equals {
            return None;
        }
        outcome.score += SCORE_BODY_EQUALS;
    }

    if !matcher.body_contains.is_empty() {
        if !snapshot.body.contains(&matcher.body_contains) {
            return None;
        }
        outcome.score += SCORE_BODY_CONTAINS;
    }

    if !matcher.body_pattern.is_empty() {
        let re = regex::Regex::new(&matcher.body_pattern).ok()?;
        if !re.is_match(&snapshot.body) {
            return None;
        }
        outcome.score += SCORE_BODY_PATTERN;
    }

    if !matcher.body_json_path.is_empty() {
        for (expr, expected) in &matcher.body_json_path {
            let actual = jsonpath::extract(&snapshot.body, expr)?;
            if !jsonpath::loose_eq(&actual, expected) {
                return None;
            }
            let key = expr
                .rsplit('.')
                .next()
                .unwrap_or(expr.as_str())
                .to_string();
            outcome.jsonpath_values.insert(key, actual);
            outcome.score += SCORE_JSONPATH_CONDITION;
        }
    }

    if let Some(mtls) = &matcher.mtls {
        let identity = snapshot.mtls.as_ref()?;
        let mtls_score = match_mtls(mtls, identity)?;
        outcome.score += mtls_score;
    }

    Some(outcome)
}

/// Header values support `*` wildcards; names are case-insensitive.
pub(super) fn header_matches(snapshot: &RequestSnapshot, name: &str, expected: &str) -> bool {
    let Some(actual) = snapshot.header(name) else {
        return false;
    };
    if expected.contains('*') {
        match_glob(expected, actual)
    } else {
        actual == expected
    }
}

pub(super) fn match_mtls(m: &MtlsMatch, identity: &MtlsIdentity) -> Option<i32> {
    let mut score = 0;

    if m.require_auth {
        if !identity.verified {
            return None;
        }
        score += SCORE_MTLS_REQUIRE_AUTH;
    }

    if !m.cn.is_empty() {
        if identity.common_name != m.cn {
            return None;
        }
        score += SCORE_MTLS_CN;
    }

    if !m.cn_pattern.is_empty() {
        let re = regex::Regex::new(&m.cn_pattern).ok()?;
        if !re.is_match(&identity.common_name) {
            return None;
        }
        score += SCORE_MTLS_CN_PATTERN;
    }

    if !m.ou.is_empty() {
        if !identity.organizational_unit.iter().any(|ou| ou == &m.ou) {
            return None;
        }
        score += SCORE_MTLS_FIELD;
    }

    if !m.o.is_empty() {
        if !identity.organization.iter().any(|o| o == &m.o) {
            return None;
        }
        score += SCORE_MTLS_FIELD;
    }

    if let Some(san) = &m.san {
        if !san.dns.is_empty() {
            if !identity.san_dns.iter().any(|d| match_glob(&san.dns, d)) {
                return None;
            }
            score += SCORE_MTLS_FIELD;
        }
        if !san.ip.is_empty() {
            if !identity.san_ip.iter().any(|ip| ip == &san.ip) {
                return None;
            }
            score += SCORE_MTLS_FIELD;
        }
        if !san.uri.is_empty() {
            if !identity.san_uri.iter().any(|u| u == &san.uri) {
                return None;
            }
            score += SCORE_MTLS_FIELD;
        }
    }

    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".into(),
            path: "/api/orders".into(),
            query: [("debug".to_string(), "1".to_string())].into(),
            headers: [("content-type".to_string(), "application/json".to_string())].into(),
            body: r#"{"item": "book", "qty": 2}"#.into(),
            ..Default::default()
        }
    }

    #[test]
    fn all_constraints_accumulate_score() {
        let matcher: HttpMatcher = serde_json::from_value(json!({
            "method": "POST",
            "path": "/api/orders",
            "headers": {"Content-Type": "application/json"},
            "queryParams": {"debug": "1"},
            "bodyJsonPath": {"$.item": "book"}
        }))
        .unwrap();
        let outcome = match_http(&matcher, &snapshot()).unwrap();
        assert_eq!(
            outcome.score,
            SCORE_METHOD
                + super::super::SCORE_PATH_EXACT
                + SCORE_HEADER
                + SCORE_QUERY_PARAM
                + SCORE_JSONPATH_CONDITION
        );
        assert_eq!(outcome.jsonpath_values.get("item"), Some(&json!("book")));
    }

    #[test]
    fn method_mismatch_fails() {
        let matcher: HttpMatcher = serde_json::from_value(json!({
            "method": "GET",
            "path": "/api/orders"
        }))
        .unwrap();
        assert!(match_http(&matcher, &snapshot()).is_none());
    }

    #[test]
    fn header_wildcard_matches() {
        let matcher: HttpMatcher = serde_json::from_value(json!({
            "headers": {"content-type": "application/*"}
        }))
        .unwrap();
        assert!(match_http(&matcher, &snapshot()).is_some());
    }

    #[test]
    fn body_predicates_combine_with_and() {
        let matcher: HttpMatcher = serde_json::from_value(json!({
            "bodyContains": "book",
            "bodyPattern": r#""qty":\s*2"#
        }))
        .unwrap();
        let outcome = match_http(&matcher, &snapshot()).unwrap();
        assert_eq!(outcome.score, SCORE_BODY_CONTAINS + SCORE_BODY_PATTERN);

        let failing: HttpMatcher = serde_json::from_value(json!({
            "bodyContains": "book",
            "bodyPattern": r#""qty":\s*3"#
        }))
        .unwrap();
        assert!(match_http(&failing, &snapshot()).is_none());
    }

    #[test]
    fn mtls_required_without_cert_fails() {
        let matcher: HttpMatcher = serde_json::from_value(json!({
            "mtls": {"requireAuth": true}
        }))
        .unwrap();
        assert!(match_http(&matcher, &snapshot()).is_none());

        let mut with_cert = snapshot();
        with_cert.mtls = Some(MtlsIdentity {
            verified: true,
            common_name: "client.test".into(),
            ..Default::default()
        });
        assert!(match_http(&matcher, &with_cert).is_some());
    }

    #[test]
    fn path_params_extracted_on_match() {
        let matcher: HttpMatcher = serde_json::from_value(json!({
            "path": "/api/{collection}"
        }))
        .unwrap();
        let outcome = match_http(&matcher, &snapshot()).unwrap();
        assert_eq!(
            outcome.path_params.get("collection").map(String::as_str),
            Some("orders")
        );
    }
}
