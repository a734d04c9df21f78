//! Near-miss diagnostics: when no mock matches, explain per mock which
//! matcher fields agreed and which disagreed. Only computed on unmatched
//! requests, so matched traffic pays nothing for it.

use super::http::header_matches;
use super::path::{match_path, match_path_pattern, max_path_score};
use super::{jsonpath, RequestSnapshot};
use super::{
    SCORE_BODY_CONTAINS, SCORE_BODY_EQUALS, SCORE_BODY_PATTERN, SCORE_HEADER,
    SCORE_JSONPATH_CONDITION, SCORE_METHOD, SCORE_PATH_PATTERN, SCORE_QUERY_PARAM,
};
use crate::mock::{HttpMatcher, Mock, MockSpec};
use serde::Serialize;
use std::sync::Arc;

/// Match result for one declared matcher field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldResult {
    pub field: String,
    pub matched: bool,
    pub score: i32,
    pub max_score: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expected: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub actual: String,
}

/// A mock that partially matched an incoming request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearMiss {
    pub mock_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mock_name: String,
    pub score: i32,
    pub max_possible_score: i32,
    pub match_percentage: i32,
    pub fields: Vec<FieldResult>,
    pub reason: String,
}

/// Evaluate every declared field without short-circuiting.
pub fn match_breakdown(matcher: &HttpMatcher, snapshot: &RequestSnapshot) -> NearMiss {
    let mut fields: Vec<FieldResult> = Vec::new();
    let mut score = 0;
    let mut max = 0;

    if !matcher.method.is_empty() {
        let matched = matcher.method.eq_ignore_ascii_case(&snapshot.method);
        push_field(
            &mut fields,
            "method",
            matched,
            SCORE_METHOD,
            &matcher.method,
            &snapshot.method,
        );
        score += if matched { SCORE_METHOD } else { 0 };
        max += SCORE_METHOD;
    }

    if !matcher.path.is_empty() {
        let path_score = match_path(&matcher.path, &snapshot.path);
        let field_max = max_path_score(&matcher.path);
        fields.push(FieldResult {
            field: "path".into(),
            matched: path_score > 0,
            score: path_score,
            max_score: field_max,
            expected: matcher.path.clone(),
            actual: snapshot.path.clone(),
        });
        score += path_score;
        max += field_max;
    }

    if !matcher.path_pattern.is_empty() {
        let (path_score, _) = match_path_pattern(&matcher.path_pattern, &snapshot.path);
        fields.push(FieldResult {
            field: "pathPattern".into(),
            matched: path_score > 0,
            score: path_score,
            max_score: SCORE_PATH_PATTERN,
            expected: matcher.path_pattern.clone(),
            actual: snapshot.path.clone(),
        });
        score += path_score;
        max += SCORE_PATH_PATTERN;
    }

    for (name, expected) in &matcher.headers {
        let matched = header_matches(snapshot, name, expected);
        let actual = snapshot.header(name).unwrap_or("(missing)");
        push_field(
            &mut fields,
            &format!("header.{name}"),
            matched,
            SCORE_HEADER,
            expected,
            actual,
        );
        score += if matched { SCORE_HEADER } else { 0 };
        max += SCORE_HEADER;
    }

    for (name, expected) in &matcher.query_params {
        let actual = snapshot.query.get(name).map(String::as_str);
        let matched = actual == Some(expected.as_str());
        push_field(
            &mut fields,
            &format!("query.{name}"),
            matched,
            SCORE_QUERY_PARAM,
            expected,
            actual.unwrap_or("(missing)"),
        );
        score += if matched { SCORE_QUERY_PARAM } else { 0 };
        max += SCORE_QUERY_PARAM;
    }

    if !matcher.body_equals.is_empty() {
        let matched = snapshot.body == matcher.body_equals;
        push_field(
            &mut fields,
            "bodyEquals",
            matched,
            SCORE_BODY_EQUALS,
            &truncate(&matcher.body_equals, 200),
            &truncate(&snapshot.body, 200),
        );
        score += if matched { SCORE_BODY_EQUALS } else { 0 };
        max += SCORE_BODY_EQUALS;
    }

    if !matcher.body_contains.is_empty() {
        let matched = snapshot.body.contains(&matcher.body_contains);
        push_field(
            &mut fields,
            "bodyContains",
            matched,
            SCORE_BODY_CONTAINS,
            &format!("contains {:?}", matcher.body_contains),
            if matched {
                "(body contains substring)"
            } else {
                "(body does not contain substring)"
            },
        );
        score += if matched { SCORE_BODY_CONTAINS } else { 0 };
        max += SCORE_BODY_CONTAINS;
    }

    if !matcher.body_pattern.is_empty() {
        let matched = regex::Regex::new(&matcher.body_pattern)
            .map(|re| re.is_match(&snapshot.body))
            .unwrap_or(false);
        push_field(
            &mut fields,
            "bodyPattern",
            matched,
            SCORE_BODY_PATTERN,
            &matcher.body_pattern,
            if matched {
                "(body matches pattern)"
            } else {
                "(body does not match pattern)"
            },
        );
        score += if matched { SCORE_BODY_PATTERN } else { 0 };
        max += SCORE_BODY_PATTERN;
    }

    for (expr, expected) in &matcher.body_json_path {
        let actual = jsonpath::extract(&snapshot.body, expr);
        let matched = actual
            .as_ref()
            .is_some_and(|a| jsonpath::loose_eq(a, expected));
        push_field(
            &mut fields,
            &format!("bodyJsonPath.{expr}"),
            matched,
            SCORE_JSONPATH_CONDITION,
            &expected.to_string(),
            &actual
                .map(|a| jsonpath::value_to_string(&a))
                .unwrap_or_else(|| "(missing)".to_string()),
        );
        score += if matched { SCORE_JSONPATH_CONDITION } else { 0 };
        max += SCORE_JSONPATH_CONDITION;
    }

    let match_percentage = if max > 0 { (score * 100) / max } else { 0 };
    let reason = generate_reason(&fields);

    NearMiss {
        mock_id: String::new(),
        mock_name: String::new(),
        score,
        max_possible_score: max,
        match_percentage,
        fields,
        reason,
    }
}

fn push_field(
    fields: &mut Vec<FieldResult>,
    name: &str,
    matched: bool,
    max_score: i32,
    expected: &str,
    actual: &str,
) {
    fields.push(FieldResult {
        field: name.to_string(),
        matched,
        score: if matched { max_score } else { 0 },
        max_score,
        expected: expected.to_string(),
        actual: actual.to_string(),
    });
}

/// Evaluate all same-protocol mocks against the request and return the top N
/// partial matches by score. Mocks with nothing matched at all are dropped.
pub fn collect_near_misses(
    mocks: &[Arc<Mock>],
    snapshot: &RequestSnapshot,
    top_n: usize,
) -> Vec<NearMiss> {
    let top_n = if top_n == 0 { 3 } else { top_n };
    let mut candidates: Vec<NearMiss> = Vec::new();

    for mock in mocks {
        if !mock.enabled {
            continue;
        }
        let matcher = match &mock.spec {
            MockSpec::Http(spec) => &spec.matcher,
            MockSpec::Sse(spec) => &spec.matcher,
            _ => continue,
        };
        let mut nm = match_breakdown(matcher, snapshot);
        if nm.score == 0 {
            continue;
        }
        nm.mock_id = mock.id.clone();
        nm.mock_name = mock.name.clone();
        candidates.push(nm);
    }

    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.match_percentage.cmp(&a.match_percentage))
    });
    candidates.truncate(top_n);
    candidates
}

/// Human-readable explanation: names matched fields, then the first mismatch.
fn generate_reason(fields: &[FieldResult]) -> String {
    if fields.is_empty() {
        return "no fields to compare".to_string();
    }

    let matched: Vec<&str> = fields
        .iter()
        .filter(|f| f.matched)
        .map(|f| f.field.as_str())
        .collect();
    let first_miss = fields.iter().find(|f| !f.matched);

    let Some(miss) = first_miss else {
        return "all specified fields matched".to_string();
    };

    let mismatch = format_mismatch(miss);
    if matched.is_empty() {
        mismatch
    } else {
        format!("{} matched, but {}", join_fields(&matched), mismatch)
    }
}

fn format_mismatch(f: &FieldResult) -> String {
    match f.field.as_str() {
        "method" => format!("method expected {:?}, got {:?}", f.expected, f.actual),
        "path" | "pathPattern" => format!("path expected {:?}, got {:?}", f.expected, f.actual),
        "bodyEquals" => format!("body expected exact match {:?}", f.expected),
        "bodyContains" => format!("body expected to contain {}", f.expected),
        "bodyPattern" => format!("body expected to match pattern {:?}", f.expected),
        name if name.starts_with("header.") => format!(
            "header {} expected {:?}, got {:?}",
            &name[7..],
            f.expected,
            f.actual
        ),
        name if name.starts_with("query.") => format!(
            "query param {} expected {:?}, got {:?}",
            &name[6..],
            f.expected,
            f.actual
        ),
        name if name.starts_with("bodyJsonPath.") => {
            format!("body JSONPath {} condition not satisfied", &name[13..])
        }
        name => format!("{name} did not match"),
    }
}

fn join_fields(fields: &[&str]) -> String {
    match fields.len() {
        0 => String::new(),
        1 => fields[0].to_string(),
        2 => format!("{} and {}", fields[0], fields[1]),
        n => format!("{}, and {}", fields[..n - 1].join(", "), fields[n - 1]),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(method: &str, path: &str) -> RequestSnapshot {
        RequestSnapshot {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    fn matcher(method: &str, path: &str) -> HttpMatcher {
        serde_json::from_value(json!({"method": method, "path": path})).unwrap()
    }

    #[test]
    fn full_match_reports_all_fields_matched() {
        let nm = match_breakdown(&matcher("GET", "/x"), &snapshot("GET", "/x"));
        assert_eq!(nm.score, SCORE_METHOD + super::super::SCORE_PATH_EXACT);
        assert_eq!(nm.match_percentage, 100);
        assert_eq!(nm.reason, "all specified fields matched");
    }

    #[test]
    fn method_mismatch_explained() {
        let nm = match_breakdown(&matcher("GET", "/x"), &snapshot("DELETE", "/x"));
        assert_eq!(nm.score, super::super::SCORE_PATH_EXACT);
        assert_eq!(
            nm.reason,
            "path matched, but method expected \"GET\", got \"DELETE\""
        );
    }

    #[test]
    fn percentage_is_partial_over_max() {
        let nm = match_breakdown(&matcher("GET", "/x"), &snapshot("GET", "/y"));
        let expected =
            (SCORE_METHOD * 100) / (SCORE_METHOD + super::super::SCORE_PATH_EXACT);
        assert_eq!(nm.match_percentage, expected);
    }

    #[test]
    fn collect_filters_zero_scores_and_sorts() {
        let make = |id: &str, method: &str, path: &str| -> Arc<Mock> {
            Arc::new(
                serde_json::from_value(json!({
                    "id": id,
                    "type": "http",
                    "http": {
                        "matcher": {"method": method, "path": path},
                        "response": {"statusCode": 200, "body": ""}
                    }
                }))
                .unwrap(),
            )
        };
        let mocks = vec![
            make("nothing", "PUT", "/zzz"),
            make("close", "GET", "/hello"),
            make("partial", "POST", "/hello"),
        ];
        let misses = collect_near_misses(&mocks, &snapshot("GET", "/hello"), 3);
        // "nothing" matched no field at all and is dropped; "close" (method+path)
        // sorts above "partial" (path only).
        assert_eq!(misses.len(), 2);
        assert_eq!(misses[0].mock_id, "close");
        assert_eq!(misses[1].mock_id, "partial");
    }
}
