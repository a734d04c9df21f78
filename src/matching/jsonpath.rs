//! Minimal JSONPath evaluation for body predicates.
//!
//! Supports the subset used by matchers and templates:
//! - `$.field` / `$.field.nested`
//! - `$.array[0]` and `$.array[*].field` (first match wins)

use serde_json::Value;

/// Extract the value at `path` from a JSON document string.
pub fn extract(body: &str, path: &str) -> Option<Value> {
    let json: Value = serde_json::from_str(body).ok()?;
    extract_value(&json, path).cloned()
}

/// Extract the value at `path` from a parsed JSON value.
pub fn extract_value<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let path = path.strip_prefix('$').unwrap_or(path);
    navigate(json, path)
}

/// Render an extracted value as a plain string (strings unquoted).
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn navigate<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    // Split off the next segment at the first `.` or `[`.
    let (segment, rest) = match (path.find('.'), path.find('[')) {
        (Some(d), Some(b)) if d < b => (&path[..d], &path[d + 1..]),
        (_, Some(b)) => (&path[..b], &path[b..]),
        (Some(d), None) => (&path[..d], &path[d + 1..]),
        (None, None) => (path, ""),
    };

    if segment.is_empty() && path.starts_with('[') {
        let end = path.find(']')?;
        let index_str = &path[1..end];
        let mut rest = &path[end + 1..];
        rest = rest.strip_prefix('.').unwrap_or(rest);

        if index_str == "*" {
            let arr = value.as_array()?;
            for item in arr {
                if let Some(found) = navigate(item, rest) {
                    return Some(found);
                }
            }
            return None;
        }
        let index: usize = index_str.parse().ok()?;
        return navigate(value.as_array()?.get(index)?, rest);
    }

    navigate(value.as_object()?.get(segment)?, rest)
}

/// Loose equality for JSONPath predicates: numbers compare numerically and a
/// string expectation matches the stringified actual value.
pub fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (_, Value::String(e)) => value_to_string(actual) == *e,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_top_level_field() {
        assert_eq!(
            extract(r#"{"name": "John"}"#, "$.name"),
            Some(json!("John"))
        );
    }

    #[test]
    fn extracts_nested_field() {
        assert_eq!(
            extract(r#"{"user": {"id": 7}}"#, "$.user.id"),
            Some(json!(7))
        );
    }

    #[test]
    fn extracts_array_index() {
        assert_eq!(
            extract(r#"{"items": [{"id": 1}, {"id": 2}]}"#, "$.items[1].id"),
            Some(json!(2))
        );
    }

    #[test]
    fn wildcard_returns_first_match() {
        assert_eq!(
            extract(r#"{"items": [{"x": 1}, {"id": 5}]}"#, "$.items[*].id"),
            Some(json!(5))
        );
    }

    #[test]
    fn missing_path_returns_none() {
        assert_eq!(extract(r#"{"a": 1}"#, "$.b"), None);
        assert_eq!(extract("not json", "$.a"), None);
    }

    #[test]
    fn loose_eq_matches_number_against_string() {
        assert!(loose_eq(&json!(42), &json!("42")));
        assert!(loose_eq(&json!(42), &json!(42.0)));
        assert!(!loose_eq(&json!(42), &json!("43")));
    }
}
