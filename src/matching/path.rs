//! Path matching: literals, `{param}` placeholders, globs, and regex patterns.

use super::{SCORE_PATH_EXACT, SCORE_PATH_NAMED_PARAMS, SCORE_PATH_PATTERN, SCORE_PATH_WILDCARD};
use std::collections::HashMap;

/// Match a request path against a pattern.
/// Returns a score > 0 on match; exact matches outrank placeholder and glob
/// matches so specificity ranking falls out of the score.
pub fn match_path(pattern: &str, path: &str) -> i32 {
    if pattern == path {
        return SCORE_PATH_EXACT;
    }

    if pattern.contains('{') && pattern.contains('}') && match_named_params(pattern, path) {
        return SCORE_PATH_NAMED_PARAMS;
    }

    // Trailing wildcard also matches the bare prefix: "/api/*" matches "/api".
    if let Some(prefix) = pattern.strip_suffix("/*") {
        if path == prefix || path.starts_with(&format!("{prefix}/")) {
            return SCORE_PATH_WILDCARD;
        }
    }

    if pattern.contains('*') && match_glob(pattern, path) {
        return SCORE_PATH_WILDCARD;
    }

    0
}

fn match_named_params(pattern: &str, path: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_parts: Vec<&str> = path.trim_matches('/').split('/').collect();

    if pattern_parts.len() != path_parts.len() {
        return false;
    }

    pattern_parts.iter().zip(&path_parts).all(|(pat, actual)| {
        (pat.starts_with('{') && pat.ends_with('}')) || pat == actual
    })
}

/// Glob match where `*` spans any run of characters.
pub fn match_glob(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !value.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            if !value[pos..].ends_with(part) {
                return false;
            }
        } else {
            match value[pos..].find(part) {
                Some(idx) => pos += idx + part.len(),
                None => return false,
            }
        }
    }
    true
}

/// Match against a regex pattern, returning named capture groups for
/// template access. Invalid patterns score zero rather than erroring.
pub fn match_path_pattern(pattern: &str, path: &str) -> (i32, HashMap<String, String>) {
    if pattern.is_empty() {
        return (0, HashMap::new());
    }
    let re = match regex::Regex::new(pattern) {
        Ok(re) => re,
        Err(_) => return (0, HashMap::new()),
    };
    let Some(caps) = re.captures(path) else {
        return (0, HashMap::new());
    };

    let mut captures = HashMap::new();
    for name in re.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            captures.insert(name.to_string(), m.as_str().to_string());
        }
    }
    (SCORE_PATH_PATTERN, captures)
}

/// Extract `{param}` values from a placeholder path.
pub fn extract_path_params(pattern: &str, path: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let pattern_parts: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_parts: Vec<&str> = path.trim_matches('/').split('/').collect();

    for (pat, actual) in pattern_parts.iter().zip(&path_parts) {
        if pat.starts_with('{') && pat.ends_with('}') {
            params.insert(pat[1..pat.len() - 1].to_string(), (*actual).to_string());
        }
    }
    params
}

/// Highest score a given path pattern can earn, for near-miss percentages.
pub fn max_path_score(pattern: &str) -> i32 {
    if pattern.contains('{') {
        SCORE_PATH_NAMED_PARAMS
    } else if pattern.contains('*') {
        SCORE_PATH_WILDCARD
    } else {
        SCORE_PATH_EXACT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_params_beats_glob() {
        assert_eq!(match_path("/api/users", "/api/users"), SCORE_PATH_EXACT);
        assert_eq!(
            match_path("/api/users/{id}", "/api/users/42"),
            SCORE_PATH_NAMED_PARAMS
        );
        assert_eq!(
            match_path("/api/users/*", "/api/users/42"),
            SCORE_PATH_WILDCARD
        );
        assert!(SCORE_PATH_EXACT > SCORE_PATH_NAMED_PARAMS);
        assert!(SCORE_PATH_NAMED_PARAMS > SCORE_PATH_WILDCARD);
    }

    #[test]
    fn trailing_wildcard_matches_bare_prefix() {
        assert_eq!(match_path("/api/*", "/api"), SCORE_PATH_WILDCARD);
        assert_eq!(match_path("/api/*", "/api/a/b"), SCORE_PATH_WILDCARD);
        assert_eq!(match_path("/api/*", "/other"), 0);
    }

    #[test]
    fn named_params_require_equal_depth() {
        assert_eq!(match_path("/users/{id}", "/users/1/posts"), 0);
        assert_eq!(match_path("/users/{id}/posts/{pid}", "/users/1/posts/2"), 12);
    }

    #[test]
    fn regex_pattern_captures_named_groups() {
        let (score, caps) = match_path_pattern(r"^/users/(?P<id>\d+)$", "/users/42");
        assert_eq!(score, SCORE_PATH_PATTERN);
        assert_eq!(caps.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn invalid_regex_scores_zero() {
        let (score, _) = match_path_pattern("([", "/anything");
        assert_eq!(score, 0);
    }

    #[test]
    fn extracts_params() {
        let params = extract_path_params("/users/{id}/posts/{pid}", "/users/7/posts/9");
        assert_eq!(params.get("id").map(String::as_str), Some("7"));
        assert_eq!(params.get("pid").map(String::as_str), Some("9"));
    }
}
