//! Structural validation for mock definitions.
//!
//! Every mutating admin endpoint and the config loader run mocks through
//! [`validate_mock`] before committing them to the registry. Failures carry
//! field-level detail so clients can pinpoint the offending key.

use super::types::{HttpMatcher, Mock, MockSpec};
use serde::Serialize;

/// A single field-level validation failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    /// JSON-pointer-ish location, e.g. "http.matcher.pathPattern".
    pub location: String,
    /// Stable machine-readable code.
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub received: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expected: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hint: String,
}

/// Validation failure: one or more field errors. No partial commit happens.
#[derive(Debug, thiserror::Error)]
#[error("mock validation failed: {} field error(s)", errors.len())]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

struct Collector {
    errors: Vec<FieldError>,
}

impl Collector {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn push(&mut self, location: &str, code: &str, received: &str, expected: &str, hint: &str) {
        self.errors.push(FieldError {
            location: location.to_string(),
            code: code.to_string(),
            received: received.to_string(),
            expected: expected.to_string(),
            hint: hint.to_string(),
        });
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                errors: self.errors,
            })
        }
    }
}

/// Validate a mock definition against its schema.
pub fn validate_mock(mock: &Mock) -> Result<(), ValidationError> {
    let mut c = Collector::new();

    match &mock.spec {
        MockSpec::Http(spec) => {
            validate_http_matcher(&spec.matcher, "http.matcher", &mut c);
            if spec.response.is_none() && spec.stateful_operation.is_empty() {
                c.push(
                    "http.response",
                    "required",
                    "",
                    "response or statefulOperation",
                    "an HTTP mock needs a response template or a custom operation",
                );
            }
            if let Some(resp) = &spec.response {
                if resp.status_code < 100 || resp.status_code > 599 {
                    c.push(
                        "http.response.statusCode",
                        "out_of_range",
                        &resp.status_code.to_string(),
                        "100-599",
                        "",
                    );
                }
            }
        }
        MockSpec::Sse(spec) => {
            validate_http_matcher(&spec.matcher, "sse.matcher", &mut c);
            if spec.events.is_empty() && spec.generator.is_none() {
                c.push(
                    "sse.events",
                    "required",
                    "",
                    "events or generator",
                    "an SSE mock needs an event list or a generator",
                );
            }
            if let Some(rd) = &spec.timing.random_delay {
                if rd.min > rd.max {
                    c.push(
                        "sse.timing.randomDelay",
                        "invalid_range",
                        &format!("{}..{}", rd.min, rd.max),
                        "min <= max",
                        "",
                    );
                }
            }
        }
        MockSpec::WebSocket(spec) => {
            if !spec.path.starts_with('/') {
                c.push("websocket.path", "invalid_path", &spec.path, "/…", "");
            }
            for (i, m) in spec.matchers.iter().enumerate() {
                match m.criteria.kind.as_str() {
                    "exact" | "contains" => {}
                    "jsonPath" => {
                        if m.criteria.path.is_empty() {
                            c.push(
                                &format!("websocket.matchers[{i}].match.path"),
                                "required",
                                "",
                                "JSONPath expression",
                                "",
                            );
                        }
                    }
                    other => c.push(
                        &format!("websocket.matchers[{i}].match.type"),
                        "unknown_value",
                        other,
                        "exact|contains|jsonPath",
                        "",
                    ),
                }
            }
        }
        MockSpec::GraphQL(spec) => {
            if !spec.path.starts_with('/') {
                c.push("graphql.path", "invalid_path", &spec.path, "/…", "");
            }
            if spec.resolvers.is_empty() && spec.subscriptions.is_empty() {
                c.push(
                    "graphql.resolvers",
                    "required",
                    "",
                    "at least one resolver or subscription",
                    "",
                );
            }
        }
        MockSpec::Grpc(spec) => {
            if spec.port == 0 {
                c.push("grpc.port", "required", "0", "1-65535", "");
            }
            if spec.services.is_empty() {
                c.push("grpc.services", "required", "", "at least one service", "");
            }
            for (svc, cfg) in &spec.services {
                if cfg.methods.is_empty() {
                    c.push(
                        &format!("grpc.services.{svc}.methods"),
                        "required",
                        "",
                        "at least one method",
                        "",
                    );
                }
            }
        }
        MockSpec::Soap(spec) => {
            if !spec.path.starts_with('/') {
                c.push("soap.path", "invalid_path", &spec.path, "/…", "");
            }
            if spec.operations.is_empty() {
                c.push(
                    "soap.operations",
                    "required",
                    "",
                    "at least one operation",
                    "",
                );
            }
        }
        MockSpec::Mqtt(spec) => {
            if spec.port == 0 {
                c.push("mqtt.port", "required", "0", "1-65535", "");
            }
            for (i, topic) in spec.topics.iter().enumerate() {
                if let Err(reason) = validate_topic_filter(&topic.topic) {
                    c.push(
                        &format!("mqtt.topics[{i}].topic"),
                        "invalid_topic_filter",
                        &topic.topic,
                        "MQTT topic filter",
                        reason,
                    );
                }
                if topic.qos > 2 {
                    c.push(
                        &format!("mqtt.topics[{i}].qos"),
                        "out_of_range",
                        &topic.qos.to_string(),
                        "0-2",
                        "",
                    );
                }
            }
            if let Some(auth) = &spec.auth {
                for (u, user) in auth.users.iter().enumerate() {
                    for (a, rule) in user.acl.iter().enumerate() {
                        if let Err(reason) = validate_topic_filter(&rule.topic) {
                            c.push(
                                &format!("mqtt.auth.users[{u}].acl[{a}].topic"),
                                "invalid_topic_filter",
                                &rule.topic,
                                "MQTT topic filter",
                                reason,
                            );
                        }
                        match rule.access.as_str() {
                            "read" | "write" | "readwrite" => {}
                            other => c.push(
                                &format!("mqtt.auth.users[{u}].acl[{a}].access"),
                                "unknown_value",
                                other,
                                "read|write|readwrite",
                                "",
                            ),
                        }
                    }
                }
            }
        }
        MockSpec::OAuth(spec) => {
            if !spec.issuer.starts_with('/') {
                c.push(
                    "oauth.issuer",
                    "invalid_path",
                    &spec.issuer,
                    "/…",
                    "issuer is mounted as a path on the primary listener",
                );
            }
        }
    }

    c.finish()
}

fn validate_http_matcher(matcher: &HttpMatcher, location: &str, c: &mut Collector) {
    if !matcher.path.is_empty() && !matcher.path_pattern.is_empty() {
        c.push(
            &format!("{location}.pathPattern"),
            "mutually_exclusive",
            &matcher.path_pattern,
            "",
            "path and pathPattern cannot both be set",
        );
    }
    if !matcher.path_pattern.is_empty() {
        if let Err(e) = regex::Regex::new(&matcher.path_pattern) {
            c.push(
                &format!("{location}.pathPattern"),
                "invalid_regex",
                &matcher.path_pattern,
                "valid regex",
                &e.to_string(),
            );
        }
    }
    if !matcher.body_pattern.is_empty() {
        if let Err(e) = regex::Regex::new(&matcher.body_pattern) {
            c.push(
                &format!("{location}.bodyPattern"),
                "invalid_regex",
                &matcher.body_pattern,
                "valid regex",
                &e.to_string(),
            );
        }
    }
    if !matcher.cn_pattern_valid() {
        c.push(
            &format!("{location}.mtls.cnPattern"),
            "invalid_regex",
            "",
            "valid regex",
            "",
        );
    }
}

impl HttpMatcher {
    fn cn_pattern_valid(&self) -> bool {
        match &self.mtls {
            Some(m) if !m.cn_pattern.is_empty() => regex::Regex::new(&m.cn_pattern).is_ok(),
            _ => true,
        }
    }
}

/// Check an MQTT topic filter: `+` matches one level anywhere, `#` matches
/// the remainder and is only valid as the final segment.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("filter is empty");
    }
    let segments: Vec<&str> = filter.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if *seg == "#" {
            if i != segments.len() - 1 {
                return Err("# is only valid as the last segment");
            }
        } else if seg.contains('#') || (seg.contains('+') && *seg != "+") {
            return Err("wildcards must occupy a whole segment");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::types::*;

    fn http_mock(matcher: HttpMatcher) -> Mock {
        serde_json::from_value(serde_json::json!({
            "id": "m",
            "type": "http",
            "http": {
                "matcher": serde_json::to_value(&matcher).unwrap(),
                "response": {"statusCode": 200, "body": "ok"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn accepts_minimal_http_mock() {
        let mock = http_mock(HttpMatcher {
            method: "GET".into(),
            path: "/x".into(),
            ..Default::default()
        });
        assert!(validate_mock(&mock).is_ok());
    }

    #[test]
    fn rejects_path_and_pattern_together() {
        let mock = http_mock(HttpMatcher {
            path: "/x".into(),
            path_pattern: "^/x$".into(),
            ..Default::default()
        });
        let err = validate_mock(&mock).unwrap_err();
        assert_eq!(err.errors[0].code, "mutually_exclusive");
    }

    #[test]
    fn rejects_invalid_body_regex() {
        let mock = http_mock(HttpMatcher {
            path: "/x".into(),
            body_pattern: "([".into(),
            ..Default::default()
        });
        let err = validate_mock(&mock).unwrap_err();
        assert!(err.errors.iter().any(|e| e.code == "invalid_regex"));
    }

    #[test]
    fn topic_filter_hash_must_be_last() {
        assert!(validate_topic_filter("devices/#").is_ok());
        assert!(validate_topic_filter("devices/+/status").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("devices/#/status").is_err());
        assert!(validate_topic_filter("devices/st#tus").is_err());
        assert!(validate_topic_filter("").is_err());
    }

    #[test]
    fn mqtt_mock_with_interior_hash_rejected() {
        let mock: Mock = serde_json::from_value(serde_json::json!({
            "id": "m",
            "type": "mqtt",
            "mqtt": {
                "port": 1883,
                "topics": [{"topic": "a/#/b"}]
            }
        }))
        .unwrap();
        let err = validate_mock(&mock).unwrap_err();
        assert_eq!(err.errors[0].code, "invalid_topic_filter");
    }
}
