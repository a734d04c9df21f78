//! Response templating.
//!
//! Bodies, headers, and stream payloads may contain `{{expression}}`
//! placeholders. A template parses once into a segment list; rendering walks
//! the segments with the request context. Errors are data: an unknown or
//! failing expression renders as an empty string and never aborts the
//! response.
//!
//! Recognized expressions: `now`, `timestamp`, `uuid`, `uuid.short`,
//! `random`, `random.float`, `random.int min max`, `random.string n`,
//! `upper x`, `lower x`, `default x fallback`, `sequence name`, `mock.id`,
//! `request.*`, `mtls.*`, `state.resource.id.field`, `faker.*`.

mod faker;

pub use faker::faker_value;

use crate::matching::{jsonpath, RequestSnapshot};
use crate::stateful::StateStore;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap());

/// Monotonic counters keyed by name, shared across all mocks of an engine.
#[derive(Default)]
pub struct SequenceStore {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value for a named sequence, starting at 1.
    pub fn next(&self, name: &str) -> u64 {
        let counter = {
            let mut map = self.counters.lock();
            Arc::clone(map.entry(name.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset(&self) {
        self.counters.lock().clear();
    }
}

/// Rendering context: everything an expression may read.
#[derive(Clone, Copy, Default)]
pub struct Context<'a> {
    pub request: Option<&'a RequestSnapshot>,
    pub mock_id: &'a str,
    pub path_params: Option<&'a HashMap<String, String>>,
    pub pattern_captures: Option<&'a HashMap<String, String>>,
    pub jsonpath_values: Option<&'a HashMap<String, serde_json::Value>>,
    pub state: Option<&'a StateStore>,
    pub sequences: Option<&'a SequenceStore>,
}

/// A parsed template: literal runs interleaved with expressions.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Expr(String),
}

impl Template {
    /// Parse a template once. Parsing never fails: malformed placeholders
    /// stay literal.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(source) {
            let whole = caps.get(0).unwrap();
            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Expr(caps[1].trim().to_string()));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }
        Self { segments }
    }

    /// True when the template contains no expressions at all.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render(&self, ctx: &Context<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Expr(expr) => out.push_str(&evaluate(expr, ctx)),
            }
        }
        out
    }
}

/// Parse-and-render convenience for one-shot strings.
pub fn render_str(source: &str, ctx: &Context<'_>) -> String {
    if !source.contains("{{") {
        return source.to_string();
    }
    Template::parse(source).render(ctx)
}

/// Recursively render every string inside a JSON value. Used for GraphQL,
/// gRPC, and stream payload configs.
pub fn render_json(value: &serde_json::Value, ctx: &Context<'_>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(render_str(s, ctx)),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_json(v, ctx)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render_json(v, ctx)).collect())
        }
        other => other.clone(),
    }
}

/// Render a header map.
pub fn render_headers(
    headers: &HashMap<String, String>,
    ctx: &Context<'_>,
) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), render_str(v, ctx)))
        .collect()
}

fn evaluate(expr: &str, ctx: &Context<'_>) -> String {
    match expr {
        "now" => return chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "timestamp" => return chrono::Utc::now().timestamp().to_string(),
        "uuid" => return uuid::Uuid::new_v4().to_string(),
        "uuid.short" => {
            return uuid::Uuid::new_v4().to_string()[..8].to_string();
        }
        "random" => {
            let mut rng = rand::thread_rng();
            return format!("{:08x}", rng.gen::<u32>());
        }
        "random.float" => {
            let mut rng = rand::thread_rng();
            return format!("{:.6}", rng.gen::<f64>());
        }
        "mock.id" => return ctx.mock_id.to_string(),
        _ => {}
    }

    if let Some(name) = expr.strip_prefix("faker.") {
        return faker_value(name).unwrap_or_default();
    }
    if let Some(rest) = expr.strip_prefix("request.") {
        return evaluate_request(rest, ctx);
    }
    if let Some(rest) = expr.strip_prefix("mtls.") {
        return evaluate_mtls(rest, ctx);
    }
    if let Some(rest) = expr.strip_prefix("state.") {
        return evaluate_state(rest, ctx);
    }

    // Function-style expressions with space-separated args.
    let mut parts = expr.split_whitespace();
    let Some(func) = parts.next() else {
        return String::new();
    };
    let args: Vec<&str> = parts.collect();

    match func {
        "random.int" => {
            if args.len() != 2 {
                return String::new();
            }
            let (Ok(min), Ok(max)) = (args[0].parse::<i64>(), args[1].parse::<i64>()) else {
                return String::new();
            };
            if min > max {
                return String::new();
            }
            let mut rng = rand::thread_rng();
            rng.gen_range(min..=max).to_string()
        }
        "random.string" => {
            let len = args
                .first()
                .and_then(|a| a.parse::<usize>().ok())
                .unwrap_or(8)
                .min(1024);
            let mut rng = rand::thread_rng();
            const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            (0..len)
                .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
                .collect()
        }
        "upper" => resolve_arg(args.first(), ctx).to_uppercase(),
        "lower" => resolve_arg(args.first(), ctx).to_lowercase(),
        "default" => {
            if args.len() < 2 {
                return String::new();
            }
            let value = resolve_arg(args.first(), ctx);
            if value.is_empty() {
                strip_quotes(&args[1..].join(" "))
            } else {
                value
            }
        }
        "sequence" => {
            let Some(name) = args.first() else {
                return String::new();
            };
            match ctx.sequences {
                Some(seq) => seq.next(name).to_string(),
                None => String::new(),
            }
        }
        _ => String::new(),
    }
}

/// Resolve a function argument: context reference or quoted/bare literal.
fn resolve_arg(arg: Option<&&str>, ctx: &Context<'_>) -> String {
    let Some(arg) = arg else {
        return String::new();
    };
    if let Some(rest) = arg.strip_prefix("request.") {
        return evaluate_request(rest, ctx);
    }
    if let Some(rest) = arg.strip_prefix("mtls.") {
        return evaluate_mtls(rest, ctx);
    }
    strip_quotes(arg)
}

fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn evaluate_request(expr: &str, ctx: &Context<'_>) -> String {
    let Some(request) = ctx.request else {
        return String::new();
    };
    let (field, rest) = match expr.split_once('.') {
        Some((f, r)) => (f, Some(r)),
        None => (expr, None),
    };

    match field {
        "method" => request.method.clone(),
        "path" | "topic" => request.path.clone(),
        "url" => {
            if request.raw_query.is_empty() {
                request.path.clone()
            } else {
                format!("{}?{}", request.path, request.raw_query)
            }
        }
        "rawBody" | "payload" => request.body.clone(),
        "body" => match rest {
            Some(path) => serde_json::from_str::<serde_json::Value>(&request.body)
                .ok()
                .and_then(|json| jsonpath::extract_value(&json, path).cloned())
                .map(|v| jsonpath::value_to_string(&v))
                .unwrap_or_default(),
            None => request.body.clone(),
        },
        "query" => rest
            .and_then(|name| request.query.get(name).cloned())
            .unwrap_or_default(),
        "header" => rest
            .and_then(|name| request.header(name).map(str::to_string))
            .unwrap_or_default(),
        "pathParam" => rest
            .and_then(|name| ctx.path_params.and_then(|p| p.get(name).cloned()))
            .unwrap_or_default(),
        "pathPattern" => rest
            .and_then(|name| ctx.pattern_captures.and_then(|p| p.get(name).cloned()))
            .unwrap_or_default(),
        "jsonPath" => rest
            .and_then(|name| ctx.jsonpath_values.and_then(|p| p.get(name)))
            .map(jsonpath::value_to_string)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn evaluate_mtls(expr: &str, ctx: &Context<'_>) -> String {
    let Some(identity) = ctx.request.and_then(|r| r.mtls.as_ref()) else {
        return String::new();
    };
    match expr {
        "cn" => identity.common_name.clone(),
        "o" => identity.organization.first().cloned().unwrap_or_default(),
        "ou" => identity
            .organizational_unit
            .first()
            .cloned()
            .unwrap_or_default(),
        "verified" => identity.verified.to_string(),
        "san.dns" => identity.san_dns.first().cloned().unwrap_or_default(),
        "san.ip" => identity.san_ip.first().cloned().unwrap_or_default(),
        "san.uri" => identity.san_uri.first().cloned().unwrap_or_default(),
        _ => String::new(),
    }
}

/// `state.<resource>.<id>.<fieldpath>` — read-only store access.
fn evaluate_state(expr: &str, ctx: &Context<'_>) -> String {
    let Some(store) = ctx.state else {
        return String::new();
    };
    let mut parts = expr.splitn(3, '.');
    let (Some(resource), Some(id)) = (parts.next(), parts.next()) else {
        return String::new();
    };
    let field = parts.next().unwrap_or("");
    let Some(resource) = store.get(resource) else {
        return String::new();
    };
    resource
        .read_field(id, field)
        .map(|v| jsonpath::value_to_string(&v))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".into(),
            path: "/api/orders".into(),
            raw_query: "debug=1".into(),
            query: [("debug".to_string(), "1".to_string())].into(),
            headers: [("x-request-id".to_string(), "req-9".to_string())].into(),
            body: r#"{"user": {"name": "Ada"}, "qty": 3}"#.into(),
            ..Default::default()
        }
    }

    fn ctx<'a>(req: &'a RequestSnapshot, seq: &'a SequenceStore) -> Context<'a> {
        Context {
            request: Some(req),
            mock_id: "mock-1",
            sequences: Some(seq),
            ..Default::default()
        }
    }

    #[test]
    fn literals_pass_through_untouched() {
        let req = request();
        let seq = SequenceStore::new();
        assert_eq!(render_str("plain text", &ctx(&req, &seq)), "plain text");
    }

    #[test]
    fn request_accessors() {
        let req = request();
        let seq = SequenceStore::new();
        let c = ctx(&req, &seq);
        assert_eq!(render_str("{{request.method}}", &c), "POST");
        assert_eq!(render_str("{{request.path}}", &c), "/api/orders");
        assert_eq!(render_str("{{request.query.debug}}", &c), "1");
        assert_eq!(render_str("{{request.header.X-Request-Id}}", &c), "req-9");
        assert_eq!(render_str("{{request.body.user.name}}", &c), "Ada");
        assert_eq!(render_str("{{request.body.qty}}", &c), "3");
    }

    #[test]
    fn unknown_placeholder_renders_empty() {
        let req = request();
        let seq = SequenceStore::new();
        assert_eq!(render_str("[{{no.such.thing}}]", &ctx(&req, &seq)), "[]");
    }

    #[test]
    fn sequences_are_monotonic_per_name() {
        let req = request();
        let seq = SequenceStore::new();
        let c = ctx(&req, &seq);
        assert_eq!(render_str("{{sequence order}}", &c), "1");
        assert_eq!(render_str("{{sequence order}}", &c), "2");
        assert_eq!(render_str("{{sequence invoice}}", &c), "1");
    }

    #[test]
    fn random_int_respects_range() {
        let req = request();
        let seq = SequenceStore::new();
        let c = ctx(&req, &seq);
        for _ in 0..100 {
            let value: i64 = render_str("{{random.int 5 10}}", &c).parse().unwrap();
            assert!((5..=10).contains(&value));
        }
        assert_eq!(render_str("{{random.int 10 5}}", &c), "");
    }

    #[test]
    fn upper_lower_default() {
        let req = request();
        let seq = SequenceStore::new();
        let c = ctx(&req, &seq);
        assert_eq!(render_str("{{upper request.method}}", &c), "POST");
        assert_eq!(render_str("{{lower request.method}}", &c), "post");
        assert_eq!(
            render_str("{{default request.query.missing \"fallback\"}}", &c),
            "fallback"
        );
        assert_eq!(render_str("{{default request.query.debug \"x\"}}", &c), "1");
    }

    #[test]
    fn uuid_placeholder_is_well_formed() {
        let req = request();
        let seq = SequenceStore::new();
        let rendered = render_str("{{uuid}}", &ctx(&req, &seq));
        assert!(uuid::Uuid::parse_str(&rendered).is_ok());
        let short = render_str("{{uuid.short}}", &ctx(&req, &seq));
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn render_json_walks_nested_values() {
        let req = request();
        let seq = SequenceStore::new();
        let rendered = render_json(
            &json!({"outer": {"method": "{{request.method}}"}, "list": ["{{request.query.debug}}", 7]}),
            &ctx(&req, &seq),
        );
        assert_eq!(rendered["outer"]["method"], "POST");
        assert_eq!(rendered["list"][0], "1");
        assert_eq!(rendered["list"][1], 7);
    }

    #[test]
    fn parsed_template_reports_literalness() {
        assert!(Template::parse("no placeholders").is_literal());
        assert!(!Template::parse("{{uuid}}").is_literal());
    }

    #[test]
    fn state_reads_through_store() {
        let store = StateStore::new();
        store
            .register(
                serde_json::from_value(json!({
                    "name": "users",
                    "seedData": [{"id": "u1", "name": "Grace"}]
                }))
                .unwrap(),
            )
            .unwrap();
        let req = request();
        let seq = SequenceStore::new();
        let c = Context {
            request: Some(&req),
            state: Some(&store),
            sequences: Some(&seq),
            ..Default::default()
        };
        assert_eq!(render_str("{{state.users.u1.name}}", &c), "Grace");
        assert_eq!(render_str("{{state.users.missing.name}}", &c), "");
    }
}
