//! GraphQL mock execution: extracts the operation from the incoming query
//! text, resolves the top-level field against the configured resolvers, and
//! shapes a spec-compliant `{data, errors}` response.

use crate::matching::RequestSnapshot;
use crate::mock::{GraphQLSpec, ResolverConfig};
use crate::template::{render_json, Context};
use serde_json::{json, Value};

/// Parsed shape of an incoming GraphQL request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOperation {
    /// "query" | "mutation" | "subscription"
    pub kind: String,
    pub name: String,
    pub top_field: String,
}

/// Extract operation kind, name, and first top-level field from query text.
/// A hand scanner is enough here: mocks only need the operation identity,
/// not a full document parse.
pub fn parse_operation(query: &str) -> Option<ParsedOperation> {
    let stripped = strip_comments(query);
    let trimmed = stripped.trim_start();

    let (kind, rest) = if let Some(rest) = trimmed.strip_prefix("mutation") {
        ("mutation", rest)
    } else if let Some(rest) = trimmed.strip_prefix("subscription") {
        ("subscription", rest)
    } else if let Some(rest) = trimmed.strip_prefix("query") {
        ("query", rest)
    } else if trimmed.starts_with('{') {
        ("query", trimmed)
    } else {
        return None;
    };

    // Optional operation name, then optional variable definitions, then the
    // selection set.
    let rest = rest.trim_start();
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    let brace = rest.find('{')?;
    let selection = &rest[brace + 1..];
    let top_field: String = selection
        .trim_start()
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if top_field.is_empty() {
        return None;
    }

    Some(ParsedOperation {
        kind: kind.to_string(),
        name,
        top_field,
    })
}

fn strip_comments(query: &str) -> String {
    query
        .lines()
        .map(|line| match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Find the resolver for an operation. Keys are tried most-specific first:
/// "Kind.field", operation name, then the bare field name.
fn find_resolver<'a>(
    spec: &'a GraphQLSpec,
    op: &ParsedOperation,
) -> Option<&'a ResolverConfig> {
    let kind_key = format!(
        "{}.{}",
        capitalize(&op.kind),
        op.top_field
    );
    spec.resolvers
        .get(&kind_key)
        .or_else(|| {
            if op.name.is_empty() {
                None
            } else {
                spec.resolvers.get(&op.name)
            }
        })
        .or_else(|| spec.resolvers.get(&op.top_field))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Execute a GraphQL request against the spec.
/// Returns the response body and the resolver's configured delay.
pub fn execute(spec: &GraphQLSpec, snapshot: &RequestSnapshot, ctx: &Context<'_>) -> (Value, u64) {
    let request: Value = match serde_json::from_str(&snapshot.body) {
        Ok(v) => v,
        Err(_) => {
            return (
                json!({"errors": [{"message": "request body is not valid JSON"}]}),
                0,
            )
        }
    };
    let query = request["query"].as_str().unwrap_or("");
    let variables = request
        .get("variables")
        .cloned()
        .unwrap_or(Value::Null);

    let Some(op) = parse_operation(query) else {
        return (
            json!({"errors": [{"message": "unable to parse operation"}]}),
            0,
        );
    };

    // Subscriptions over plain HTTP get the configured event payload list;
    // the streaming lifecycle beyond that is intentionally minimal.
    if op.kind == "subscription" {
        let key = if spec.subscriptions.contains_key(&op.top_field) {
            Some(&op.top_field)
        } else if spec.subscriptions.contains_key(&op.name) {
            Some(&op.name)
        } else {
            None
        };
        return match key.and_then(|k| spec.subscriptions.get(k)) {
            Some(sub) => {
                let events: Vec<Value> = sub
                    .events
                    .iter()
                    .map(|e| render_json(&e.data, ctx))
                    .collect();
                (wrap_data(&op.top_field, Value::Array(events)), 0)
            }
            None => (
                json!({"errors": [{"message": format!("no subscription configured for {}", op.top_field)}]}),
                0,
            ),
        };
    }

    let Some(resolver) = find_resolver(spec, &op) else {
        return (
            json!({
                "data": null,
                "errors": [{"message": format!("no resolver configured for {} {}", op.kind, op.top_field)}]
            }),
            0,
        );
    };

    // Optional variable predicates.
    if let Some(criteria) = &resolver.criteria {
        for (arg, expected) in &criteria.args {
            let actual = variables.get(arg).unwrap_or(&Value::Null);
            if !crate::matching::jsonpath::loose_eq(actual, expected) {
                return (
                    json!({
                        "data": null,
                        "errors": [{"message": format!("arguments for {} did not match", op.top_field)}]
                    }),
                    0,
                );
            }
        }
    }

    if let Some(error) = &resolver.error {
        let mut err = json!({"message": error.message});
        if !error.path.is_empty() {
            err["path"] = json!(error.path);
        }
        if let Some(ext) = &error.extensions {
            err["extensions"] = ext.clone();
        }
        return (json!({"data": null, "errors": [err]}), resolver.delay_ms);
    }

    let data = resolver
        .response
        .as_ref()
        .map(|r| render_json(r, ctx))
        .unwrap_or(Value::Null);

    (wrap_data(&op.top_field, data), resolver.delay_ms)
}

fn wrap_data(field: &str, value: Value) -> Value {
    let mut data = serde_json::Map::new();
    data.insert(field.to_string(), value);
    json!({ "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(value: serde_json::Value) -> GraphQLSpec {
        serde_json::from_value(value).unwrap()
    }

    fn snapshot(query: &str, variables: Value) -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".into(),
            path: "/graphql".into(),
            body: json!({"query": query, "variables": variables}).to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_named_query() {
        let op = parse_operation("query GetUsers { users { id } }").unwrap();
        assert_eq!(op.kind, "query");
        assert_eq!(op.name, "GetUsers");
        assert_eq!(op.top_field, "users");
    }

    #[test]
    fn parses_anonymous_and_mutation_forms() {
        let op = parse_operation("{ me { id } }").unwrap();
        assert_eq!(op.kind, "query");
        assert_eq!(op.top_field, "me");

        let op = parse_operation("mutation CreateUser($n: String) { createUser(name: $n) { id } }")
            .unwrap();
        assert_eq!(op.kind, "mutation");
        assert_eq!(op.name, "CreateUser");
        assert_eq!(op.top_field, "createUser");
    }

    #[test]
    fn resolves_by_field_name() {
        let spec = spec(json!({
            "path": "/graphql",
            "resolvers": {"users": {"response": [{"id": "1"}]}}
        }));
        let (body, _) = execute(
            &spec,
            &snapshot("query { users { id } }", Value::Null),
            &Context::default(),
        );
        assert_eq!(body["data"]["users"][0]["id"], "1");
    }

    #[test]
    fn kind_prefixed_key_wins() {
        let spec = spec(json!({
            "path": "/graphql",
            "resolvers": {
                "users": {"response": "generic"},
                "Query.users": {"response": "specific"}
            }
        }));
        let (body, _) = execute(
            &spec,
            &snapshot("query { users }", Value::Null),
            &Context::default(),
        );
        assert_eq!(body["data"]["users"], "specific");
    }

    #[test]
    fn argument_predicate_gates_resolution() {
        let spec = spec(json!({
            "path": "/graphql",
            "resolvers": {
                "user": {"response": {"id": "42"}, "match": {"args": {"id": "42"}}}
            }
        }));
        let (hit, _) = execute(
            &spec,
            &snapshot("query ($id: ID) { user(id: $id) }", json!({"id": "42"})),
            &Context::default(),
        );
        assert_eq!(hit["data"]["user"]["id"], "42");

        let (miss, _) = execute(
            &spec,
            &snapshot("query ($id: ID) { user(id: $id) }", json!({"id": "7"})),
            &Context::default(),
        );
        assert!(miss["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("did not match"));
    }

    #[test]
    fn configured_error_is_returned() {
        let spec = spec(json!({
            "path": "/graphql",
            "resolvers": {
                "users": {"error": {"message": "boom", "path": ["users"]}}
            }
        }));
        let (body, _) = execute(
            &spec,
            &snapshot("query { users }", Value::Null),
            &Context::default(),
        );
        assert_eq!(body["errors"][0]["message"], "boom");
        assert_eq!(body["data"], Value::Null);
    }

    #[test]
    fn missing_resolver_reports_error() {
        let spec = spec(json!({"path": "/graphql", "resolvers": {"other": {"response": 1}}}));
        let (body, _) = execute(
            &spec,
            &snapshot("query { users }", Value::Null),
            &Context::default(),
        );
        assert!(body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("no resolver"));
    }

    #[test]
    fn subscription_returns_event_list() {
        let spec = spec(json!({
            "path": "/graphql",
            "subscriptions": {
                "ticks": {"events": [{"data": {"n": 1}}, {"data": {"n": 2}}]}
            }
        }));
        let (body, _) = execute(
            &spec,
            &snapshot("subscription { ticks }", Value::Null),
            &Context::default(),
        );
        assert_eq!(body["data"]["ticks"][1]["n"], 2);
    }
}
