//! Health, status, ports, metrics, request log, and token introspection.

use crate::admin::router::AdminRequest;
use crate::admin::types::{ok_json, problem, ErrorKind};
use crate::engine::body::{full, BoxBody};
use crate::engine::handler::parse_query;
use crate::engine::Engine;
use crate::mock::MockType;
use crate::requestlog::LogQuery;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

pub fn health() -> Response<BoxBody> {
    ok_json(StatusCode::OK, &json!({"status": "ok"}))
}

pub fn status(engine: &Arc<Engine>) -> Response<BoxBody> {
    let state = &engine.state;
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();
    ok_json(
        StatusCode::OK,
        &json!({
            "running": engine.is_running(),
            "startedAt": state.started_at.to_rfc3339(),
            "uptimeSeconds": uptime,
            "mocks": state.registry.len(),
            "loggedRequests": state.request_log.len(),
            "chaosEnabled": state.chaos.enabled(),
        }),
    )
}

pub fn ports(engine: &Arc<Engine>) -> Response<BoxBody> {
    ok_json(StatusCode::OK, &json!({"ports": engine.ports()}))
}

pub fn metrics() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(full(crate::metrics::gather()))
        .expect("static response")
}

/// Protocol engines compiled into this build.
pub fn engines(engine: &Arc<Engine>) -> Response<BoxBody> {
    let mut engines = vec![
        json!({"protocol": "http", "listening": true}),
        json!({"protocol": "websocket", "listening": true}),
        json!({"protocol": "sse", "listening": true}),
        json!({"protocol": "graphql", "listening": true}),
        json!({"protocol": "soap", "listening": true}),
        json!({"protocol": "oauth", "listening": true}),
    ];
    let ports = engine.ports();
    engines.push(json!({
        "protocol": "grpc",
        "listening": ports.iter().any(|p| p.protocol == "grpc"),
    }));
    engines.push(json!({
        "protocol": "mqtt",
        "listening": ports.iter().any(|p| p.protocol == "mqtt"),
    }));
    ok_json(StatusCode::OK, &json!({"engines": engines}))
}

/// Config formats the loader accepts.
pub fn formats() -> Response<BoxBody> {
    ok_json(
        StatusCode::OK,
        &json!({"formats": ["yaml", "json"], "version": "1"}),
    )
}

pub fn requests(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let mut query = LogQuery {
        unmatched_only: req
            .query
            .get("unmatchedOnly")
            .is_some_and(|v| v == "true" || v == "1"),
        limit: req
            .query
            .get("limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100),
        ..Default::default()
    };
    if let Some(protocol) = req.query.get("protocol") {
        query.protocol = match protocol.as_str() {
            "http" => Some(MockType::Http),
            "websocket" => Some(MockType::WebSocket),
            "graphql" => Some(MockType::GraphQL),
            "grpc" => Some(MockType::Grpc),
            "soap" => Some(MockType::Soap),
            "mqtt" => Some(MockType::Mqtt),
            "sse" => Some(MockType::Sse),
            "oauth" => Some(MockType::OAuth),
            other => {
                return problem(
                    ErrorKind::ValidationError,
                    format!("unknown protocol filter {other:?}"),
                )
            }
        };
    }
    if let Some(since) = req.query.get("since") {
        query.since = chrono::DateTime::parse_from_rfc3339(since)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc));
    }
    if let Some(until) = req.query.get("until") {
        query.until = chrono::DateTime::parse_from_rfc3339(until)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc));
    }

    let entries = engine.state.request_log.query(&query);
    ok_json(
        StatusCode::OK,
        &json!({"requests": entries, "total": entries.len()}),
    )
}

pub fn request_by_id(id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Ok(id) = id.parse::<u64>() else {
        return problem(ErrorKind::ValidationError, "request id must be numeric");
    };
    match engine.state.request_log.get(id) {
        Some(entry) => ok_json(StatusCode::OK, &entry),
        None => problem(ErrorKind::NotFound, format!("request {id} not found")),
    }
}

pub fn clear_requests(engine: &Arc<Engine>) -> Response<BoxBody> {
    engine.state.request_log.clear();
    ok_json(StatusCode::OK, &json!({"cleared": true}))
}

/// RFC 7662 token introspection against tokens issued by OAuth mocks.
pub fn introspect(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let form = parse_query(&String::from_utf8_lossy(&req.body));
    let Some(token) = form.get("token") else {
        return problem(ErrorKind::ValidationError, "token parameter is required");
    };
    ok_json(StatusCode::OK, &engine.state.oauth_tokens.introspect(token))
}
