//! The primary request handler: converts wire requests into protocol-neutral
//! snapshots, dispatches against the mock set, and drives the response
//! pipeline (chaos, delay, templates, stateful side-effects, delivery).

use super::body::{channel_body, empty, full, BoxBody};
use super::AppState;
use crate::chaos::ChaosOutcome;
use crate::matching::{
    collect_near_misses, dispatch_http, MtlsIdentity, NearMiss, RequestSnapshot,
};
use crate::metrics;
use crate::mock::{HttpResponse, Mock, MockSpec, MockType};
use crate::requestlog::ResponseSummary;
use crate::stateful::{QueryFilter, StatefulError};
use crate::template::{self, Context};
use crate::{graphql, oauth, soap, sse, websocket};
use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Returned to hyper to abort the connection without writing a response
/// (chaos-injected timeouts).
#[derive(Debug)]
pub struct ConnectionDrop;

impl std::fmt::Display for ConnectionDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection dropped by chaos timeout")
    }
}

impl std::error::Error for ConnectionDrop {}

struct InFlightGuard(Arc<AppState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Entry point for every request on the primary (and HTTPS) listener.
pub async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
    mtls: Option<MtlsIdentity>,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    state.in_flight.fetch_add(1, Ordering::SeqCst);
    let _guard = InFlightGuard(Arc::clone(&state));

    // A panicking handler must not take the listener down: recover and map
    // to a 500.
    match std::panic::AssertUnwindSafe(handle_inner(req, state, addr, mtls))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!("handler panicked; returning 500");
            Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ))
        }
    }
}

async fn handle_inner(
    req: Request<Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
    mtls: Option<MtlsIdentity>,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    // WebSocket upgrades keep the request whole; everything else flattens
    // into a snapshot.
    if websocket::is_upgrade(req.headers()) {
        let path = req.uri().path().to_string();
        return Ok(websocket::handle_upgrade(req, &path, state).await);
    }

    let (parts, body) = req.into_parts();
    let body_bytes = read_body(body).await;
    let snapshot = build_snapshot(&parts, &body_bytes, addr, mtls);

    // OAuth issuers are mounted by path prefix.
    for mock in state.registry.snapshot(MockType::OAuth) {
        let MockSpec::OAuth(spec) = &mock.spec else {
            continue;
        };
        if mock.enabled && snapshot.path.starts_with(&spec.issuer) {
            state.verification.record(&mock.id, &snapshot);
            let response = oauth::handle(spec, &mock.id, &snapshot, &state);
            finish(&state, MockType::OAuth, &snapshot, Some(&mock.id), &response);
            return Ok(response);
        }
    }

    // GraphQL endpoints match on exact path.
    for mock in state.registry.snapshot(MockType::GraphQL) {
        let MockSpec::GraphQL(spec) = &mock.spec else {
            continue;
        };
        if mock.enabled && snapshot.path == spec.path {
            let response = graphql_respond(&state, &mock, spec, &snapshot).await?;
            finish(&state, MockType::GraphQL, &snapshot, Some(&mock.id), &response);
            return Ok(response);
        }
    }

    // SOAP endpoints likewise.
    for mock in state.registry.snapshot(MockType::Soap) {
        let MockSpec::Soap(spec) = &mock.spec else {
            continue;
        };
        if mock.enabled && snapshot.path == spec.path {
            let response = soap_respond(&state, &mock, spec, &snapshot).await?;
            finish(&state, MockType::Soap, &snapshot, Some(&mock.id), &response);
            return Ok(response);
        }
    }

    // HTTP and SSE mocks share the scored dispatch.
    let candidates = state.registry.snapshot_http_family();
    if let Some(result) = dispatch_http(&candidates, &snapshot) {
        state.verification.record(&result.mock.id, &snapshot);
        let protocol = result.mock.mock_type;
        let response = match &result.mock.spec {
            MockSpec::Sse(spec) => {
                sse_respond(&state, &result.mock, spec, &snapshot, &result.outcome).await?
            }
            MockSpec::Http(spec) => {
                http_respond(&state, &result.mock, spec, &snapshot, &result.outcome).await?
            }
            _ => plain_response(StatusCode::INTERNAL_SERVER_ERROR, "unreachable spec"),
        };
        finish(&state, protocol, &snapshot, Some(&result.mock.id), &response);
        return Ok(response);
    }

    // Stateful resource base paths.
    if let Some((resource, item_id, path_params)) = state.state.match_path(&snapshot.path) {
        let response = stateful_respond(&state, &resource, item_id, path_params, &snapshot).await?;
        finish(&state, MockType::Http, &snapshot, None, &response);
        return Ok(response);
    }

    // Nothing matched: near-miss diagnostics on the 404.
    let near_misses = collect_near_misses(&candidates, &snapshot, 3);
    let response = not_found_response(&near_misses);
    metrics::record_request("http", false);
    state.request_log.push(
        MockType::Http,
        &snapshot,
        None,
        ResponseSummary {
            status_code: 404,
            ..Default::default()
        },
        near_misses,
    );
    Ok(response)
}

// ============================================================================
// Response pipelines
// ============================================================================

/// Chaos pre-check and delay shared by every matched pipeline.
/// Returns an error response to short-circuit with, or the delay applied.
async fn apply_chaos(
    state: &AppState,
    snapshot: &RequestSnapshot,
    mock_delay_ms: u64,
) -> Result<Option<Response<BoxBody>>, ConnectionDrop> {
    let decision = state.chaos.decide(&snapshot.method, &snapshot.path);

    match decision.outcome {
        ChaosOutcome::Timeout { hold_ms } => {
            metrics::record_chaos("timeout");
            let hold = if hold_ms > 0 {
                Duration::from_millis(hold_ms)
            } else {
                Duration::from_secs(state.options.write_timeout_secs.max(1))
            };
            tokio::time::sleep(hold).await;
            return Err(ConnectionDrop);
        }
        ChaosOutcome::Error {
            status,
            retry_after_secs,
        } => {
            metrics::record_chaos("error");
            let delay = decision.latency_ms.max(mock_delay_ms);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let mut response = plain_response(
                StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                "chaos injected",
            );
            if let Some(secs) = retry_after_secs {
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
            }
            response
                .headers_mut()
                .insert("x-mockd-chaos", HeaderValue::from_static("injected"));
            return Ok(Some(response));
        }
        ChaosOutcome::None => {}
    }

    if decision.latency_ms > 0 {
        metrics::record_chaos("latency");
    }
    let delay = decision.latency_ms.max(mock_delay_ms);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Ok(None)
}

fn template_ctx<'a>(
    state: &'a AppState,
    mock_id: &'a str,
    snapshot: &'a RequestSnapshot,
    outcome: &'a crate::matching::HttpMatchOutcome,
) -> Context<'a> {
    Context {
        request: Some(snapshot),
        mock_id,
        path_params: Some(&outcome.path_params),
        pattern_captures: Some(&outcome.pattern_captures),
        jsonpath_values: Some(&outcome.jsonpath_values),
        state: Some(&state.state),
        sequences: Some(&state.sequences),
    }
}

async fn http_respond(
    state: &AppState,
    mock: &Mock,
    spec: &crate::mock::HttpSpec,
    snapshot: &RequestSnapshot,
    outcome: &crate::matching::HttpMatchOutcome,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    let mock_delay = spec.response.as_ref().map(|r| r.delay_ms).unwrap_or(0);
    if let Some(short_circuit) = apply_chaos(state, snapshot, mock_delay).await? {
        return Ok(short_circuit);
    }

    // Custom operation wiring: the request body is the operation input.
    if !spec.stateful_operation.is_empty() {
        let input: serde_json::Value =
            serde_json::from_str(&snapshot.body).unwrap_or(serde_json::Value::Null);
        return Ok(
            match state.state.execute_operation(&spec.stateful_operation, input) {
                Ok(result) => json_response(StatusCode::OK, &result),
                Err(e) => stateful_error_response(&e),
            },
        );
    }

    let response_spec = spec.response.clone().unwrap_or_default();
    let ctx = template_ctx(state, &mock.id, snapshot, outcome);
    Ok(render_http_response(&response_spec, &ctx))
}

/// Render an HTTP response template with the given context.
pub fn render_http_response(spec: &HttpResponse, ctx: &Context<'_>) -> Response<BoxBody> {
    let body = template::render_str(&spec.body, ctx);
    let status = StatusCode::from_u16(spec.status_code).unwrap_or(StatusCode::OK);

    let mut builder = Response::builder().status(status);
    let mut has_content_type = false;
    for (name, value) in template::render_headers(&spec.headers, ctx) {
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(&value),
        ) {
            builder = builder.header(n, v);
        }
    }
    if !has_content_type && !body.is_empty() {
        let content_type = if serde_json::from_str::<serde_json::Value>(&body).is_ok() {
            "application/json"
        } else {
            "text/plain; charset=utf-8"
        };
        builder = builder.header(CONTENT_TYPE, content_type);
    }

    builder
        .body(full(body))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
}

async fn sse_respond(
    state: &AppState,
    mock: &Mock,
    spec: &crate::mock::SseSpec,
    snapshot: &RequestSnapshot,
    outcome: &crate::matching::HttpMatchOutcome,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    if let Some(short_circuit) = apply_chaos(state, snapshot, 0).await? {
        return Ok(short_circuit);
    }

    // Events render against the request context up front; emission runs on
    // its own task and stops when the client goes away.
    let ctx = template_ctx(state, &mock.id, snapshot, outcome);
    let plan = sse::build_plan(spec, snapshot, &ctx);

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(sse::emit(plan, tx));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(channel_body(rx))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response")))
}

async fn graphql_respond(
    state: &AppState,
    mock: &Mock,
    spec: &crate::mock::GraphQLSpec,
    snapshot: &RequestSnapshot,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    if let Some(short_circuit) = apply_chaos(state, snapshot, 0).await? {
        return Ok(short_circuit);
    }
    state.verification.record(&mock.id, snapshot);

    let outcome = crate::matching::HttpMatchOutcome::default();
    let ctx = template_ctx(state, &mock.id, snapshot, &outcome);
    let (body, delay_ms) = graphql::execute(spec, snapshot, &ctx);
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Ok(json_response(StatusCode::OK, &body))
}

async fn soap_respond(
    state: &AppState,
    mock: &Mock,
    spec: &crate::mock::SoapSpec,
    snapshot: &RequestSnapshot,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    if let Some(short_circuit) = apply_chaos(state, snapshot, 0).await? {
        return Ok(short_circuit);
    }
    state.verification.record(&mock.id, snapshot);

    let outcome = crate::matching::HttpMatchOutcome::default();
    let ctx = template_ctx(state, &mock.id, snapshot, &outcome);
    Ok(soap::respond(spec, snapshot, &ctx, &state.state).await)
}

async fn stateful_respond(
    state: &AppState,
    resource: &crate::stateful::Resource,
    item_id: Option<String>,
    path_params: HashMap<String, String>,
    snapshot: &RequestSnapshot,
) -> Result<Response<BoxBody>, ConnectionDrop> {
    if let Some(short_circuit) = apply_chaos(state, snapshot, 0).await? {
        return Ok(short_circuit);
    }

    let response = match (snapshot.method.as_str(), item_id) {
        ("GET", None) => {
            let filter = filter_from_query(&snapshot.query, resource.parent_field(), &path_params);
            json_response(StatusCode::OK, &resource.list(&filter))
        }
        ("GET", Some(id)) => match resource.get(&id) {
            Some(item) => json_response(StatusCode::OK, &item.to_json(resource.id_field())),
            None => stateful_error_response(&StatefulError::NotFound {
                resource: resource.name().to_string(),
                id,
            }),
        },
        ("POST", None) => {
            let Some(data) = parse_object(&snapshot.body) else {
                return Ok(plain_response(StatusCode::BAD_REQUEST, "body must be a JSON object"));
            };
            match resource.create(data, &path_params) {
                Ok(item) => json_response(StatusCode::CREATED, &item.to_json(resource.id_field())),
                Err(e) => stateful_error_response(&e),
            }
        }
        // Both verbs map to the merging Update operation: fields not present
        // in the request body are preserved.
        ("PUT" | "PATCH", Some(id)) => {
            let Some(data) = parse_object(&snapshot.body) else {
                return Ok(plain_response(StatusCode::BAD_REQUEST, "body must be a JSON object"));
            };
            match resource.update(&id, data) {
                Ok(item) => json_response(StatusCode::OK, &item.to_json(resource.id_field())),
                Err(e) => stateful_error_response(&e),
            }
        }
        ("DELETE", Some(id)) => {
            resource.delete(&id);
            Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(empty())
                .unwrap()
        }
        _ => plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    };
    Ok(response)
}

/// Query params -> list filter: limit/offset/sort/order are reserved,
/// everything else filters on a field.
fn filter_from_query(
    query: &HashMap<String, String>,
    parent_field: &str,
    path_params: &HashMap<String, String>,
) -> QueryFilter {
    let mut filter = QueryFilter::default();
    for (key, value) in query {
        match key.as_str() {
            "limit" => filter.limit = value.parse().unwrap_or(filter.limit),
            "offset" => filter.offset = value.parse().unwrap_or(0),
            "sort" => filter.sort = value.clone(),
            "order" => filter.descending = value.eq_ignore_ascii_case("desc"),
            _ => {
                filter.filters.insert(key.clone(), value.clone());
            }
        }
    }
    if !parent_field.is_empty() {
        filter.parent_id = path_params.get(parent_field).cloned();
    }
    filter
}

// ============================================================================
// Pieces
// ============================================================================

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

async fn read_body(body: Incoming) -> Bytes {
    match http_body_util::Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("request body discarded: {e}");
            Bytes::new()
        }
    }
}

fn build_snapshot(
    parts: &hyper::http::request::Parts,
    body: &Bytes,
    addr: SocketAddr,
    mtls: Option<MtlsIdentity>,
) -> RequestSnapshot {
    let raw_query = parts.uri.query().unwrap_or("").to_string();
    let query = parse_query(&raw_query);
    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    RequestSnapshot {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        raw_query,
        query,
        headers,
        body: String::from_utf8_lossy(body).to_string(),
        client_addr: addr.to_string(),
        mtls,
    }
}

pub(crate) fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                let value = urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_default();
                out.insert(k.to_string(), value);
            }
            None => {
                out.insert(pair.to_string(), String::new());
            }
        }
    }
    out
}

fn parse_object(body: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .as_object()
        .cloned()
}

pub fn plain_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(message.to_string()))
        .expect("static response")
}

pub fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .expect("static response")
}

fn stateful_error_response(error: &StatefulError) -> Response<BoxBody> {
    let status = match error {
        StatefulError::NotFound { .. } | StatefulError::ResourceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StatefulError::Conflict { .. } => StatusCode::CONFLICT,
        StatefulError::Capacity { .. } => StatusCode::INSUFFICIENT_STORAGE,
        StatefulError::OperationNotFound { .. } => StatusCode::NOT_FOUND,
        StatefulError::StepFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    json_response(
        status,
        &serde_json::json!({"error": error.to_string()}),
    )
}

fn not_found_response(near_misses: &[NearMiss]) -> Response<BoxBody> {
    let body = serde_json::json!({
        "error": "no mock matched the request",
        "nearMisses": near_misses,
    });
    let mut response = json_response(StatusCode::NOT_FOUND, &body);
    if let Ok(value) = HeaderValue::from_str(&near_misses.len().to_string()) {
        response.headers_mut().insert("x-mockd-near-misses", value);
    }
    response
}

/// Record metrics, verification already recorded by dispatch; push the log
/// entry for a completed (non-streaming-tail) response.
fn finish(
    state: &AppState,
    protocol: MockType,
    snapshot: &RequestSnapshot,
    mock_id: Option<&str>,
    response: &Response<BoxBody>,
) {
    metrics::record_request(protocol.as_str(), mock_id.is_some());
    state.request_log.push(
        protocol,
        snapshot,
        mock_id,
        ResponseSummary {
            status_code: response.status().as_u16(),
            chaos_injected: response.headers().contains_key("x-mockd-chaos"),
            ..Default::default()
        },
        Vec::new(),
    );
}
