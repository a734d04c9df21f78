//! Route dispatch for the Admin API.

use super::handlers::{chaos, mocks, state as state_handlers, system};
use super::types::{problem, ErrorKind};
use super::RateLimiter;
use crate::engine::body::BoxBody;
use crate::engine::handler::parse_query;
use crate::engine::Engine;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A flattened admin request: everything handlers need, nothing borrowed
/// from the wire.
pub struct AdminRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: bytes::Bytes,
}

impl AdminRequest {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Response<BoxBody>> {
        serde_json::from_slice(&self.body)
            .map_err(|e| problem(ErrorKind::ValidationError, format!("invalid JSON body: {e}")))
    }
}

pub async fn route(
    req: Request<Incoming>,
    engine: Arc<Engine>,
    limiter: Arc<RateLimiter>,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    debug!("admin: {method} {path}");

    // CORS preflight short-circuits before auth.
    if method == Method::OPTIONS {
        return Ok(with_cors(cors_preflight(), &engine, origin.as_deref()));
    }

    if !limiter.allow() {
        let mut response = problem(ErrorKind::ValidationError, "admin rate limit exceeded");
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        return Ok(response);
    }

    // Bearer auth for everything but the health probe.
    let expected = engine.state.admin_key.read().clone();
    if !expected.is_empty() && path != "/health" {
        let presented = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if presented != expected {
            return Ok(with_cors(
                problem(ErrorKind::Unauthorized, "missing or invalid bearer token"),
                &engine,
                origin.as_deref(),
            ));
        }
    }

    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    let request = AdminRequest {
        method,
        path,
        query,
        body,
    };

    let response = dispatch(&request, &engine).await;
    Ok(with_cors(response, &engine, origin.as_deref()))
}

async fn dispatch(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let segments: Vec<&str> = req
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (&req.method, segments.as_slice()) {
        // System surface.
        (&Method::GET, ["health"]) => system::health(),
        (&Method::GET, ["status"]) => system::status(engine),
        (&Method::GET, ["ports"]) => system::ports(engine),
        (&Method::GET, ["metrics"]) => system::metrics(),
        (&Method::GET, ["engines"]) => system::engines(engine),
        (&Method::GET, ["formats"]) => system::formats(),
        (&Method::POST, ["introspect"]) => system::introspect(req, engine),

        // Mock CRUD.
        (&Method::GET, ["mocks"]) => mocks::list(req, engine),
        (&Method::POST, ["mocks"]) => mocks::create(req, engine).await,
        (&Method::DELETE, ["mocks"]) => mocks::delete_all(engine).await,
        (&Method::POST, ["mocks", "bulk"]) => mocks::bulk(req, engine).await,
        (&Method::GET, ["mocks", id]) => mocks::get(id, engine),
        (&Method::PUT, ["mocks", id]) => mocks::update(id, req, engine).await,
        (&Method::PATCH, ["mocks", id]) => mocks::patch(id, req, engine).await,
        (&Method::DELETE, ["mocks", id]) => mocks::delete(id, engine).await,
        (&Method::POST, ["mocks", id, "toggle"]) => mocks::toggle(id, engine),

        // Config import/export.
        (&Method::GET, ["config"]) => mocks::export_config(engine),
        (&Method::POST, ["config"]) => mocks::import_config(req, engine).await,

        // Request log.
        (&Method::GET, ["requests"]) => system::requests(req, engine),
        (&Method::DELETE, ["requests"]) => system::clear_requests(engine),
        (&Method::GET, ["requests", id]) => system::request_by_id(id, engine),

        // Chaos.
        (&Method::GET, ["chaos"]) => chaos::get(engine),
        (&Method::PUT, ["chaos"]) => chaos::put(req, engine),
        (&Method::POST, ["chaos", "reset"]) => chaos::reset(engine),
        (&Method::GET, ["chaos", "profiles"]) => chaos::profiles(),
        (&Method::POST, ["chaos", "profiles", name, "apply"]) => chaos::apply_profile(name, engine),
        (&Method::GET, ["chaos", "stats"]) => chaos::stats(engine),

        // Stateful store.
        (&Method::GET, ["state", "resources"]) => state_handlers::list_resources(engine),
        (&Method::POST, ["state", "resources"]) => state_handlers::create_resource(req, engine),
        (&Method::GET, ["state", "resources", name]) => {
            state_handlers::list_items(name, req, engine)
        }
        (&Method::POST, ["state", "resources", name]) => {
            state_handlers::create_item(name, req, engine)
        }
        (&Method::DELETE, ["state", "resources", name]) => {
            state_handlers::clear_resource(name, engine)
        }
        (&Method::GET, ["state", "resources", name, id]) => {
            state_handlers::get_item(name, id, engine)
        }
        (&Method::DELETE, ["state", "resources", name, id]) => {
            state_handlers::delete_item(name, id, engine)
        }
        (&Method::POST, ["state", "reset"]) => state_handlers::reset(req, engine),

        // Verification.
        (&Method::GET, ["verify", id]) => state_handlers::verify(id, req, engine),
        (&Method::GET, ["invocations", id]) => state_handlers::invocations(id, engine),
        (&Method::POST, ["verify", "reset"]) => state_handlers::verify_reset(req, engine),

        _ => problem(
            ErrorKind::NotFound,
            format!("no admin route for {} {}", req.method, req.path),
        ),
    }
}

fn cors_preflight() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-methods", "GET, POST, PUT, PATCH, DELETE, OPTIONS")
        .header("access-control-allow-headers", "authorization, content-type")
        .body(crate::engine::body::empty())
        .expect("static response")
}

fn with_cors(
    mut response: Response<BoxBody>,
    engine: &Arc<Engine>,
    origin: Option<&str>,
) -> Response<BoxBody> {
    let origins = &engine.state.options.cors_origins;
    if origins.is_empty() {
        return response;
    }
    let allowed = if origins.iter().any(|o| o == "*") {
        Some("*".to_string())
    } else {
        origin
            .filter(|o| origins.iter().any(|allowed| allowed == o))
            .map(str::to_string)
    };
    if let Some(value) = allowed.and_then(|v| HeaderValue::from_str(&v).ok()) {
        response
            .headers_mut()
            .insert("access-control-allow-origin", value);
    }
    response
}
