//! Stateful store and verification endpoints.

use crate::admin::router::AdminRequest;
use crate::admin::types::{ok_json, problem, ErrorKind};
use crate::engine::body::BoxBody;
use crate::engine::Engine;
use crate::stateful::{QueryFilter, ResourceConfig, StatefulError};
use crate::verify::VerifyMode;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

pub fn list_resources(engine: &Arc<Engine>) -> Response<BoxBody> {
    ok_json(StatusCode::OK, &json!({"resources": engine.state.state.infos()}))
}

pub fn create_resource(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let config: ResourceConfig = match req.json() {
        Ok(c) => c,
        Err(response) => return response,
    };
    if config.name.is_empty() {
        return problem(ErrorKind::ValidationError, "resource name is required");
    }
    if engine.state.state.get(&config.name).is_some() {
        return problem(
            ErrorKind::Conflict,
            format!("resource {} already exists", config.name),
        );
    }
    match engine.state.state.register(config) {
        Ok(resource) => ok_json(StatusCode::CREATED, &resource.info()),
        Err(e) => problem(ErrorKind::ValidationError, e.to_string()),
    }
}

pub fn list_items(name: &str, req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(resource) = engine.state.state.get(name) else {
        return problem(ErrorKind::NotFound, format!("resource {name} not found"));
    };
    let mut filter = QueryFilter::default();
    for (key, value) in &req.query {
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
    ok_json(StatusCode::OK, &resource.list(&filter))
}

pub fn create_item(name: &str, req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(resource) = engine.state.state.get(name) else {
        return problem(ErrorKind::NotFound, format!("resource {name} not found"));
    };
    let data: serde_json::Map<String, serde_json::Value> = match req.json() {
        Ok(d) => d,
        Err(response) => return response,
    };
    match resource.create(data, &std::collections::HashMap::new()) {
        Ok(item) => ok_json(StatusCode::CREATED, &item.to_json(resource.id_field())),
        Err(e @ StatefulError::Capacity { .. }) => {
            problem(ErrorKind::CapacityExceeded, e.to_string())
        }
        Err(e @ StatefulError::Conflict { .. }) => problem(ErrorKind::Conflict, e.to_string()),
        Err(e) => problem(ErrorKind::InternalError, e.to_string()),
    }
}

pub fn get_item(name: &str, id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(resource) = engine.state.state.get(name) else {
        return problem(ErrorKind::NotFound, format!("resource {name} not found"));
    };
    match resource.get(id) {
        Some(item) => ok_json(StatusCode::OK, &item.to_json(resource.id_field())),
        None => problem(
            ErrorKind::NotFound,
            format!("item {id} not found in {name}"),
        ),
    }
}

pub fn delete_item(name: &str, id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(resource) = engine.state.state.get(name) else {
        return problem(ErrorKind::NotFound, format!("resource {name} not found"));
    };
    resource.delete(id);
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(crate::engine::body::empty())
        .expect("static response")
}

/// DELETE on a resource clears every item without restoring seed.
pub fn clear_resource(name: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(resource) = engine.state.state.get(name) else {
        return problem(ErrorKind::NotFound, format!("resource {name} not found"));
    };
    let cleared = resource.clear();
    ok_json(StatusCode::OK, &json!({"cleared": cleared}))
}

/// Restore seed data for one resource (`{"resource": name}`) or all.
pub fn reset(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let target: Option<String> = serde_json::from_slice::<serde_json::Value>(&req.body)
        .ok()
        .and_then(|v| v["resource"].as_str().map(str::to_string));
    match engine.state.state.reset(target.as_deref()) {
        Ok(()) => ok_json(StatusCode::OK, &json!({"reset": target.unwrap_or_else(|| "all".into())})),
        Err(e) => problem(ErrorKind::NotFound, e.to_string()),
    }
}

/// `GET /verify/{id}?mode=atLeast&count=2`; bare GET returns the counter.
pub fn verify(id: &str, req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    if engine.state.registry.get(id).is_none() {
        return problem(ErrorKind::NotFound, format!("mock {id} not found"));
    }
    let mode = match req.query.get("mode").map(String::as_str) {
        None => None,
        Some("exactly") => Some(VerifyMode::Exactly),
        Some("atLeast") => Some(VerifyMode::AtLeast),
        Some("atMost") => Some(VerifyMode::AtMost),
        Some("never") => Some(VerifyMode::Never),
        Some(other) => {
            return problem(
                ErrorKind::ValidationError,
                format!("unknown verify mode {other:?}"),
            )
        }
    };

    match mode {
        Some(mode) => {
            let expected = req
                .query
                .get("count")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0);
            ok_json(
                StatusCode::OK,
                &engine.state.verification.verify(id, mode, expected),
            )
        }
        None => ok_json(
            StatusCode::OK,
            &json!({
                "mockId": id,
                "callCount": engine.state.verification.call_count(id),
            }),
        ),
    }
}

pub fn invocations(id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    ok_json(
        StatusCode::OK,
        &json!({
            "mockId": id,
            "invocations": engine.state.verification.invocations(id),
        }),
    )
}

pub fn verify_reset(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let target: Option<String> = serde_json::from_slice::<serde_json::Value>(&req.body)
        .ok()
        .and_then(|v| v["mockId"].as_str().map(str::to_string));
    engine.state.verification.reset(target.as_deref());
    ok_json(StatusCode::OK, &json!({"reset": true}))
}
