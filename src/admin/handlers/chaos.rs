//! Chaos configuration endpoints.

use crate::admin::router::AdminRequest;
use crate::admin::types::{ok_json, problem, ErrorKind};
use crate::chaos::{profile, profile_names, ChaosConfig};
use crate::engine::body::BoxBody;
use crate::engine::Engine;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

pub fn get(engine: &Arc<Engine>) -> Response<BoxBody> {
    ok_json(StatusCode::OK, &engine.state.chaos.config())
}

pub fn put(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let config: ChaosConfig = match req.json() {
        Ok(c) => c,
        Err(response) => return response,
    };
    match engine.state.chaos.set_config(config) {
        Ok(()) => ok_json(StatusCode::OK, &engine.state.chaos.config()),
        Err(e) => problem(ErrorKind::ValidationError, e),
    }
}

pub fn reset(engine: &Arc<Engine>) -> Response<BoxBody> {
    engine.state.chaos.reset();
    ok_json(StatusCode::OK, &json!({"reset": true}))
}

pub fn profiles() -> Response<BoxBody> {
    ok_json(StatusCode::OK, &json!({"profiles": profile_names()}))
}

pub fn apply_profile(name: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(config) = profile(name) else {
        return problem(ErrorKind::NotFound, format!("no chaos profile named {name}"));
    };
    match engine.state.chaos.set_config(config) {
        Ok(()) => ok_json(
            StatusCode::OK,
            &json!({"applied": name, "config": engine.state.chaos.config()}),
        ),
        Err(e) => problem(ErrorKind::InternalError, e),
    }
}

pub fn stats(engine: &Arc<Engine>) -> Response<BoxBody> {
    ok_json(StatusCode::OK, &engine.state.chaos.stats())
}
