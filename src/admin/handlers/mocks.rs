//! Mock CRUD and config import/export.

use crate::admin::router::AdminRequest;
use crate::admin::types::{from_engine_error, ok_json, problem, ErrorKind};
use crate::config::ConfigDocument;
use crate::engine::body::BoxBody;
use crate::engine::Engine;
use crate::mock::Mock;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

pub fn list(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let mut mocks = engine.state.registry.all();
    if let Some(protocol) = req.query.get("type") {
        mocks.retain(|m| m.mock_type.as_str() == protocol);
    }
    if let Some(workspace) = req.query.get("workspace") {
        mocks.retain(|m| &m.workspace == workspace);
    }
    let listed: Vec<&Mock> = mocks.iter().map(|m| m.as_ref()).collect();
    ok_json(StatusCode::OK, &json!({"mocks": listed, "total": listed.len()}))
}

pub fn get(id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    match engine.state.registry.get(id) {
        Some(mock) => ok_json(StatusCode::OK, mock.as_ref()),
        None => problem(ErrorKind::NotFound, format!("mock {id} not found")),
    }
}

pub async fn create(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let mock: Mock = match req.json() {
        Ok(m) => m,
        Err(response) => return response,
    };
    match engine.add_mock(mock).await {
        Ok((stored, merged)) => match merged {
            // Port merge: the new services/topics folded into a running
            // listener instead of a second socket. `total` counts the mocks
            // now bound to that port.
            Some(info) => ok_json(
                StatusCode::OK,
                &json!({
                    "mock": stored.as_ref(),
                    "merged": true,
                    "mergedInto": info.merged_into,
                    "total": info.total,
                }),
            ),
            None => ok_json(StatusCode::CREATED, stored.as_ref()),
        },
        Err(e) => from_engine_error(e),
    }
}

pub async fn update(id: &str, req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let mut mock: Mock = match req.json() {
        Ok(m) => m,
        Err(response) => return response,
    };
    if mock.id.is_empty() {
        mock.id = id.to_string();
    }
    if mock.id != id {
        return problem(
            ErrorKind::ValidationError,
            "mock id in body does not match the path",
        );
    }
    match engine.update_mock(mock).await {
        Ok(stored) => ok_json(StatusCode::OK, stored.as_ref()),
        Err(e) => from_engine_error(e),
    }
}

/// PATCH merges the provided JSON over the stored mock document.
pub async fn patch(id: &str, req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let Some(existing) = engine.state.registry.get(id) else {
        return problem(ErrorKind::NotFound, format!("mock {id} not found"));
    };
    let patch: serde_json::Value = match req.json() {
        Ok(v) => v,
        Err(response) => return response,
    };

    let mut document = match serde_json::to_value(existing.as_ref()) {
        Ok(v) => v,
        Err(e) => return problem(ErrorKind::InternalError, e.to_string()),
    };
    merge_json(&mut document, &patch);

    let merged: Mock = match serde_json::from_value(document) {
        Ok(m) => m,
        Err(e) => {
            return problem(
                ErrorKind::ValidationError,
                format!("patched mock is invalid: {e}"),
            )
        }
    };
    match engine.update_mock(merged).await {
        Ok(stored) => ok_json(StatusCode::OK, stored.as_ref()),
        Err(e) => from_engine_error(e),
    }
}

fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_json(
                        target.entry(key.clone()).or_insert(serde_json::Value::Null),
                        value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

pub async fn delete(id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    match engine.delete_mock(id).await {
        Ok(_) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(crate::engine::body::empty())
            .expect("static response"),
        Err(e) => from_engine_error(e),
    }
}

pub async fn delete_all(engine: &Arc<Engine>) -> Response<BoxBody> {
    let removed = engine.state.registry.clear();
    engine.prune_protocol_listeners().await;
    ok_json(StatusCode::OK, &json!({"deleted": removed.len()}))
}

pub fn toggle(id: &str, engine: &Arc<Engine>) -> Response<BoxBody> {
    match engine.state.registry.toggle(id) {
        Ok(enabled) => ok_json(StatusCode::OK, &json!({"id": id, "enabled": enabled})),
        Err(_) => problem(ErrorKind::NotFound, format!("mock {id} not found")),
    }
}

pub async fn bulk(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let mocks: Vec<Mock> = match req.json() {
        Ok(m) => m,
        Err(response) => return response,
    };
    match engine.import_mocks(mocks).await {
        Ok(outcome) => ok_json(StatusCode::OK, &outcome),
        Err(e) => from_engine_error(e),
    }
}

/// Import a whole config document (mocks, resources, operations, chaos).
pub async fn import_config(req: &AdminRequest, engine: &Arc<Engine>) -> Response<BoxBody> {
    let raw = String::from_utf8_lossy(&req.body);
    let doc = match ConfigDocument::parse(&raw) {
        Ok(d) => d,
        Err(e) => {
            return problem(
                ErrorKind::ValidationError,
                format!("invalid config document: {e}"),
            )
        }
    };

    for resource in &doc.stateful_resources {
        if engine.state.state.get(&resource.name).is_none() {
            if let Err(e) = engine.state.state.register(resource.clone()) {
                return problem(ErrorKind::ValidationError, e.to_string());
            }
        }
    }
    for op in &doc.custom_operations {
        engine.state.state.register_operation(op.clone());
    }
    if let Some(chaos) = &doc.chaos {
        if let Err(e) = engine.state.chaos.set_config(chaos.clone()) {
            return problem(ErrorKind::ValidationError, e);
        }
    }

    match engine.import_mocks(doc.mocks).await {
        Ok(outcome) => ok_json(StatusCode::OK, &outcome),
        Err(e) => from_engine_error(e),
    }
}

/// Export the effective configuration; loading it back yields the same mock
/// set.
pub fn export_config(engine: &Arc<Engine>) -> Response<BoxBody> {
    let doc = ConfigDocument {
        version: "1".to_string(),
        mocks: engine
            .state
            .registry
            .all()
            .iter()
            .map(|m| (**m).clone())
            .collect(),
        stateful_resources: engine
            .state
            .state
            .infos()
            .iter()
            .filter_map(|info| engine.state.state.get(&info.name))
            .map(|r| r.config().clone())
            .collect(),
        custom_operations: engine.state.state.operations(),
        auth: None,
        chaos: Some(engine.state.chaos.config()),
        server: engine.state.options.clone(),
    };
    ok_json(StatusCode::OK, &doc)
}
