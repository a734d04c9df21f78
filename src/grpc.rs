//! Per-mock gRPC listeners.
//!
//! Served over hyper's HTTP/2 stack with the standard gRPC framing (1-byte
//! compression flag + 4-byte big-endian length per message). Mock services
//! carry no proto descriptors, so messages are opaque JSON payloads and
//! error richness is status-code-only; see DESIGN.md.

use crate::engine::body::{channel_body, BoxBody};
use crate::engine::AppState;
use crate::matching::RequestSnapshot;
use crate::metrics;
use crate::mock::{GrpcMethodConfig, MockSpec, MockType};
use crate::requestlog::ResponseSummary;
use crate::template::{render_json, Context};
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::{Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};

// Canonical gRPC status codes used by mocks.
const GRPC_OK: u32 = 0;
const GRPC_NOT_FOUND: u32 = 5;
const GRPC_RESOURCE_EXHAUSTED: u32 = 8;
const GRPC_UNIMPLEMENTED: u32 = 12;
const GRPC_INTERNAL: u32 = 13;
const GRPC_UNAVAILABLE: u32 = 14;

fn status_code_by_name(name: &str) -> u32 {
    match name.to_uppercase().as_str() {
        "OK" => GRPC_OK,
        "CANCELLED" => 1,
        "UNKNOWN" => 2,
        "INVALID_ARGUMENT" => 3,
        "DEADLINE_EXCEEDED" => 4,
        "NOT_FOUND" => GRPC_NOT_FOUND,
        "ALREADY_EXISTS" => 6,
        "PERMISSION_DENIED" => 7,
        "RESOURCE_EXHAUSTED" => GRPC_RESOURCE_EXHAUSTED,
        "FAILED_PRECONDITION" => 9,
        "ABORTED" => 10,
        "OUT_OF_RANGE" => 11,
        "UNIMPLEMENTED" => GRPC_UNIMPLEMENTED,
        "INTERNAL" => GRPC_INTERNAL,
        "UNAVAILABLE" => GRPC_UNAVAILABLE,
        "DATA_LOSS" => 15,
        "UNAUTHENTICATED" => 16,
        _ => 2,
    }
}

/// Split a gRPC request body into its length-prefixed messages.
pub fn decode_frames(body: &[u8]) -> Vec<Bytes> {
    let mut messages = Vec::new();
    let mut pos = 0;
    while pos + 5 <= body.len() {
        let len = u32::from_be_bytes([body[pos + 1], body[pos + 2], body[pos + 3], body[pos + 4]])
            as usize;
        let start = pos + 5;
        if start + len > body.len() {
            break;
        }
        messages.push(Bytes::copy_from_slice(&body[start..start + len]));
        pos = start + len;
    }
    messages
}

/// Wrap one message in the gRPC wire framing (uncompressed).
pub fn encode_frame(message: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(message.len() + 5);
    out.put_u8(0);
    out.put_u32(message.len() as u32);
    out.put_slice(message);
    out.freeze()
}

fn trailers(status: u32, message: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert("grpc-status", HeaderValue::from_str(&status.to_string()).unwrap());
    if !message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(message) {
            map.insert("grpc-message", value);
        }
    }
    map
}

/// Serve one gRPC port until shutdown.
pub async fn serve(
    listener: std::net::TcpListener,
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!("gRPC listener on :{port} failed to register: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move { handle(req, port, state).await }
                            });
                            if let Err(e) = http2::Builder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!("gRPC connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => error!("gRPC accept error on :{port}: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn handle(
    req: Request<Incoming>,
    port: u16,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let path = req.uri().path().to_string();
    let metadata: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    let messages = decode_frames(&body);
    let first_message = messages.first().cloned().unwrap_or_default();
    let request_json: Option<serde_json::Value> = serde_json::from_slice(&first_message).ok();

    // "/package.Service/Method"
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let (service, method) = match (segments.next(), segments.next()) {
        (Some(s), Some(m)) if !s.is_empty() && !m.is_empty() => (s.to_string(), m.to_string()),
        _ => {
            return Ok(grpc_error_response(
                GRPC_UNIMPLEMENTED,
                "malformed method path",
            ))
        }
    };

    let snapshot = RequestSnapshot {
        method: "POST".to_string(),
        path: path.clone(),
        headers: metadata.clone(),
        body: request_json
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        ..Default::default()
    };

    // Resolve across every gRPC mock merged onto this port. The registry
    // rejects duplicate service+method pairs, so at most one mock owns it.
    let mut resolved: Option<(String, GrpcMethodConfig)> = None;
    for mock in state.registry.snapshot(MockType::Grpc) {
        let MockSpec::Grpc(spec) = &mock.spec else {
            continue;
        };
        if !mock.enabled || spec.port != port {
            continue;
        }
        if let Some(config) = spec
            .services
            .get(&service)
            .and_then(|svc| svc.methods.get(&method))
        {
            resolved = Some((mock.id.clone(), config.clone()));
            break;
        }
    }

    let Some((mock_id, config)) = resolved else {
        metrics::record_request("grpc", false);
        state.request_log.push(
            MockType::Grpc,
            &snapshot,
            None,
            ResponseSummary {
                status_code: 200,
                body_preview: format!("grpc-status {GRPC_UNIMPLEMENTED}"),
                ..Default::default()
            },
            Vec::new(),
        );
        return Ok(grpc_error_response(
            GRPC_UNIMPLEMENTED,
            &format!("unknown method {service}/{method}"),
        ));
    };

    // Optional metadata / request-field predicates.
    if let Some(criteria) = &config.criteria {
        for (key, expected) in &criteria.metadata {
            if metadata.get(&key.to_lowercase()) != Some(expected) {
                return Ok(grpc_error_response(
                    GRPC_NOT_FOUND,
                    &format!("metadata {key} did not match"),
                ));
            }
        }
        if !criteria.request.is_empty() {
            let Some(request_json) = &request_json else {
                return Ok(grpc_error_response(
                    GRPC_NOT_FOUND,
                    "request message is not JSON-decodable",
                ));
            };
            for (field, expected) in &criteria.request {
                let actual = crate::matching::jsonpath::extract_value(request_json, field)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                if !crate::matching::jsonpath::loose_eq(&actual, expected) {
                    return Ok(grpc_error_response(
                        GRPC_NOT_FOUND,
                        &format!("request field {field} did not match"),
                    ));
                }
            }
        }
    }

    state.verification.record(&mock_id, &snapshot);
    metrics::record_request("grpc", true);
    state.request_log.push(
        MockType::Grpc,
        &snapshot,
        Some(&mock_id),
        ResponseSummary {
            status_code: 200,
            ..Default::default()
        },
        Vec::new(),
    );

    // Chaos: errors map to UNAVAILABLE, timeouts hold then reset the stream.
    let decision = state.chaos.decide("POST", &path);
    match decision.outcome {
        crate::chaos::ChaosOutcome::Timeout { hold_ms } => {
            metrics::record_chaos("timeout");
            let hold = if hold_ms > 0 {
                hold_ms
            } else {
                state.options.write_timeout_secs.max(1) * 1000
            };
            tokio::time::sleep(Duration::from_millis(hold)).await;
            return Ok(grpc_error_response(GRPC_UNAVAILABLE, "chaos timeout"));
        }
        crate::chaos::ChaosOutcome::Error { .. } => {
            metrics::record_chaos("error");
            return Ok(grpc_error_response(GRPC_UNAVAILABLE, "chaos injected"));
        }
        crate::chaos::ChaosOutcome::None => {}
    }

    let delay = decision.latency_ms.max(config.delay_ms);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if let Some(error) = &config.error {
        return Ok(grpc_error_response(
            status_code_by_name(&error.code),
            &error.message,
        ));
    }

    // Stateful wiring: the decoded message is the CRUD payload.
    if !config.stateful_resource.is_empty() {
        return Ok(stateful_grpc(&config, &state, request_json));
    }

    let ctx = Context {
        request: Some(&snapshot),
        mock_id: &mock_id,
        state: Some(&state.state),
        sequences: Some(&state.sequences),
        ..Default::default()
    };

    let payloads: Vec<Bytes> = if !config.responses.is_empty() {
        config
            .responses
            .iter()
            .map(|r| Bytes::from(render_json(r, &ctx).to_string()))
            .collect()
    } else {
        let rendered = config
            .response
            .as_ref()
            .map(|r| render_json(r, &ctx))
            .unwrap_or(serde_json::Value::Object(Default::default()));
        vec![Bytes::from(rendered.to_string())]
    };

    Ok(stream_response(payloads, config.stream_delay_ms))
}

/// DATA frames for each message, then the trailers frame. Streaming delays
/// run on the emission task so the response headers flush immediately.
fn stream_response(payloads: Vec<Bytes>, stream_delay_ms: u64) -> Response<BoxBody> {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        metrics::ACTIVE_STREAMS.inc();
        for (i, payload) in payloads.iter().enumerate() {
            if i > 0 && stream_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(stream_delay_ms)).await;
            }
            if tx
                .send(Frame::data(encode_frame(payload)))
                .await
                .is_err()
            {
                metrics::ACTIVE_STREAMS.dec();
                return;
            }
        }
        let _ = tx.send(Frame::trailers(trailers(GRPC_OK, ""))).await;
        metrics::ACTIVE_STREAMS.dec();
    });

    grpc_response(channel_body(rx))
}

fn stateful_grpc(
    config: &GrpcMethodConfig,
    state: &AppState,
    request_json: Option<serde_json::Value>,
) -> Response<BoxBody> {
    let Some(resource) = state.state.get(&config.stateful_resource) else {
        return grpc_error_response(GRPC_INTERNAL, "stateful resource not registered");
    };
    let data = request_json
        .as_ref()
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let id = data
        .get(resource.id_field())
        .map(crate::matching::jsonpath::value_to_string)
        .unwrap_or_default();

    let result = match config.stateful_action.as_str() {
        "list" => Ok(serde_json::to_value(
            resource.list(&crate::stateful::QueryFilter::default()),
        )
        .unwrap_or(serde_json::Value::Null)),
        "get" => match resource.get(&id) {
            Some(item) => Ok(item.to_json(resource.id_field())),
            None => Err((GRPC_NOT_FOUND, format!("item {id} not found"))),
        },
        "create" => resource
            .create(data, &HashMap::new())
            .map(|item| item.to_json(resource.id_field()))
            .map_err(|e| match e {
                crate::stateful::StatefulError::Capacity { .. } => {
                    (GRPC_RESOURCE_EXHAUSTED, e.to_string())
                }
                other => (GRPC_INTERNAL, other.to_string()),
            }),
        "update" | "patch" => resource
            .update(&id, data)
            .map(|item| item.to_json(resource.id_field()))
            .map_err(|e| (GRPC_NOT_FOUND, e.to_string())),
        "delete" => {
            resource.delete(&id);
            Ok(serde_json::json!({"deleted": true}))
        }
        other => Err((GRPC_INTERNAL, format!("unknown stateful action {other:?}"))),
    };

    match result {
        Ok(value) => stream_response(vec![Bytes::from(value.to_string())], 0),
        Err((code, message)) => grpc_error_response(code, &message),
    }
}

fn grpc_response(body: BoxBody) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/grpc")
        .body(body)
        .expect("static response")
}

/// Trailers-only error response.
fn grpc_error_response(status: u32, message: &str) -> Response<BoxBody> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let trailer_map = trailers(status, message);
    tokio::spawn(async move {
        let _ = tx.send(Frame::trailers(trailer_map)).await;
    });
    grpc_response(channel_body(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let message = br#"{"name": "test"}"#;
        let framed = encode_frame(message);
        assert_eq!(framed[0], 0);
        assert_eq!(&framed[5..], message);

        let decoded = decode_frames(&framed);
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0][..], message);
    }

    #[test]
    fn decode_handles_multiple_and_truncated_frames() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&encode_frame(b"one"));
        body.extend_from_slice(&encode_frame(b"two"));
        // Truncated third frame: header claims more bytes than present.
        body.extend_from_slice(&[0, 0, 0, 0, 99, b'x']);

        let decoded = decode_frames(&body);
        assert_eq!(decoded.len(), 2);
        assert_eq!(&decoded[0][..], b"one");
        assert_eq!(&decoded[1][..], b"two");
    }

    #[test]
    fn status_names_map_to_codes() {
        assert_eq!(status_code_by_name("NOT_FOUND"), 5);
        assert_eq!(status_code_by_name("unimplemented"), 12);
        assert_eq!(status_code_by_name("bogus"), 2);
    }

    #[test]
    fn trailer_map_carries_status_and_message() {
        let map = trailers(5, "missing");
        assert_eq!(map.get("grpc-status").unwrap(), "5");
        assert_eq!(map.get("grpc-message").unwrap(), "missing");
    }
}
