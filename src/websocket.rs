//! WebSocket sessions: upgrade handling, per-frame matcher dispatch, echo
//! mode, and scripted scenarios.

use crate::engine::body::{empty, full, BoxBody};
use crate::engine::AppState;
use crate::matching::{jsonpath, RequestSnapshot};
use crate::metrics;
use crate::mock::{MockSpec, MockType, WebSocketSpec, WsMatchCriteria, WsMessage};
use crate::requestlog::ResponseSummary;
use crate::template::{render_json, render_str, Context};
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// True when the request asks for a WebSocket upgrade.
pub fn is_upgrade(headers: &hyper::HeaderMap) -> bool {
    let wants_upgrade = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_lowercase().contains("upgrade"));
    let is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    wants_upgrade && is_websocket
}

/// Complete the handshake for a matching mock and run the session on its own
/// task. Unmatched paths get a plain 404.
pub async fn handle_upgrade(
    req: Request<Incoming>,
    path: &str,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let mock = state
        .registry
        .snapshot(MockType::WebSocket)
        .into_iter()
        .find(|m| m.enabled && matches!(&m.spec, MockSpec::WebSocket(s) if s.path == path));

    let snapshot = RequestSnapshot {
        method: "GET".into(),
        path: path.to_string(),
        ..Default::default()
    };

    let Some(mock) = mock else {
        metrics::record_request("websocket", false);
        state.request_log.push(
            MockType::WebSocket,
            &snapshot,
            None,
            ResponseSummary {
                status_code: 404,
                ..Default::default()
            },
            Vec::new(),
        );
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("no websocket mock for this path"))
            .expect("static response");
    };

    let MockSpec::WebSocket(spec) = mock.spec.clone() else {
        unreachable!("filtered to websocket specs");
    };

    let Some(key) = req
        .headers()
        .get("sec-websocket-key")
        .map(|k| derive_accept_key(k.as_bytes()))
    else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full("missing Sec-WebSocket-Key"))
            .expect("static response");
    };

    state.verification.record(&mock.id, &snapshot);
    metrics::record_request("websocket", true);
    state.request_log.push(
        MockType::WebSocket,
        &snapshot,
        Some(&mock.id),
        ResponseSummary {
            status_code: 101,
            ..Default::default()
        },
        Vec::new(),
    );

    let subprotocol = spec.subprotocols.first().cloned();
    let mock_id = mock.id.clone();
    let session_state = Arc::clone(&state);
    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                metrics::ACTIVE_STREAMS.inc();
                run_session(ws, spec, mock_id, session_state).await;
                metrics::ACTIVE_STREAMS.dec();
            }
            Err(e) => debug!("websocket upgrade failed: {e}"),
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header("sec-websocket-accept", key);
    if let Some(proto) = subprotocol {
        if let Ok(value) = HeaderValue::from_str(&proto) {
            builder = builder.header("sec-websocket-protocol", value);
        }
    }
    builder.body(empty()).expect("static response")
}

async fn run_session<S>(
    mut ws: WebSocketStream<S>,
    spec: WebSocketSpec,
    mock_id: String,
    state: Arc<AppState>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let idle = if spec.idle_timeout_ms > 0 {
        Duration::from_millis(spec.idle_timeout_ms)
    } else {
        DEFAULT_IDLE_TIMEOUT
    };

    // Scenario mode drives the conversation from the script.
    if let Some(scenario) = spec.scenario.clone() {
        run_scenario(&mut ws, &scenario, &spec, &mock_id, &state, idle).await;
        let _ = ws.send(Message::Close(None)).await;
        return;
    }

    // Reactive mode: match each incoming frame.
    loop {
        let frame = match tokio::time::timeout(idle, ws.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("websocket read error: {e}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!("websocket idle timeout");
                let _ = ws.send(Message::Close(None)).await;
                break;
            }
        };

        let payload = match &frame {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => String::from_utf8_lossy(data).to_string(),
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data.clone())).await;
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = pick_response(&spec, &payload);
        match reply {
            FrameReply::Message(msg) => {
                if send_ws_message(&mut ws, &msg, &payload, &mock_id, &state).await.is_err() {
                    break;
                }
            }
            FrameReply::Silent => {}
            FrameReply::Echo => {
                if ws.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

enum FrameReply {
    Message(WsMessage),
    Silent,
    Echo,
}

fn pick_response(spec: &WebSocketSpec, payload: &str) -> FrameReply {
    for matcher in &spec.matchers {
        if criteria_matches(&matcher.criteria, payload) {
            if matcher.no_response {
                return FrameReply::Silent;
            }
            if let Some(response) = &matcher.response {
                return FrameReply::Message(response.clone());
            }
            return FrameReply::Silent;
        }
    }
    if let Some(default) = &spec.default_response {
        return FrameReply::Message(default.clone());
    }
    if spec.echo_mode {
        return FrameReply::Echo;
    }
    FrameReply::Silent
}

pub(crate) fn criteria_matches(criteria: &WsMatchCriteria, payload: &str) -> bool {
    match criteria.kind.as_str() {
        "exact" => payload == criteria.value,
        "contains" => payload.contains(&criteria.value),
        "jsonPath" => jsonpath::extract(payload, &criteria.path)
            .map(|v| {
                if criteria.value.is_empty() {
                    true
                } else {
                    jsonpath::value_to_string(&v) == criteria.value
                }
            })
            .unwrap_or(false),
        other => {
            warn!("unknown websocket matcher kind {other:?}");
            false
        }
    }
}

async fn send_ws_message<S>(
    ws: &mut WebSocketStream<S>,
    message: &WsMessage,
    incoming_payload: &str,
    mock_id: &str,
    state: &AppState,
) -> Result<(), ()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if message.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(message.delay_ms)).await;
    }

    let snapshot = RequestSnapshot {
        body: incoming_payload.to_string(),
        ..Default::default()
    };
    let ctx = Context {
        request: Some(&snapshot),
        mock_id,
        state: Some(&state.state),
        sequences: Some(&state.sequences),
        ..Default::default()
    };

    let out = match message.kind.as_str() {
        "binary" => {
            let rendered = match &message.value {
                serde_json::Value::String(s) => render_str(s, &ctx),
                other => other.to_string(),
            };
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&rendered)
                .unwrap_or_else(|_| rendered.into_bytes());
            Message::Binary(bytes)
        }
        "json" => Message::Text(render_json(&message.value, &ctx).to_string()),
        _ => {
            let rendered = match &message.value {
                serde_json::Value::String(s) => render_str(s, &ctx),
                other => render_json(other, &ctx).to_string(),
            };
            Message::Text(rendered)
        }
    };

    ws.send(out).await.map_err(|_| ())
}

async fn run_scenario<S>(
    ws: &mut WebSocketStream<S>,
    scenario: &crate::mock::WsScenario,
    spec: &WebSocketSpec,
    mock_id: &str,
    state: &AppState,
    idle: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        for step in &scenario.steps {
            match step.kind.as_str() {
                "send" => {
                    let Some(message) = &step.message else {
                        continue;
                    };
                    if send_ws_message(ws, message, "", mock_id, state).await.is_err() {
                        return;
                    }
                }
                "wait" => {
                    // Block until a frame arrives that satisfies the step's
                    // criteria (or any frame when none is declared).
                    loop {
                        let frame = match tokio::time::timeout(idle, ws.next()).await {
                            Ok(Some(Ok(frame))) => frame,
                            _ => return,
                        };
                        let payload = match &frame {
                            Message::Text(text) => text.to_string(),
                            Message::Binary(data) => String::from_utf8_lossy(data).to_string(),
                            Message::Ping(data) => {
                                let _ = ws.send(Message::Pong(data.clone())).await;
                                continue;
                            }
                            Message::Close(_) => return,
                            _ => continue,
                        };
                        match &step.criteria {
                            Some(criteria) if !criteria_matches(criteria, &payload) => continue,
                            _ => break,
                        }
                    }
                }
                "pause" => {
                    tokio::time::sleep(Duration::from_millis(step.duration_ms.max(1))).await;
                }
                other => warn!("unknown scenario step kind {other:?} in {}", scenario.name),
            }
        }
        if !scenario.r#loop {
            break;
        }
    }
    let _ = spec; // reactive matchers do not apply in scenario mode
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn criteria(value: serde_json::Value) -> WsMatchCriteria {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn exact_and_contains_matchers() {
        assert!(criteria_matches(
            &criteria(json!({"type": "exact", "value": "ping"})),
            "ping"
        ));
        assert!(!criteria_matches(
            &criteria(json!({"type": "exact", "value": "ping"})),
            "ping!"
        ));
        assert!(criteria_matches(
            &criteria(json!({"type": "contains", "value": "ing"})),
            "ping"
        ));
    }

    #[test]
    fn jsonpath_matcher_on_payload() {
        let c = criteria(json!({"type": "jsonPath", "path": "$.op", "value": "subscribe"}));
        assert!(criteria_matches(&c, r#"{"op": "subscribe"}"#));
        assert!(!criteria_matches(&c, r#"{"op": "publish"}"#));
        assert!(!criteria_matches(&c, "not json"));
    }

    #[test]
    fn pick_response_prefers_first_matching_rule() {
        let spec: WebSocketSpec = serde_json::from_value(json!({
            "path": "/ws",
            "matchers": [
                {"match": {"type": "exact", "value": "quiet"}, "noResponse": true},
                {"match": {"type": "contains", "value": "hi"},
                 "response": {"type": "text", "value": "hello"}}
            ],
            "echoMode": true
        }))
        .unwrap();

        assert!(matches!(pick_response(&spec, "quiet"), FrameReply::Silent));
        assert!(matches!(pick_response(&spec, "hi there"), FrameReply::Message(_)));
        // Nothing matched and no default: echo mode kicks in.
        assert!(matches!(pick_response(&spec, "other"), FrameReply::Echo));
    }

    #[test]
    fn upgrade_detection() {
        let mut headers = hyper::HeaderMap::new();
        assert!(!is_upgrade(&headers));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade(&headers));
    }
}
