//! End-to-end tests: a running engine exercised over real sockets.

use mockd::config::{ConfigDocument, ServerOptions};
use mockd::engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Grab a free port by binding to :0 and dropping the listener.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct HttpReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpReply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 client: one request, connection closed.
async fn http_request(port: u16, method: &str, path: &str, body: &str) -> HttpReply {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|l| l.split_once(": "))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    HttpReply {
        status,
        headers,
        body: body.to_string(),
    }
}

async fn started_engine(config_yaml: &str) -> (Arc<Engine>, u16, u16) {
    let port = free_port();
    let admin_port = free_port();
    let mut doc = ConfigDocument::parse(config_yaml).unwrap();
    doc.server = ServerOptions {
        port,
        admin_port,
        ..Default::default()
    };

    let engine = Engine::new(doc.server.clone());
    engine.load_document(&doc).unwrap();
    engine.start().await.unwrap();
    // Give the accept loops a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (engine, port, admin_port)
}

#[tokio::test]
async fn http_literal_match_and_near_miss_diagnostics() {
    let (engine, port, _) = started_engine(
        r#"
mocks:
  - id: hello
    type: http
    http:
      matcher:
        method: GET
        path: /hello
      response:
        statusCode: 200
        body: "hi"
"#,
    )
    .await;

    let reply = http_request(port, "GET", "/hello", "").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "hi");

    // Wrong path: 404 with near-miss diagnostics attached (the method still
    // matched, so the mock shows up as a near miss).
    let miss = http_request(port, "GET", "/other", "").await;
    assert_eq!(miss.status, 404);
    assert_eq!(miss.header("x-mockd-near-misses"), Some("1"));
    let body: serde_json::Value = serde_json::from_str(&miss.body).unwrap();
    assert_eq!(body["nearMisses"][0]["mockId"], "hello");
    assert!(body["nearMisses"][0]["reason"]
        .as_str()
        .unwrap()
        .contains("expected"));

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn priority_and_insertion_order_tie_break() {
    let (engine, port, _) = started_engine(
        r#"
mocks:
  - id: low
    type: http
    http:
      priority: 5
      matcher: {method: GET, path: /x}
      response: {statusCode: 200, body: "low"}
  - id: high
    type: http
    http:
      priority: 10
      matcher: {method: GET, path: /x}
      response: {statusCode: 200, body: "high"}
  - id: first-equal
    type: http
    http:
      priority: 20
      matcher: {method: GET, path: /y}
      response: {statusCode: 200, body: "first"}
  - id: second-equal
    type: http
    http:
      priority: 20
      matcher: {method: GET, path: /y}
      response: {statusCode: 200, body: "second"}
"#,
    )
    .await;

    let reply = http_request(port, "GET", "/x", "").await;
    assert_eq!(reply.body, "high");

    let tie = http_request(port, "GET", "/y", "").await;
    assert_eq!(tie.body, "first");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn stateful_crud_round_trip_with_reset() {
    let (engine, port, admin_port) = started_engine(
        r#"
statefulResources:
  - name: users
    basePath: /api/users
    idField: id
    seedData:
      - id: "1"
        name: Alice
"#,
    )
    .await;

    // Seeded list.
    let list = http_request(port, "GET", "/api/users", "").await;
    assert_eq!(list.status, 200);
    let body: serde_json::Value = serde_json::from_str(&list.body).unwrap();
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["name"], "Alice");

    // Create Bob; id and timestamps auto-assigned.
    let created = http_request(port, "POST", "/api/users", r#"{"name": "Bob"}"#).await;
    assert_eq!(created.status, 201);
    let bob: serde_json::Value = serde_json::from_str(&created.body).unwrap();
    let bob_id = bob["id"].as_str().unwrap().to_string();
    assert!(bob.get("createdAt").is_some());

    // Read it back.
    let fetched = http_request(port, "GET", &format!("/api/users/{bob_id}"), "").await;
    assert_eq!(fetched.status, 200);
    let fetched: serde_json::Value = serde_json::from_str(&fetched.body).unwrap();
    assert_eq!(fetched["name"], "Bob");

    // PUT merges: fields missing from the update body survive.
    let put = http_request(
        port,
        "PUT",
        &format!("/api/users/{bob_id}"),
        r#"{"email": "bob@example.com"}"#,
    )
    .await;
    assert_eq!(put.status, 200);
    let updated = http_request(port, "GET", &format!("/api/users/{bob_id}"), "").await;
    let updated: serde_json::Value = serde_json::from_str(&updated.body).unwrap();
    assert_eq!(updated["name"], "Bob");
    assert_eq!(updated["email"], "bob@example.com");

    // Reset through the admin API: Bob gone, seed restored.
    let reset = http_request(admin_port, "POST", "/state/reset", "{}").await;
    assert_eq!(reset.status, 200);
    let list = http_request(port, "GET", "/api/users", "").await;
    let body: serde_json::Value = serde_json::from_str(&list.body).unwrap();
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["name"], "Alice");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn admin_mock_crud_and_grpc_port_merge() {
    let (engine, _, admin_port) = started_engine("mocks: []").await;
    let grpc_port = free_port();

    // First gRPC mock binds the port.
    let first = http_request(
        admin_port,
        "POST",
        "/mocks",
        &serde_json::json!({
            "id": "g1",
            "type": "grpc",
            "grpc": {"port": grpc_port, "services": {"svcA": {"methods": {"Foo": {"response": {}}}}}}
        })
        .to_string(),
    )
    .await;
    assert_eq!(first.status, 201);

    // Second mock on the same port with a different service merges.
    let second = http_request(
        admin_port,
        "POST",
        "/mocks",
        &serde_json::json!({
            "id": "g2",
            "type": "grpc",
            "grpc": {"port": grpc_port, "services": {"svcB": {"methods": {"Bar": {"response": {}}}}}}
        })
        .to_string(),
    )
    .await;
    assert_eq!(second.status, 200);
    let merged: serde_json::Value = serde_json::from_str(&second.body).unwrap();
    assert_eq!(merged["merged"], true);
    assert_eq!(merged["mergedInto"], "g1");
    assert_eq!(merged["total"], 2);

    // Same service+method again: conflict names the existing mock.
    let dup = http_request(
        admin_port,
        "POST",
        "/mocks",
        &serde_json::json!({
            "id": "g3",
            "type": "grpc",
            "grpc": {"port": grpc_port, "services": {"svcA": {"methods": {"Foo": {"response": {}}}}}}
        })
        .to_string(),
    )
    .await;
    assert_eq!(dup.status, 409);
    assert!(dup.body.contains("g1"));

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn chaos_profile_applies_and_resets() {
    let (engine, port, admin_port) = started_engine(
        r#"
mocks:
  - id: hello
    type: http
    http:
      matcher: {method: GET, path: /hello}
      response: {statusCode: 200, body: "hi"}
"#,
    )
    .await;

    let applied = http_request(admin_port, "POST", "/chaos/profiles/offline/apply", "").await;
    assert_eq!(applied.status, 200);

    // offline: every request errors with 503.
    let reply = http_request(port, "GET", "/hello", "").await;
    assert_eq!(reply.status, 503);
    assert_eq!(reply.header("x-mockd-chaos"), Some("injected"));

    let reset = http_request(admin_port, "POST", "/chaos/reset", "").await;
    assert_eq!(reset.status, 200);
    let reply = http_request(port, "GET", "/hello", "").await;
    assert_eq!(reply.status, 200);

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn admin_requests_log_records_unmatched() {
    let (engine, port, admin_port) = started_engine("mocks: []").await;

    http_request(port, "GET", "/nothing-here", "").await;

    let log = http_request(admin_port, "GET", "/requests?unmatchedOnly=true", "").await;
    assert_eq!(log.status, 200);
    let body: serde_json::Value = serde_json::from_str(&log.body).unwrap();
    assert!(body["total"].as_u64().unwrap() >= 1);
    assert_eq!(body["requests"][0]["matched"], false);
    assert_eq!(body["requests"][0]["path"], "/nothing-here");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn template_placeholders_render_per_request() {
    let (engine, port, _) = started_engine(
        r#"
mocks:
  - id: echo
    type: http
    http:
      matcher: {method: GET, path: "/greet/{name}"}
      response:
        statusCode: 200
        body: '{"hello": "{{request.pathParam.name}}", "seq": "{{sequence greet}}"}'
"#,
    )
    .await;

    let first = http_request(port, "GET", "/greet/ada", "").await;
    let body: serde_json::Value = serde_json::from_str(&first.body).unwrap();
    assert_eq!(body["hello"], "ada");
    assert_eq!(body["seq"], "1");

    let second = http_request(port, "GET", "/greet/grace", "").await;
    let body: serde_json::Value = serde_json::from_str(&second.body).unwrap();
    assert_eq!(body["hello"], "grace");
    assert_eq!(body["seq"], "2");

    engine.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn startup_rolls_back_on_port_conflict() {
    // Occupy a port, then ask the engine to bind it: startup must fail and
    // the other listeners must be rolled back (their ports free again).
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let admin_port = taken.local_addr().unwrap().port();
    let port = free_port();

    let doc = ConfigDocument {
        server: ServerOptions {
            port,
            admin_port,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Engine::new(doc.server.clone());
    engine.load_document(&doc).unwrap();
    assert!(engine.start().await.is_err());

    // The primary port must have been released by rollback.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
}
