//! Type definitions for the unified mock model.
//!
//! A [`Mock`] pairs a protocol-specific matcher with a canned response.
//! Exactly one spec variant is populated, selected by the `type` field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol tag for a mock. Dispatch routes by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockType {
    Http,
    WebSocket,
    GraphQL,
    Grpc,
    Soap,
    Mqtt,
    Sse,
    OAuth,
}

impl MockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MockType::Http => "http",
            MockType::WebSocket => "websocket",
            MockType::GraphQL => "graphql",
            MockType::Grpc => "grpc",
            MockType::Soap => "soap",
            MockType::Mqtt => "mqtt",
            MockType::Sse => "sse",
            MockType::OAuth => "oauth",
        }
    }
}

impl std::fmt::Display for MockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unified mock definition. The `spec` carries the protocol-specific
/// matcher and response template.
///
/// The wire format nests the spec under a key named after the type
/// (`"http": {...}`); `type` and `id` may be omitted and are filled in from
/// the populated spec key during conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "MockRaw", into = "MockRaw")]
pub struct Mock {
    /// Stable identifier. Client-assigned, or generated on load.
    pub id: String,
    pub mock_type: MockType,
    pub name: String,
    pub description: String,
    /// Disabled mocks are skipped by dispatch but remain in the registry.
    pub enabled: bool,
    /// Workspace label; opaque to the matcher.
    pub workspace: String,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub spec: MockSpec,
}

pub(crate) fn default_true() -> bool {
    true
}

/// Raw wire representation: optional `type`, one spec field populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MockRaw {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mock_type: Option<MockType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphql: Option<GraphQLSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soap: Option<SoapSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<SseSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSpec>,
}

impl TryFrom<MockRaw> for Mock {
    type Error = String;

    fn try_from(raw: MockRaw) -> Result<Self, Self::Error> {
        let mut specs: Vec<MockSpec> = Vec::new();
        if let Some(s) = raw.http {
            specs.push(MockSpec::Http(s));
        }
        if let Some(s) = raw.websocket {
            specs.push(MockSpec::WebSocket(s));
        }
        if let Some(s) = raw.graphql {
            specs.push(MockSpec::GraphQL(s));
        }
        if let Some(s) = raw.grpc {
            specs.push(MockSpec::Grpc(s));
        }
        if let Some(s) = raw.soap {
            specs.push(MockSpec::Soap(s));
        }
        if let Some(s) = raw.mqtt {
            specs.push(MockSpec::Mqtt(s));
        }
        if let Some(s) = raw.sse {
            specs.push(MockSpec::Sse(s));
        }
        if let Some(s) = raw.oauth {
            specs.push(MockSpec::OAuth(s));
        }

        if specs.len() > 1 {
            return Err("mock declares more than one protocol spec".to_string());
        }
        let spec = specs
            .pop()
            .ok_or_else(|| "mock declares no protocol spec".to_string())?;

        // Inferred type must agree with an explicit one.
        let inferred = spec.mock_type();
        if let Some(declared) = raw.mock_type {
            if declared != inferred {
                return Err(format!(
                    "mock type {declared} does not match populated {inferred} spec"
                ));
            }
        }

        Ok(Mock {
            id: raw.id,
            mock_type: inferred,
            name: raw.name,
            description: raw.description,
            enabled: raw.enabled,
            workspace: raw.workspace,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            spec,
        })
    }
}

impl From<Mock> for MockRaw {
    fn from(mock: Mock) -> Self {
        let mut raw = MockRaw {
            id: mock.id,
            mock_type: Some(mock.mock_type),
            name: mock.name,
            description: mock.description,
            enabled: mock.enabled,
            workspace: mock.workspace,
            created_at: mock.created_at,
            updated_at: mock.updated_at,
            http: None,
            websocket: None,
            graphql: None,
            grpc: None,
            soap: None,
            mqtt: None,
            sse: None,
            oauth: None,
        };
        match mock.spec {
            MockSpec::Http(s) => raw.http = Some(s),
            MockSpec::WebSocket(s) => raw.websocket = Some(s),
            MockSpec::GraphQL(s) => raw.graphql = Some(s),
            MockSpec::Grpc(s) => raw.grpc = Some(s),
            MockSpec::Soap(s) => raw.soap = Some(s),
            MockSpec::Mqtt(s) => raw.mqtt = Some(s),
            MockSpec::Sse(s) => raw.sse = Some(s),
            MockSpec::OAuth(s) => raw.oauth = Some(s),
        }
        raw
    }
}

impl Mock {
    /// Fill in a generated id and creation timestamps when absent.
    pub fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = format!("mock-{}", uuid::Uuid::new_v4());
        }
        let now = chrono::Utc::now();
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
    }
    /// Priority for dispatch; higher wins. Only HTTP-family specs carry one today.
    pub fn priority(&self) -> i32 {
        match &self.spec {
            MockSpec::Http(s) => s.priority,
            MockSpec::Sse(s) => s.priority,
            _ => 0,
        }
    }

    /// Display path for admin listings.
    pub fn display_path(&self) -> String {
        match &self.spec {
            MockSpec::Http(s) => {
                if !s.matcher.path.is_empty() {
                    s.matcher.path.clone()
                } else {
                    s.matcher.path_pattern.clone()
                }
            }
            MockSpec::WebSocket(s) => s.path.clone(),
            MockSpec::GraphQL(s) => s.path.clone(),
            MockSpec::Soap(s) => s.path.clone(),
            MockSpec::Sse(s) => s.matcher.path.clone(),
            MockSpec::Grpc(s) => format!(":{}", s.port),
            MockSpec::Mqtt(s) => format!(":{}", s.port),
            MockSpec::OAuth(s) => s.issuer.clone(),
        }
    }
}

/// Protocol-specific mock body, keyed by the top-level `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MockSpec {
    #[serde(rename = "http")]
    Http(HttpSpec),
    #[serde(rename = "websocket")]
    WebSocket(WebSocketSpec),
    #[serde(rename = "graphql")]
    GraphQL(GraphQLSpec),
    #[serde(rename = "grpc")]
    Grpc(GrpcSpec),
    #[serde(rename = "soap")]
    Soap(SoapSpec),
    #[serde(rename = "mqtt")]
    Mqtt(MqttSpec),
    #[serde(rename = "sse")]
    Sse(SseSpec),
    #[serde(rename = "oauth")]
    OAuth(OAuthSpec),
}

impl MockSpec {
    pub fn mock_type(&self) -> MockType {
        match self {
            MockSpec::Http(_) => MockType::Http,
            MockSpec::WebSocket(_) => MockType::WebSocket,
            MockSpec::GraphQL(_) => MockType::GraphQL,
            MockSpec::Grpc(_) => MockType::Grpc,
            MockSpec::Soap(_) => MockType::Soap,
            MockSpec::Mqtt(_) => MockType::Mqtt,
            MockSpec::Sse(_) => MockType::Sse,
            MockSpec::OAuth(_) => MockType::OAuth,
        }
    }
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSpec {
    /// Higher priority mocks win when several match.
    #[serde(default)]
    pub priority: i32,
    pub matcher: HttpMatcher,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponse>,
    /// Routes this mock through a registered custom stateful operation.
    /// The JSON request body becomes the operation input.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stateful_operation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMatcher {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Literal path, `{param}` placeholder path, or `*` glob.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Regex alternative to `path`; mutually exclusive with it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_pattern: String,
    /// Required headers. Values may contain `*` wildcards.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query_params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body_contains: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body_equals: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body_pattern: String,
    /// JSONPath expression -> expected value, all must hold.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub body_json_path: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls: Option<MtlsMatch>,
}

/// mTLS client certificate matching criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtlsMatch {
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cn_pattern: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ou: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub o: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub san: Option<SanMatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanMatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dns: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    #[serde(
        default = "default_status_code",
        deserialize_with = "deserialize_status_code"
    )]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Body text or template. Objects/arrays in the config document are
    /// normalized to their canonical JSON string on load.
    #[serde(default, deserialize_with = "deserialize_body")]
    pub body: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            body: String::new(),
            delay_ms: 0,
        }
    }
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

pub(crate) fn default_status_code() -> u16 {
    200
}

/// Accept statusCode as either a number or a numeric string.
pub(crate) fn deserialize_status_code<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| D::Error::custom("invalid status code number")),
        serde_json::Value::String(s) => s
            .parse::<u16>()
            .map_err(|_| D::Error::custom(format!("invalid status code string: {s}"))),
        _ => Err(D::Error::custom("statusCode must be a number or string")),
    }
}

/// Accept body as a string, or as an inline JSON object/array/number that is
/// stored as its canonical JSON string.
pub(crate) fn deserialize_body<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ============================================================================
// SSE
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseSpec {
    #[serde(default)]
    pub priority: i32,
    pub matcher: HttpMatcher,
    #[serde(default)]
    pub events: Vec<SseEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<SseGenerator>,
    #[serde(default)]
    pub timing: SseTiming,
    #[serde(default)]
    pub lifecycle: SseLifecycle,
    #[serde(default)]
    pub resume: SseResume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseEvent {
    /// `event:` field; empty means an unnamed event.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry: u64,
    /// Per-event delay override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseGenerator {
    /// "sequence" | "template"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SseSequenceGenerator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<SseTemplateGenerator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseSequenceGenerator {
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_one")]
    pub increment: i64,
    /// Format string where `%d` is replaced by the counter value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
}

fn default_one() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseTemplateGenerator {
    pub events: Vec<SseEvent>,
    #[serde(default = "default_one_usize")]
    pub repeat: usize,
}

fn default_one_usize() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseTiming {
    /// Fixed delay between events, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_delay: Option<SseRandomDelay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_event_delays: Vec<u64>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<SseBurst>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseRandomDelay {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseBurst {
    pub count: usize,
    /// Delay between events inside a burst, milliseconds.
    #[serde(default)]
    pub interval: u64,
    /// Pause between bursts, milliseconds.
    #[serde(default)]
    pub pause: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseLifecycle {
    /// Keepalive comment interval, milliseconds. 0 disables.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub keepalive_interval: u64,
    /// Stream closes after this many events. 0 means unbounded.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_events: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseResume {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub buffer_size: usize,
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

// ============================================================================
// WebSocket
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketSpec {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subprotocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<WsMatcherConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_response: Option<WsMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<WsScenario>,
    /// Echo incoming frames back when no matcher fires.
    #[serde(default)]
    pub echo_mode: bool,
    /// Idle timeout in milliseconds. 0 uses the server default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMatcherConfig {
    #[serde(rename = "match")]
    pub criteria: WsMatchCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WsMessage>,
    #[serde(default)]
    pub no_response: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMatchCriteria {
    /// "exact" | "contains" | "jsonPath"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// JSONPath expression when kind == "jsonPath".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage {
    /// "text" | "binary" | "json"
    #[serde(rename = "type", default = "default_ws_text")]
    pub kind: String,
    pub value: serde_json::Value,
    /// Delay before sending, milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
}

fn default_ws_text() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsScenario {
    pub name: String,
    pub steps: Vec<WsScenarioStep>,
    #[serde(default)]
    pub r#loop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsScenarioStep {
    /// "send" | "wait" | "pause"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<WsMessage>,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub criteria: Option<WsMatchCriteria>,
    /// Pause duration in milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_ms: u64,
}

// ============================================================================
// GraphQL
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLSpec {
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resolvers: HashMap<String, ResolverConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subscriptions: HashMap<String, SubscriptionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
    /// Optional variable/argument equality predicates.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub criteria: Option<ResolverMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GraphQLErrorConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverMatch {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLErrorConfig {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub events: Vec<SubscriptionEvent>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fixed_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
}

// ============================================================================
// gRPC
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSpec {
    pub port: u16,
    /// service FQN -> methods.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub services: HashMap<String, GrpcServiceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcServiceConfig {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub methods: HashMap<String, GrpcMethodConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcMethodConfig {
    /// Unary response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Server-streaming response payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
    /// Delay between streamed messages.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stream_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GrpcErrorConfig>,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub criteria: Option<GrpcMethodMatch>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stateful_resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stateful_action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcMethodMatch {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Field equality checks against the decoded request message.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub request: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcErrorConfig {
    /// Canonical status code name, e.g. "NOT_FOUND".
    pub code: String,
    pub message: String,
}

// ============================================================================
// SOAP
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoapSpec {
    pub path: String,
    /// operation local-name -> config.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operations: HashMap<String, SoapOperationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoapOperationConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub soap_action: String,
    /// Response envelope body (templated).
    #[serde(default)]
    pub response: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<SoapFault>,
    /// XPath-lite predicates: element path -> required text value.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub criteria: Option<SoapMatch>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stateful_resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stateful_action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoapMatch {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub xpath: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoapFault {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

// ============================================================================
// MQTT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttSpec {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<MqttAuthConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<MqttTopicConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<MqttUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttUser {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acl: Vec<MqttAclRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttAclRule {
    /// Topic filter; `+` and tail-only `#` wildcards allowed.
    pub topic: String,
    /// "read" | "write" | "readwrite"
    pub access: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttTopicConfig {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    /// Messages published by the broker on this topic after start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MqttMessageConfig>,
    /// Behavior when a client publishes to this topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_publish: Option<MqttPublishHandler>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttMessageConfig {
    /// Payload text or template.
    pub payload: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay_ms: u64,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttPublishHandler {
    /// Reply published back; `{{request.topic}}`/`{{request.payload}}` available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<MqttMessageConfig>,
    /// Topic to re-publish the incoming payload on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub forward: String,
    /// Topic the response is published to; defaults to the incoming topic.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_topic: String,
}

// ============================================================================
// OAuth
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSpec {
    /// Issuer base path, e.g. "/oauth".
    pub issuer: String,
    /// Access token lifetime in seconds.
    #[serde(default = "default_token_expiry")]
    pub token_expiry_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_claims: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<OAuthClient>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<OAuthUser>,
}

fn default_token_expiry() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthUser {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mock_round_trips() {
        let json = r#"{
            "id": "m1",
            "type": "http",
            "name": "hello",
            "http": {
                "matcher": {"method": "GET", "path": "/hello"},
                "response": {"statusCode": 200, "body": "hi"}
            }
        }"#;
        let mock: Mock = serde_json::from_str(json).unwrap();
        assert_eq!(mock.id, "m1");
        assert_eq!(mock.mock_type, MockType::Http);
        assert!(mock.enabled);
        let MockSpec::Http(spec) = &mock.spec else {
            panic!("expected http spec");
        };
        assert_eq!(spec.matcher.method, "GET");
        assert_eq!(spec.response.as_ref().unwrap().status_code, 200);

        let out = serde_json::to_string(&mock).unwrap();
        let back: Mock = serde_json::from_str(&out).unwrap();
        assert_eq!(back.id, "m1");
    }

    #[test]
    fn status_code_accepts_string() {
        let json = r#"{"statusCode": "418", "body": "teapot"}"#;
        let resp: HttpResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status_code, 418);
    }

    #[test]
    fn body_accepts_inline_object() {
        let json = r#"{"statusCode": 200, "body": {"id": 1}}"#;
        let resp: HttpResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.body, r#"{"id":1}"#);
    }

    #[test]
    fn grpc_spec_parses_services() {
        let json = r#"{
            "type": "grpc",
            "grpc": {
                "port": 50051,
                "services": {
                    "acme.Greeter": {"methods": {"SayHello": {"response": {"msg": "hi"}}}}
                }
            }
        }"#;
        let mock: Mock = serde_json::from_str(json).unwrap();
        let MockSpec::Grpc(spec) = &mock.spec else {
            panic!("expected grpc spec");
        };
        assert_eq!(spec.port, 50051);
        assert!(spec.services.contains_key("acme.Greeter"));
    }
}
