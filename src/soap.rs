//! SOAP mock handling: envelope scanning, operation dispatch, XPath-lite
//! predicates, fault envelopes, and stateful CRUD wiring.
//!
//! The scanner is deliberately small: mocks only need the first Body child's
//! local name and flat field extraction, not a full XML parse.

use crate::engine::body::{full, BoxBody};
use crate::engine::handler::plain_response;
use crate::matching::RequestSnapshot;
use crate::mock::{SoapOperationConfig, SoapSpec};
use crate::stateful::{QueryFilter, StateStore, StatefulError};
use crate::template::{render_str, Context};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

const SOAP_ENV_OPEN: &str =
    r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>"#;
const SOAP_ENV_CLOSE: &str = "</soap:Body></soap:Envelope>";

/// Local name of a tag, with any namespace prefix stripped.
fn local_name(tag: &str) -> &str {
    tag.rsplit(':').next().unwrap_or(tag)
}

/// Iterate opening tags as (local_name, position-after-tag).
fn opening_tags(xml: &str) -> impl Iterator<Item = (String, usize)> + '_ {
    let mut pos = 0;
    std::iter::from_fn(move || {
        loop {
            let start = xml[pos..].find('<')? + pos;
            let end = xml[start..].find('>')? + start;
            let raw = &xml[start + 1..end];
            pos = end + 1;
            if raw.starts_with('/') || raw.starts_with('?') || raw.starts_with('!') {
                continue;
            }
            let name = raw
                .split(|c: char| c.is_whitespace() || c == '/')
                .next()
                .unwrap_or(raw);
            return Some((local_name(name).to_string(), pos));
        }
    })
}

/// The first element inside the envelope Body: the operation name.
pub fn extract_operation(xml: &str) -> Option<String> {
    let mut tags = opening_tags(xml);
    let mut saw_body = false;
    for (name, _) in &mut tags {
        if saw_body {
            return Some(name);
        }
        if name == "Body" {
            saw_body = true;
        }
    }
    None
}

/// Text content of the first element with this local name.
pub fn element_text(xml: &str, name: &str) -> Option<String> {
    for (tag, after) in opening_tags(xml) {
        if tag == name {
            let close = xml[after..].find('<')?;
            return Some(xml[after..after + close].trim().to_string());
        }
    }
    None
}

/// Evaluate an XPath-lite predicate: "Op/field" means element `field`
/// somewhere under element `Op`; a bare name matches anywhere.
pub fn xpath_matches(xml: &str, path: &str, expected: &str) -> bool {
    let leaf = path.rsplit('/').next().unwrap_or(path);
    element_text(xml, leaf).as_deref() == Some(expected)
}

/// Direct scalar fields of the operation element, for stateful wiring.
pub fn operation_fields(xml: &str, operation: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let Some(op_pos) = opening_tags(xml).find(|(name, _)| name.as_str() == operation) else {
        return fields;
    };
    let rest = &xml[op_pos.1..];
    let end = rest
        .find(&format!("</{operation}"))
        .or_else(|| rest.rfind("</"))
        .unwrap_or(rest.len());
    let scope = &rest[..end];
    for (name, after) in opening_tags(scope) {
        if let Some(close) = scope[after..].find('<') {
            let text = scope[after..after + close].trim();
            if !text.is_empty() {
                fields.insert(name, text.to_string());
            }
        }
    }
    fields
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn json_to_elements(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                out.push('<');
                out.push_str(key);
                out.push('>');
                match val {
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        json_to_elements(val, out)
                    }
                    serde_json::Value::String(s) => out.push_str(&escape_xml(s)),
                    other => out.push_str(&other.to_string()),
                }
                out.push_str("</");
                out.push_str(key);
                out.push('>');
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                out.push_str("<item>");
                json_to_elements(item, out);
                out.push_str("</item>");
            }
        }
        serde_json::Value::String(s) => out.push_str(&escape_xml(s)),
        other => out.push_str(&other.to_string()),
    }
}

fn envelope(inner: &str) -> String {
    format!("{SOAP_ENV_OPEN}{inner}{SOAP_ENV_CLOSE}")
}

fn fault_envelope(code: &str, message: &str, detail: &str) -> String {
    let detail_xml = if detail.is_empty() {
        String::new()
    } else {
        format!("<detail>{}</detail>", escape_xml(detail))
    };
    envelope(&format!(
        "<soap:Fault><faultcode>{}</faultcode><faultstring>{}</faultstring>{detail_xml}</soap:Fault>",
        escape_xml(code),
        escape_xml(message)
    ))
}

fn xml_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .body(full(body))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
}

/// Handle a SOAP request against the spec.
pub async fn respond(
    spec: &SoapSpec,
    snapshot: &RequestSnapshot,
    ctx: &Context<'_>,
    state: &StateStore,
) -> Response<BoxBody> {
    let Some(operation) = extract_operation(&snapshot.body) else {
        return xml_response(
            StatusCode::BAD_REQUEST,
            fault_envelope("soap:Client", "unable to parse envelope", ""),
        );
    };

    // SOAPAction header can also select the operation when bodies are
    // ambiguous; the body child wins when both are present.
    let Some(config) = spec.operations.get(&operation).or_else(|| {
        snapshot
            .header("soapaction")
            .map(|a| a.trim_matches('"'))
            .and_then(|action| {
                spec.operations
                    .values()
                    .find(|op| !op.soap_action.is_empty() && op.soap_action == action)
            })
    }) else {
        return xml_response(
            StatusCode::NOT_FOUND,
            fault_envelope(
                "soap:Client",
                &format!("no operation configured for {operation}"),
                "",
            ),
        );
    };

    // Optional XPath predicates gate the operation.
    if let Some(criteria) = &config.criteria {
        for (path, expected) in &criteria.xpath {
            if !xpath_matches(&snapshot.body, path, expected) {
                return xml_response(
                    StatusCode::NOT_FOUND,
                    fault_envelope(
                        "soap:Client",
                        &format!("predicate on {path} not satisfied"),
                        "",
                    ),
                );
            }
        }
    }

    if config.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.delay_ms)).await;
    }

    if let Some(fault) = &config.fault {
        return xml_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            fault_envelope(&fault.code, &fault.message, &fault.detail),
        );
    }

    if !config.stateful_resource.is_empty() {
        return stateful_soap(config, &operation, snapshot, state);
    }

    let rendered = render_str(&config.response, ctx);
    let body = if rendered.contains("Envelope") {
        rendered
    } else {
        envelope(&rendered)
    };
    xml_response(StatusCode::OK, body)
}

/// The declaration states resource and action explicitly; request fields come
/// from the operation element's children.
fn stateful_soap(
    config: &SoapOperationConfig,
    operation: &str,
    snapshot: &RequestSnapshot,
    state: &StateStore,
) -> Response<BoxBody> {
    let Some(resource) = state.get(&config.stateful_resource) else {
        return xml_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            fault_envelope(
                "soap:Server",
                &format!("resource {} not registered", config.stateful_resource),
                "",
            ),
        );
    };

    let fields = operation_fields(&snapshot.body, operation);
    let id = fields.get(resource.id_field()).cloned().unwrap_or_default();
    let data: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();

    let result: Result<serde_json::Value, StatefulError> = match config.stateful_action.as_str() {
        "list" => Ok(serde_json::to_value(resource.list(&QueryFilter::default()))
            .unwrap_or(serde_json::Value::Null)),
        "get" => match resource.get(&id) {
            Some(item) => Ok(item.to_json(resource.id_field())),
            None => Err(StatefulError::NotFound {
                resource: resource.name().to_string(),
                id,
            }),
        },
        "create" => resource
            .create(data, &HashMap::new())
            .map(|item| item.to_json(resource.id_field())),
        "update" | "patch" => resource
            .update(&id, data)
            .map(|item| item.to_json(resource.id_field())),
        "delete" => {
            resource.delete(&id);
            Ok(serde_json::json!({"deleted": true}))
        }
        other => {
            return xml_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                fault_envelope(
                    "soap:Server",
                    &format!("unknown stateful action {other:?}"),
                    "",
                ),
            )
        }
    };

    match result {
        Ok(value) => {
            let mut inner = format!("<{operation}Response>");
            json_to_elements(&value, &mut inner);
            inner.push_str(&format!("</{operation}Response>"));
            xml_response(StatusCode::OK, envelope(&inner))
        }
        Err(StatefulError::Capacity { .. }) => xml_response(
            StatusCode::INSUFFICIENT_STORAGE,
            fault_envelope("soap:Server", "resource capacity exceeded", ""),
        ),
        Err(e) => xml_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            fault_envelope("soap:Server", &e.to_string(), ""),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE: &str = r#"<?xml version="1.0"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:usr="http://example.com/users">
  <soapenv:Header/>
  <soapenv:Body>
    <usr:GetUserRequest>
      <usr:userId>42</usr:userId>
      <usr:verbose>true</usr:verbose>
    </usr:GetUserRequest>
  </soapenv:Body>
</soapenv:Envelope>"#;

    #[test]
    fn operation_is_first_body_child() {
        assert_eq!(
            extract_operation(ENVELOPE).as_deref(),
            Some("GetUserRequest")
        );
        assert_eq!(extract_operation("<not-soap/>"), None);
    }

    #[test]
    fn element_text_strips_namespace() {
        assert_eq!(element_text(ENVELOPE, "userId").as_deref(), Some("42"));
        assert_eq!(element_text(ENVELOPE, "missing"), None);
    }

    #[test]
    fn xpath_lite_predicates() {
        assert!(xpath_matches(ENVELOPE, "GetUserRequest/userId", "42"));
        assert!(!xpath_matches(ENVELOPE, "GetUserRequest/userId", "7"));
        assert!(xpath_matches(ENVELOPE, "verbose", "true"));
    }

    #[test]
    fn operation_fields_collects_children() {
        let fields = operation_fields(ENVELOPE, "GetUserRequest");
        assert_eq!(fields.get("userId").map(String::as_str), Some("42"));
        assert_eq!(fields.get("verbose").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn unknown_operation_faults() {
        let spec: SoapSpec = serde_json::from_value(serde_json::json!({
            "path": "/soap",
            "operations": {"Other": {"response": "<ok/>"}}
        }))
        .unwrap();
        let snapshot = RequestSnapshot {
            body: ENVELOPE.to_string(),
            ..Default::default()
        };
        let state = StateStore::new();
        let response = respond(&spec, &snapshot, &Context::default(), &state).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn configured_operation_responds_with_envelope() {
        let spec: SoapSpec = serde_json::from_value(serde_json::json!({
            "path": "/soap",
            "operations": {
                "GetUserRequest": {"response": "<user><id>42</id></user>"}
            }
        }))
        .unwrap();
        let snapshot = RequestSnapshot {
            body: ENVELOPE.to_string(),
            ..Default::default()
        };
        let state = StateStore::new();
        let response = respond(&spec, &snapshot, &Context::default(), &state).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn declared_fault_is_served() {
        let spec: SoapSpec = serde_json::from_value(serde_json::json!({
            "path": "/soap",
            "operations": {
                "GetUserRequest": {
                    "response": "",
                    "fault": {"code": "soap:Server", "message": "down"}
                }
            }
        }))
        .unwrap();
        let snapshot = RequestSnapshot {
            body: ENVELOPE.to_string(),
            ..Default::default()
        };
        let state = StateStore::new();
        let response = respond(&spec, &snapshot, &Context::default(), &state).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
