//! OAuth mock provider: token endpoint, discovery document, and RFC 7662
//! introspection against the tokens this process issued.

use crate::engine::body::BoxBody;
use crate::engine::handler::{json_response, parse_query, plain_response};
use crate::engine::AppState;
use crate::matching::RequestSnapshot;
use crate::mock::OAuthSpec;
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use hyper::{Response, StatusCode};

/// Record of an issued token, kept for introspection.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub client_id: String,
    pub username: String,
    pub scope: String,
    pub expires_at: i64,
}

/// Process-wide map of issued tokens.
#[derive(Default)]
pub struct IssuedTokens {
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl IssuedTokens {
    pub fn insert(&self, token: String, record: TokenRecord) {
        self.tokens.lock().insert(token, record);
    }

    /// RFC 7662 introspection response for a token.
    pub fn introspect(&self, token: &str) -> serde_json::Value {
        let tokens = self.tokens.lock();
        match tokens.get(token) {
            Some(record) if record.expires_at > chrono::Utc::now().timestamp() => json!({
                "active": true,
                "client_id": record.client_id,
                "username": record.username,
                "scope": record.scope,
                "exp": record.expires_at,
                "token_type": "Bearer",
            }),
            _ => json!({"active": false}),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    scope: String,
}

/// Route a request under an OAuth mock's issuer path.
pub fn handle(
    spec: &OAuthSpec,
    mock_id: &str,
    snapshot: &RequestSnapshot,
    state: &AppState,
) -> Response<BoxBody> {
    let sub_path = snapshot
        .path
        .strip_prefix(&spec.issuer)
        .unwrap_or("")
        .trim_end_matches('/');

    match (snapshot.method.as_str(), sub_path) {
        ("POST", "/token") => token_endpoint(spec, mock_id, snapshot, state),
        ("GET", "/.well-known/openid-configuration") => discovery(spec),
        ("GET", "/jwks.json") | ("GET", "/.well-known/jwks.json") => {
            // HS256 mock issuer: no public keys to publish.
            json_response(StatusCode::OK, &json!({"keys": []}))
        }
        ("POST", "/introspect") => {
            let form = parse_query(&snapshot.body);
            let token = form.get("token").map(String::as_str).unwrap_or("");
            json_response(StatusCode::OK, &state.oauth_tokens.introspect(token))
        }
        _ => plain_response(StatusCode::NOT_FOUND, "unknown oauth endpoint"),
    }
}

fn signing_secret(spec: &OAuthSpec, mock_id: &str) -> Vec<u8> {
    spec.clients
        .first()
        .map(|c| c.client_secret.clone())
        .unwrap_or_else(|| mock_id.to_string())
        .into_bytes()
}

fn token_endpoint(
    spec: &OAuthSpec,
    mock_id: &str,
    snapshot: &RequestSnapshot,
    state: &AppState,
) -> Response<BoxBody> {
    let form = parse_query(&snapshot.body);
    let grant_type = form.get("grant_type").map(String::as_str).unwrap_or("");

    let (subject, client_id) = match grant_type {
        "client_credentials" => {
            let client_id = form.get("client_id").map(String::as_str).unwrap_or("");
            let client_secret = form.get("client_secret").map(String::as_str).unwrap_or("");
            let valid = spec
                .clients
                .iter()
                .any(|c| c.client_id == client_id && c.client_secret == client_secret);
            if !valid {
                return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client");
            }
            (client_id.to_string(), client_id.to_string())
        }
        "password" => {
            let username = form.get("username").map(String::as_str).unwrap_or("");
            let password = form.get("password").map(String::as_str).unwrap_or("");
            let valid = spec
                .users
                .iter()
                .any(|u| u.username == username && u.password == password);
            if !valid {
                return oauth_error(StatusCode::UNAUTHORIZED, "invalid_grant");
            }
            let client_id = form.get("client_id").cloned().unwrap_or_default();
            (username.to_string(), client_id)
        }
        _ => return oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type"),
    };

    let scope = form
        .get("scope")
        .cloned()
        .unwrap_or_else(|| spec.default_scopes.join(" "));
    let now = chrono::Utc::now().timestamp();
    let expires_at = now + spec.token_expiry_secs as i64;

    let claims = Claims {
        iss: spec.issuer.clone(),
        sub: subject.clone(),
        aud: client_id.clone(),
        exp: expires_at,
        iat: now,
        scope: scope.clone(),
    };

    let token = match encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&signing_secret(spec, mock_id)),
    ) {
        Ok(t) => t,
        Err(e) => {
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("token encoding failed: {e}"),
            )
        }
    };

    state.oauth_tokens.insert(
        token.clone(),
        TokenRecord {
            client_id,
            username: subject,
            scope: scope.clone(),
            expires_at,
        },
    );

    json_response(
        StatusCode::OK,
        &json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": spec.token_expiry_secs,
            "scope": scope,
        }),
    )
}

fn discovery(spec: &OAuthSpec) -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "issuer": spec.issuer,
            "token_endpoint": format!("{}/token", spec.issuer),
            "introspection_endpoint": format!("{}/introspect", spec.issuer),
            "jwks_uri": format!("{}/jwks.json", spec.issuer),
            "grant_types_supported": ["client_credentials", "password"],
            "token_endpoint_auth_methods_supported": ["client_secret_post"],
        }),
    )
}

fn oauth_error(status: StatusCode, code: &str) -> Response<BoxBody> {
    json_response(status, &json!({"error": code}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn introspection_reports_active_and_expired() {
        let tokens = IssuedTokens::default();
        let now = chrono::Utc::now().timestamp();
        tokens.insert(
            "live".into(),
            TokenRecord {
                client_id: "app".into(),
                username: "app".into(),
                scope: "read".into(),
                expires_at: now + 60,
            },
        );
        tokens.insert(
            "stale".into(),
            TokenRecord {
                client_id: "app".into(),
                username: "app".into(),
                scope: "read".into(),
                expires_at: now - 60,
            },
        );

        assert_eq!(tokens.introspect("live")["active"], true);
        assert_eq!(tokens.introspect("stale")["active"], false);
        assert_eq!(tokens.introspect("unknown")["active"], false);
    }
}
