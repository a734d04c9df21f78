//! Response shapes for the Admin API: RFC 7807 problem details with
//! field-level validation errors.

use crate::engine::body::{full, BoxBody};
use crate::mock::FieldError;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Machine-readable error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Conflict,
    CapacityExceeded,
    Unauthorized,
    InternalError,
    ChaosInjected,
}

impl ErrorKind {
    fn slug(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::ChaosInjected => "chaos_injected",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::CapacityExceeded => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ChaosInjected => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

/// Build a problem response.
pub fn problem(kind: ErrorKind, detail: impl Into<String>) -> Response<BoxBody> {
    problem_with_errors(kind, detail, Vec::new())
}

pub fn problem_with_errors(
    kind: ErrorKind,
    detail: impl Into<String>,
    errors: Vec<FieldError>,
) -> Response<BoxBody> {
    let status = kind.status();
    let body = Problem {
        type_uri: format!("https://mockd.dev/problems/{}", kind.slug()),
        title: kind.slug().replace('_', " "),
        status: status.as_u16(),
        detail: detail.into(),
        errors,
    };
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/problem+json")
        .body(full(payload))
        .expect("static response")
}

/// Plain JSON success response.
pub fn ok_json<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    crate::engine::handler::json_response(status, value)
}

/// Map an engine mutation error onto the admin error vocabulary.
pub fn from_engine_error(error: crate::engine::EngineError) -> Response<BoxBody> {
    use crate::engine::EngineError;
    use crate::registry::RegistryError;
    match error {
        EngineError::Validation(e) => {
            problem_with_errors(ErrorKind::ValidationError, e.to_string(), e.errors)
        }
        EngineError::Registry(RegistryError::NotFound(id)) => {
            problem(ErrorKind::NotFound, format!("mock {id} not found"))
        }
        EngineError::Registry(e @ RegistryError::AlreadyExists(_))
        | EngineError::Registry(e @ RegistryError::GrpcConflict { .. })
        | EngineError::Registry(e @ RegistryError::MqttConflict { .. }) => {
            problem(ErrorKind::Conflict, e.to_string())
        }
        EngineError::Bind(detail) => problem(ErrorKind::InternalError, detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_shape_is_rfc7807() {
        let response = problem(ErrorKind::NotFound, "mock x not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(ErrorKind::CapacityExceeded.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::ValidationError.status(), StatusCode::BAD_REQUEST);
    }
}
