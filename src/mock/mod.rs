//! Unified mock model: one declaration pairing a matcher with a response
//! template for a single protocol.

mod types;
mod validator;

pub use types::*;
pub use validator::{validate_mock, validate_topic_filter, FieldError, ValidationError};
