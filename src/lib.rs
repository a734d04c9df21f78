// Library exports: the binary, the integration tests, and embedding users
// all go through these modules.

// ===== Core stores and matching =====
pub mod chaos;
pub mod matching;
pub mod mock;
pub mod registry;
pub mod requestlog;
pub mod stateful;
pub mod template;
pub mod verify;

// ===== Engine, listeners, and protocol handlers =====
pub mod engine;
pub mod graphql;
pub mod grpc;
pub mod listener;
pub mod mqtt;
pub mod oauth;
pub mod soap;
pub mod sse;
pub mod websocket;

// ===== Surfaces =====
pub mod admin;
pub mod config;
pub mod metrics;
