//! Configuration document loading.
//!
//! A versioned YAML or JSON document declares mocks, stateful resources,
//! custom operations, chaos, auth, and server options. Environment variables
//! override the server options; the admin API can export the effective
//! document back out, and load(export(load(x))) is stable.

use crate::chaos::ChaosConfig;
use crate::mock::Mock;
use crate::stateful::{CustomOperation, ResourceConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Server options, separate from the declarative mock set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    pub port: u16,
    pub admin_port: u16,
    /// 0 disables the HTTPS listener.
    pub https_port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_log_entries: usize,
    pub cors_origins: Vec<String>,
    /// Admin API rate limit in requests/second; 0 disables.
    pub rate_limit: u32,
    /// TLS material for the HTTPS listener; generated when absent.
    pub tls_cert_file: String,
    pub tls_key_file: String,
    /// Request client certificates and surface their subject to matchers.
    pub mtls: bool,
    /// Write the effective config back out on shutdown.
    pub snapshot_on_exit: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4280,
            admin_port: 4290,
            https_port: 0,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_log_entries: 1000,
            cors_origins: Vec::new(),
            rate_limit: 0,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            mtls: false,
            snapshot_on_exit: String::new(),
        }
    }
}

/// Admin auth settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Explicit key; generated and persisted when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mocks: Vec<Mock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_resources: Vec<ResourceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_operations: Vec<CustomOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosConfig>,
    #[serde(flatten)]
    pub server: ServerOptions,
}

impl ConfigDocument {
    /// Load a document from a YAML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        Self::parse(&raw)
    }

    /// Parse from a string; JSON documents are valid YAML, so one decoder
    /// handles both formats.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut doc: ConfigDocument = serde_yaml::from_str(raw)?;
        doc.apply_env();
        for mock in &mut doc.mocks {
            mock.normalize();
        }
        Ok(doc)
    }

    /// Apply `MOCKD_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_parse("MOCKD_PORT") {
            self.server.port = port;
        }
        if let Some(port) = env_parse("MOCKD_ADMIN_PORT") {
            self.server.admin_port = port;
        }
        if let Some(port) = env_parse("MOCKD_HTTPS_PORT") {
            self.server.https_port = port;
        }
        if let Some(secs) = env_parse("MOCKD_READ_TIMEOUT") {
            self.server.read_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("MOCKD_WRITE_TIMEOUT") {
            self.server.write_timeout_secs = secs;
        }
        if let Some(n) = env_parse("MOCKD_MAX_LOG_ENTRIES") {
            self.server.max_log_entries = n;
        }
        if let Ok(workspace) = std::env::var("MOCKD_WORKSPACE") {
            for mock in &mut self.mocks {
                if mock.workspace.is_empty() {
                    mock.workspace = workspace.clone();
                }
            }
        }
    }

    /// Serialize the document as YAML for export/snapshot.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1"
port: 4280
adminPort: 4290
maxLogEntries: 500
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
  - type: http
    http:
      matcher:
        path: /inferred
      response:
        statusCode: 204
statefulResources:
  - name: users
    basePath: /api/users
    seedData:
      - id: "1"
        name: Alice
customOperations:
  - name: Noop
    steps:
      - type: set
        var: ok
        value: "true"
chaos:
  enabled: false
"#;

    #[test]
    fn yaml_document_loads() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        assert_eq!(doc.server.port, 4280);
        assert_eq!(doc.server.max_log_entries, 500);
        assert_eq!(doc.mocks.len(), 2);
        assert_eq!(doc.stateful_resources[0].name, "users");
        assert_eq!(doc.custom_operations[0].name, "Noop");
    }

    #[test]
    fn omitted_id_and_type_are_filled() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        let inferred = &doc.mocks[1];
        assert!(inferred.id.starts_with("mock-"));
        assert_eq!(inferred.mock_type, crate::mock::MockType::Http);
    }

    #[test]
    fn json_document_loads_too() {
        let json = r#"{"port": 9999, "mocks": [
            {"id": "m", "type": "http",
             "http": {"matcher": {"path": "/x"}, "response": {"statusCode": 200, "body": "ok"}}}
        ]}"#;
        let doc = ConfigDocument::parse(json).unwrap();
        assert_eq!(doc.server.port, 9999);
        assert_eq!(doc.mocks[0].id, "m");
    }

    #[test]
    fn export_round_trips() {
        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        let yaml = doc.to_yaml().unwrap();
        let again = ConfigDocument::parse(&yaml).unwrap();
        assert_eq!(again.mocks.len(), doc.mocks.len());
        assert_eq!(again.mocks[0].id, "hello");
        assert_eq!(again.server.max_log_entries, doc.server.max_log_entries);
        assert_eq!(again.stateful_resources.len(), 1);
    }
}
