//! The mock registry: single owner of all mock definitions.
//!
//! Writes (admin CRUD, config reload, bulk import) go through one write lock;
//! dispatch takes an immutable snapshot per request so matching never holds
//! the lock. A secondary protocol-indexed view keeps per-request filtering
//! cheap and preserves insertion order for deterministic tie-breaks.

use crate::mock::{Mock, MockSpec, MockType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Errors surfaced by registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("mock {0} not found")]
    NotFound(String),
    #[error("mock {0} already exists")]
    AlreadyExists(String),
    #[error("gRPC service {service}/{method} on port {port} already registered by mock {existing}")]
    GrpcConflict {
        port: u16,
        service: String,
        method: String,
        existing: String,
    },
    #[error("MQTT topic filter {topic:?} on port {port} already registered by mock {existing}")]
    MqttConflict {
        port: u16,
        topic: String,
        existing: String,
    },
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<Mock>>,
    /// Insertion-ordered ids per protocol; dispatch iterates these.
    by_protocol: HashMap<MockType, Vec<String>>,
    insertion_counter: u64,
    insertion_order: HashMap<String, u64>,
}

/// Concurrent mock registry.
#[derive(Default)]
pub struct MockRegistry {
    inner: RwLock<Inner>,
}

/// Result of a bulk import.
#[derive(Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub imported: usize,
    pub merged_into: Vec<String>,
    pub conflicts: Vec<String>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new mock. Fails on duplicate id or on a gRPC/MQTT
    /// service/topic collision with an already-registered mock.
    pub fn insert(&self, mock: Mock) -> Result<Arc<Mock>, RegistryError> {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&mock.id) {
            return Err(RegistryError::AlreadyExists(mock.id));
        }
        Self::check_merge_conflicts(&inner, &mock, None)?;

        let mock = Arc::new(mock);
        let id = mock.id.clone();
        let counter = inner.insertion_counter;
        inner.insertion_counter += 1;
        inner.insertion_order.insert(id.clone(), counter);
        inner
            .by_protocol
            .entry(mock.mock_type)
            .or_default()
            .push(id.clone());
        inner.by_id.insert(id, Arc::clone(&mock));
        Ok(mock)
    }

    /// Replace an existing mock in place, keeping its insertion slot so
    /// tie-break order is stable across updates.
    pub fn update(&self, mock: Mock) -> Result<Arc<Mock>, RegistryError> {
        let mut inner = self.inner.write();
        let existing = inner
            .by_id
            .get(&mock.id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(mock.id.clone()))?;
        Self::check_merge_conflicts(&inner, &mock, Some(&mock.id))?;

        if existing.mock_type != mock.mock_type {
            // Type changed: move between protocol indexes, slot at the end.
            let id = mock.id.clone();
            if let Some(ids) = inner.by_protocol.get_mut(&existing.mock_type) {
                ids.retain(|i| i != &id);
            }
            inner.by_protocol.entry(mock.mock_type).or_default().push(id);
        }
        let mock = Arc::new(mock);
        inner.by_id.insert(mock.id.clone(), Arc::clone(&mock));
        Ok(mock)
    }

    pub fn remove(&self, id: &str) -> Result<Arc<Mock>, RegistryError> {
        let mut inner = self.inner.write();
        let mock = inner
            .by_id
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if let Some(ids) = inner.by_protocol.get_mut(&mock.mock_type) {
            ids.retain(|i| i != id);
        }
        inner.insertion_order.remove(id);
        Ok(mock)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mock>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Snapshot of every mock in insertion order.
    pub fn all(&self) -> Vec<Arc<Mock>> {
        let inner = self.inner.read();
        let mut mocks: Vec<Arc<Mock>> = inner.by_id.values().cloned().collect();
        mocks.sort_by_key(|m| inner.insertion_order.get(&m.id).copied().unwrap_or(u64::MAX));
        mocks
    }

    /// Snapshot of the HTTP-family mocks (http + sse) in global insertion
    /// order; both kinds share the scored dispatch on the primary listener.
    pub fn snapshot_http_family(&self) -> Vec<Arc<Mock>> {
        let inner = self.inner.read();
        let mut mocks: Vec<Arc<Mock>> = inner
            .by_id
            .values()
            .filter(|m| matches!(m.mock_type, MockType::Http | MockType::Sse))
            .cloned()
            .collect();
        mocks.sort_by_key(|m| inner.insertion_order.get(&m.id).copied().unwrap_or(u64::MAX));
        mocks
    }

    /// Snapshot of one protocol's mocks in insertion order. Dispatch calls
    /// this once per request and matches lock-free against the clone.
    pub fn snapshot(&self, protocol: MockType) -> Vec<Arc<Mock>> {
        let inner = self.inner.read();
        inner
            .by_protocol
            .get(&protocol)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggle the enabled flag, returning the new state.
    pub fn toggle(&self, id: &str) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write();
        let mock = inner
            .by_id
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let mut updated = (**mock).clone();
        updated.enabled = !updated.enabled;
        updated.updated_at = Some(chrono::Utc::now());
        let enabled = updated.enabled;
        inner.by_id.insert(id.to_string(), Arc::new(updated));
        Ok(enabled)
    }

    /// Bulk import: each mock inserted under the single write lock taken once.
    /// gRPC/MQTT mocks whose port is already served merge into the existing
    /// listener registry; set-level collisions are reported, not applied.
    pub fn import(&self, mocks: Vec<Mock>) -> ImportOutcome {
        let mut outcome = ImportOutcome::default();
        for mock in mocks {
            let id = mock.id.clone();
            let merged = self.merge_target(&mock);
            match self.insert(mock) {
                Ok(_) => {
                    outcome.imported += 1;
                    if let Some(target) = merged {
                        outcome.merged_into.push(target);
                    }
                }
                Err(e) => outcome.conflicts.push(format!("{id}: {e}")),
            }
        }
        outcome
    }

    /// Remove every mock; returns the removed set for snapshotting.
    pub fn clear(&self) -> Vec<Arc<Mock>> {
        let mut inner = self.inner.write();
        let mocks: Vec<Arc<Mock>> = inner.by_id.values().cloned().collect();
        inner.by_id.clear();
        inner.by_protocol.clear();
        inner.insertion_order.clear();
        mocks
    }

    /// How many same-protocol mocks (this one included, once inserted) share
    /// the gRPC/MQTT port of the given mock. Zero for port-less protocols.
    pub fn port_peer_count(&self, mock: &Mock) -> usize {
        let inner = self.inner.read();
        match &mock.spec {
            MockSpec::Grpc(spec) => inner
                .by_id
                .values()
                .filter(|m| matches!(&m.spec, MockSpec::Grpc(other) if other.port == spec.port))
                .count(),
            MockSpec::Mqtt(spec) => inner
                .by_id
                .values()
                .filter(|m| matches!(&m.spec, MockSpec::Mqtt(other) if other.port == spec.port))
                .count(),
            _ => 0,
        }
    }

    /// The mock id whose gRPC/MQTT port this mock would merge into, if any.
    pub fn merge_target(&self, mock: &Mock) -> Option<String> {
        let inner = self.inner.read();
        match &mock.spec {
            MockSpec::Grpc(spec) => inner.by_id.values().find_map(|m| match &m.spec {
                MockSpec::Grpc(existing) if existing.port == spec.port && m.id != mock.id => {
                    Some(m.id.clone())
                }
                _ => None,
            }),
            MockSpec::Mqtt(spec) => inner.by_id.values().find_map(|m| match &m.spec {
                MockSpec::Mqtt(existing) if existing.port == spec.port && m.id != mock.id => {
                    Some(m.id.clone())
                }
                _ => None,
            }),
            _ => None,
        }
    }

    /// Reject exact protocol+port+service+method (gRPC) or
    /// protocol+port+topic-filter (MQTT) collisions.
    fn check_merge_conflicts(
        inner: &Inner,
        mock: &Mock,
        ignore_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        match &mock.spec {
            MockSpec::Grpc(spec) => {
                for existing in inner.by_id.values() {
                    if Some(existing.id.as_str()) == ignore_id {
                        continue;
                    }
                    let MockSpec::Grpc(other) = &existing.spec else {
                        continue;
                    };
                    if other.port != spec.port {
                        continue;
                    }
                    for (service, svc_cfg) in &spec.services {
                        if let Some(other_svc) = other.services.get(service) {
                            for method in svc_cfg.methods.keys() {
                                if other_svc.methods.contains_key(method) {
                                    return Err(RegistryError::GrpcConflict {
                                        port: spec.port,
                                        service: service.clone(),
                                        method: method.clone(),
                                        existing: existing.id.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
            MockSpec::Mqtt(spec) => {
                for existing in inner.by_id.values() {
                    if Some(existing.id.as_str()) == ignore_id {
                        continue;
                    }
                    let MockSpec::Mqtt(other) = &existing.spec else {
                        continue;
                    };
                    if other.port != spec.port {
                        continue;
                    }
                    for topic in &spec.topics {
                        if other.topics.iter().any(|t| t.topic == topic.topic) {
                            return Err(RegistryError::MqttConflict {
                                port: spec.port,
                                topic: topic.topic.clone(),
                                existing: existing.id.clone(),
                            });
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_mock(id: &str, path: &str) -> Mock {
        serde_json::from_value(json!({
            "id": id,
            "type": "http",
            "http": {
                "matcher": {"method": "GET", "path": path},
                "response": {"statusCode": 200, "body": "ok"}
            }
        }))
        .unwrap()
    }

    fn grpc_mock(id: &str, port: u16, service: &str, method: &str) -> Mock {
        serde_json::from_value(json!({
            "id": id,
            "type": "grpc",
            "grpc": {
                "port": port,
                "services": {service: {"methods": {method: {"response": {}}}}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn insert_get_remove() {
        let reg = MockRegistry::new();
        reg.insert(http_mock("a", "/a")).unwrap();
        assert!(reg.get("a").is_some());
        reg.remove("a").unwrap();
        assert!(reg.get("a").is_none());
        assert!(matches!(reg.remove("a"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn duplicate_id_rejected() {
        let reg = MockRegistry::new();
        reg.insert(http_mock("a", "/a")).unwrap();
        assert!(matches!(
            reg.insert(http_mock("a", "/b")),
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let reg = MockRegistry::new();
        for i in 0..5 {
            reg.insert(http_mock(&format!("m{i}"), "/x")).unwrap();
        }
        let snap = reg.snapshot(MockType::Http);
        let ids: Vec<&str> = snap.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn update_keeps_insertion_slot() {
        let reg = MockRegistry::new();
        reg.insert(http_mock("first", "/a")).unwrap();
        reg.insert(http_mock("second", "/b")).unwrap();
        reg.update(http_mock("first", "/changed")).unwrap();
        let snap = reg.snapshot(MockType::Http);
        assert_eq!(snap[0].id, "first");
        assert_eq!(snap[0].display_path(), "/changed");
    }

    #[test]
    fn grpc_same_port_different_service_merges() {
        let reg = MockRegistry::new();
        let first = grpc_mock("g1", 50051, "svcA", "Foo");
        reg.insert(first).unwrap();

        let second = grpc_mock("g2", 50051, "svcB", "Bar");
        assert_eq!(reg.merge_target(&second), Some("g1".to_string()));
        let stored = reg.insert(second).unwrap();
        // Two mocks now share the port; an unrelated port counts alone.
        assert_eq!(reg.port_peer_count(&stored), 2);
        let other_port = grpc_mock("g9", 50052, "svcC", "Baz");
        reg.insert(other_port.clone()).unwrap();
        assert_eq!(reg.port_peer_count(&other_port), 1);

        // Same service+method on the same port conflicts.
        let dup = grpc_mock("g3", 50051, "svcA", "Foo");
        assert!(matches!(
            reg.insert(dup),
            Err(RegistryError::GrpcConflict { .. })
        ));
    }

    #[test]
    fn mqtt_same_topic_conflicts() {
        let reg = MockRegistry::new();
        let m1: Mock = serde_json::from_value(json!({
            "id": "b1", "type": "mqtt",
            "mqtt": {"port": 1883, "topics": [{"topic": "devices/status"}]}
        }))
        .unwrap();
        let m2: Mock = serde_json::from_value(json!({
            "id": "b2", "type": "mqtt",
            "mqtt": {"port": 1883, "topics": [{"topic": "devices/status"}]}
        }))
        .unwrap();
        reg.insert(m1).unwrap();
        assert!(matches!(
            reg.insert(m2),
            Err(RegistryError::MqttConflict { .. })
        ));
    }

    #[test]
    fn import_reports_merges_and_conflicts() {
        let reg = MockRegistry::new();
        let outcome = reg.import(vec![
            grpc_mock("g1", 50051, "svcA", "Foo"),
            grpc_mock("g2", 50051, "svcB", "Bar"),
            grpc_mock("g3", 50051, "svcA", "Foo"),
        ]);
        assert_eq!(outcome.imported, 2);
        assert_eq!(outcome.merged_into, vec!["g1".to_string()]);
        assert_eq!(outcome.conflicts.len(), 1);
        assert!(outcome.conflicts[0].contains("g1"));
    }

    #[test]
    fn toggle_flips_enabled() {
        let reg = MockRegistry::new();
        reg.insert(http_mock("a", "/a")).unwrap();
        assert!(!reg.toggle("a").unwrap());
        assert!(reg.toggle("a").unwrap());
    }
}
