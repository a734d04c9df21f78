//! Stateful resource store: named CRUD collections backed by in-memory
//! state with seed and reset semantics.

mod executor;
mod resource;

pub use executor::{CustomOperation, ExprValue, OperationStep, StepKind};
pub use resource::{Resource, ResourceInner};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Errors surfaced by stateful operations.
#[derive(Debug, thiserror::Error)]
pub enum StatefulError {
    #[error("resource {0} not found")]
    ResourceNotFound(String),
    #[error("item {id} not found in {resource}")]
    NotFound { resource: String, id: String },
    #[error("item {id} already exists in {resource}")]
    Conflict { resource: String, id: String },
    #[error("resource {resource} is at capacity ({max_items} items)")]
    Capacity { resource: String, max_items: usize },
    #[error("operation {operation} not found")]
    OperationNotFound { operation: String },
    #[error("step {step} ({kind}) failed: {message}")]
    StepFailed {
        step: usize,
        kind: String,
        message: String,
    },
}

/// Declarative resource definition from the config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub name: String,
    /// HTTP base path, e.g. "/api/users" or "/api/users/:userId/posts".
    /// Empty means the resource is only reachable through operations.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id_field: String,
    /// For nested resources: the path param carrying the parent id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_field: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_items: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed_data: Vec<serde_json::Map<String, serde_json::Value>>,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

/// One object in a collection. System fields live outside `data` and are
/// merged in on serialization.
#[derive(Debug, Clone)]
pub struct ResourceItem {
    pub id: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ResourceItem {
    /// Flatten into the wire shape: data + id field + timestamps.
    pub fn to_json(&self, id_field: &str) -> serde_json::Value {
        let mut map = self.data.clone();
        map.insert(id_field.to_string(), serde_json::Value::String(self.id.clone()));
        map.insert(
            "createdAt".to_string(),
            serde_json::Value::String(self.created_at.to_rfc3339()),
        );
        map.insert(
            "updatedAt".to_string(),
            serde_json::Value::String(self.updated_at.to_rfc3339()),
        );
        serde_json::Value::Object(map)
    }
}

/// List query: field filters, sort, pagination, optional parent scope.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub filters: HashMap<String, String>,
    pub sort: String,
    pub descending: bool,
    pub limit: usize,
    pub offset: usize,
    pub parent_id: Option<String>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            filters: HashMap::new(),
            sort: String::new(),
            descending: false,
            limit: 100,
            offset: 0,
            parent_id: None,
        }
    }
}

/// Paginated list response.
#[derive(Debug, Clone, Serialize)]
pub struct PaginatedResponse {
    pub data: Vec<serde_json::Value>,
    pub meta: PaginationMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginationMeta {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub count: usize,
}

/// Summary shape for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_path: String,
    pub item_count: usize,
    pub seed_count: usize,
    pub id_field: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_field: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_items: usize,
}

/// Store of all stateful resources and custom operations.
#[derive(Default)]
pub struct StateStore {
    resources: RwLock<HashMap<String, Arc<Resource>>>,
    operations: RwLock<HashMap<String, CustomOperation>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource and materialize its seed data.
    pub fn register(&self, config: ResourceConfig) -> Result<Arc<Resource>, StatefulError> {
        let resource = Arc::new(Resource::new(config));
        resource.load_seed()?;
        self.resources
            .write()
            .insert(resource.name().to_string(), Arc::clone(&resource));
        Ok(resource)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.read().get(name).cloned()
    }

    pub fn infos(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> =
            self.resources.read().values().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn remove(&self, name: &str) -> bool {
        self.resources.write().remove(name).is_some()
    }

    /// Restore seed state for one resource, or all of them.
    pub fn reset(&self, name: Option<&str>) -> Result<(), StatefulError> {
        match name {
            Some(name) => {
                let resource = self
                    .get(name)
                    .ok_or_else(|| StatefulError::ResourceNotFound(name.to_string()))?;
                resource.reset();
                Ok(())
            }
            None => {
                for resource in self.resources.read().values() {
                    resource.reset();
                }
                Ok(())
            }
        }
    }

    /// Route an HTTP path to the resource serving it.
    /// Returns (resource, optional item id, path params).
    pub fn match_path(
        &self,
        path: &str,
    ) -> Option<(Arc<Resource>, Option<String>, HashMap<String, String>)> {
        for resource in self.resources.read().values() {
            if let Some((item_id, params)) = resource.match_path(path) {
                return Some((Arc::clone(resource), item_id, params));
            }
        }
        None
    }

    pub fn register_operation(&self, op: CustomOperation) {
        self.operations.write().insert(op.name.clone(), op);
    }

    pub fn operation(&self, name: &str) -> Option<CustomOperation> {
        self.operations.read().get(name).cloned()
    }

    pub fn operations(&self) -> Vec<CustomOperation> {
        let mut ops: Vec<CustomOperation> = self.operations.read().values().cloned().collect();
        ops.sort_by(|a, b| a.name.cmp(&b.name));
        ops
    }

    /// Execute a named custom operation with the given input payload.
    /// All involved resources stay locked for the duration; see `executor`.
    pub fn execute_operation(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, StatefulError> {
        let op = self
            .operation(name)
            .ok_or_else(|| StatefulError::OperationNotFound {
                operation: name.to_string(),
            })?;
        executor::execute(self, &op, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users_config() -> ResourceConfig {
        serde_json::from_value(json!({
            "name": "users",
            "basePath": "/api/users",
            "idField": "id",
            "seedData": [{"id": "1", "name": "Alice"}]
        }))
        .unwrap()
    }

    #[test]
    fn seed_materializes_on_register() {
        let store = StateStore::new();
        let users = store.register(users_config()).unwrap();
        let listed = users.list(&QueryFilter::default());
        assert_eq!(listed.meta.total, 1);
        assert_eq!(listed.data[0]["name"], "Alice");
        assert_eq!(listed.data[0]["id"], "1");
    }

    #[test]
    fn create_then_reset_restores_seed() {
        let store = StateStore::new();
        let users = store.register(users_config()).unwrap();

        let bob = users
            .create(
                json!({"name": "Bob"}).as_object().unwrap().clone(),
                &HashMap::new(),
            )
            .unwrap();
        assert!(!bob.id.is_empty());
        assert_eq!(users.count(), 2);

        store.reset(Some("users")).unwrap();
        let listed = users.list(&QueryFilter::default());
        assert_eq!(listed.meta.total, 1);
        assert_eq!(listed.data[0]["name"], "Alice");
    }

    #[test]
    fn reset_unknown_resource_errors() {
        let store = StateStore::new();
        assert!(matches!(
            store.reset(Some("ghost")),
            Err(StatefulError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn path_routing_extracts_item_id() {
        let store = StateStore::new();
        store.register(users_config()).unwrap();

        let (resource, item_id, _) = store.match_path("/api/users/42").unwrap();
        assert_eq!(resource.name(), "users");
        assert_eq!(item_id.as_deref(), Some("42"));

        let (_, item_id, _) = store.match_path("/api/users").unwrap();
        assert!(item_id.is_none());

        assert!(store.match_path("/api/other").is_none());
    }

    #[test]
    fn nested_path_params_captured() {
        let store = StateStore::new();
        store
            .register(
                serde_json::from_value(json!({
                    "name": "posts",
                    "basePath": "/api/users/:userId/posts",
                    "parentField": "userId"
                }))
                .unwrap(),
            )
            .unwrap();

        let (_, item_id, params) = store.match_path("/api/users/7/posts/99").unwrap();
        assert_eq!(params.get("userId").map(String::as_str), Some("7"));
        assert_eq!(item_id.as_deref(), Some("99"));
    }
}
