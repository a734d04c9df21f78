//! A single stateful collection. One mutex per resource serializes all
//! mutations; readers copy out under the same lock so no torn reads are
//! possible.

use super::{
    PaginatedResponse, PaginationMeta, QueryFilter, ResourceConfig, ResourceInfo, ResourceItem,
    StatefulError,
};
use crate::matching::jsonpath;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;

/// Interior state: items in insertion order, ids unique.
#[derive(Default)]
pub struct ResourceInner {
    pub(crate) items: Vec<ResourceItem>,
}

impl ResourceInner {
    pub(crate) fn find(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.id == id)
    }
}

pub struct Resource {
    config: ResourceConfig,
    id_field: String,
    path_regex: Option<regex::Regex>,
    path_params: Vec<String>,
    /// Seed snapshot. Generated ids are persisted back here on first load so
    /// Reset() reuses them — deterministic ids across resets.
    seed: Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
    pub(crate) inner: Mutex<ResourceInner>,
}

impl Resource {
    pub fn new(mut config: ResourceConfig) -> Self {
        if config.id_field.is_empty() {
            config.id_field = "id".to_string();
        }
        let id_field = config.id_field.clone();
        let (path_regex, path_params) = compile_base_path(&config.base_path);
        let seed = config.seed_data.clone();
        Self {
            config,
            id_field,
            path_regex,
            path_params,
            seed: Mutex::new(seed),
            inner: Mutex::new(ResourceInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn parent_field(&self) -> &str {
        &self.config.parent_field
    }

    /// Materialize seed data. Generated ids are written back into the seed
    /// so resets reuse them, keeping ids deterministic across resets.
    pub fn load_seed(&self) -> Result<(), StatefulError> {
        let mut inner = self.inner.lock();
        let mut seeds = self.seed.lock();
        inner.items.clear();
        for (index, seed) in seeds.iter_mut().enumerate() {
            let item = self.item_from_json(seed.clone());
            if inner.find(&item.id).is_some() {
                return Err(StatefulError::Conflict {
                    resource: self.config.name.clone(),
                    id: format!("{} (seed index {index})", item.id),
                });
            }
            seed.insert(
                self.id_field.clone(),
                serde_json::Value::String(item.id.clone()),
            );
            inner.items.push(item);
        }
        Ok(())
    }

    fn item_from_json(&self, mut data: serde_json::Map<String, serde_json::Value>) -> ResourceItem {
        let id = match data.remove(&self.id_field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        data.remove("createdAt");
        data.remove("updatedAt");
        let now = chrono::Utc::now();
        ResourceItem {
            id,
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Match a request path. Returns (optional trailing item id, path params).
    pub fn match_path(&self, path: &str) -> Option<(Option<String>, HashMap<String, String>)> {
        let re = self.path_regex.as_ref()?;
        let caps = re.captures(path)?;

        let mut params = HashMap::new();
        for (i, name) in self.path_params.iter().enumerate() {
            if let Some(m) = caps.get(i + 1) {
                params.insert(name.clone(), m.as_str().to_string());
            }
        }
        let item_id = caps
            .get(self.path_params.len() + 1)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty());
        Some((item_id, params))
    }

    pub fn create(
        &self,
        data: serde_json::Map<String, serde_json::Value>,
        path_params: &HashMap<String, String>,
    ) -> Result<ResourceItem, StatefulError> {
        let mut inner = self.inner.lock();
        self.create_locked(&mut inner, data, path_params)
    }

    /// Create against an already-held guard; custom operations use this so
    /// multi-resource pipelines stay under their canonical locks.
    pub(crate) fn create_locked(
        &self,
        inner: &mut MutexGuard<'_, ResourceInner>,
        data: serde_json::Map<String, serde_json::Value>,
        path_params: &HashMap<String, String>,
    ) -> Result<ResourceItem, StatefulError> {
        if self.config.max_items > 0 && inner.items.len() >= self.config.max_items {
            return Err(StatefulError::Capacity {
                resource: self.config.name.clone(),
                max_items: self.config.max_items,
            });
        }

        let mut item = self.item_from_json(data);
        if inner.find(&item.id).is_some() {
            return Err(StatefulError::Conflict {
                resource: self.config.name.clone(),
                id: item.id,
            });
        }

        // Parent scope comes from the path for nested resources.
        if !self.config.parent_field.is_empty() {
            if let Some(parent_id) = path_params.get(&self.config.parent_field) {
                item.data.insert(
                    self.config.parent_field.clone(),
                    serde_json::Value::String(parent_id.clone()),
                );
            }
        }

        inner.items.push(item.clone());
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Option<ResourceItem> {
        let inner = self.inner.lock();
        inner.find(id).map(|i| inner.items[i].clone())
    }

    pub fn list(&self, filter: &QueryFilter) -> PaginatedResponse {
        let inner = self.inner.lock();
        self.list_locked(&inner, filter)
    }

    pub(crate) fn list_locked(
        &self,
        inner: &ResourceInner,
        filter: &QueryFilter,
    ) -> PaginatedResponse {
        let mut items: Vec<&ResourceItem> = inner
            .items
            .iter()
            .filter(|item| {
                if let Some(parent_id) = &filter.parent_id {
                    if !self.config.parent_field.is_empty() {
                        let matches = item
                            .data
                            .get(&self.config.parent_field)
                            .map(field_as_string)
                            .is_some_and(|v| &v == parent_id);
                        if !matches {
                            return false;
                        }
                    }
                }
                filter.filters.iter().all(|(field, expected)| {
                    item.data
                        .get(field)
                        .map(field_as_string)
                        .is_some_and(|v| &v == expected)
                })
            })
            .collect();

        if !filter.sort.is_empty() {
            items.sort_by(|a, b| {
                let av = a.data.get(&filter.sort);
                let bv = b.data.get(&filter.sort);
                let ord = compare_values(av, bv);
                if filter.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let total = items.len();
        let page: Vec<serde_json::Value> = items
            .into_iter()
            .skip(filter.offset)
            .take(if filter.limit == 0 { usize::MAX } else { filter.limit })
            .map(|item| item.to_json(&self.id_field))
            .collect();

        PaginatedResponse {
            meta: PaginationMeta {
                total,
                limit: filter.limit,
                offset: filter.offset,
                count: page.len(),
            },
            data: page,
        }
    }

    /// Update an item by merging the provided fields into the existing
    /// object, refreshing updatedAt. Fields not present in the update are
    /// preserved, so Update(r, id, delta) then Get(r, id) always yields the
    /// merge of the prior object and delta.
    pub fn update(
        &self,
        id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ResourceItem, StatefulError> {
        let mut inner = self.inner.lock();
        self.update_locked(&mut inner, id, data)
    }

    pub(crate) fn update_locked(
        &self,
        inner: &mut MutexGuard<'_, ResourceInner>,
        id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ResourceItem, StatefulError> {
        let index = inner.find(id).ok_or_else(|| StatefulError::NotFound {
            resource: self.config.name.clone(),
            id: id.to_string(),
        })?;

        let item = &mut inner.items[index];
        for (k, v) in data {
            if k == "createdAt" || k == "updatedAt" || k == self.id_field {
                continue;
            }
            item.data.insert(k, v);
        }
        item.updated_at = chrono::Utc::now();
        Ok(item.clone())
    }

    /// Idempotent delete.
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.find(id) {
            Some(index) => {
                inner.items.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn delete_locked(
        &self,
        inner: &mut MutexGuard<'_, ResourceInner>,
        id: &str,
    ) -> Result<(), StatefulError> {
        let index = inner.find(id).ok_or_else(|| StatefulError::NotFound {
            resource: self.config.name.clone(),
            id: id.to_string(),
        })?;
        inner.items.remove(index);
        Ok(())
    }

    /// Restore seed state.
    pub fn reset(&self) {
        // load_seed only fails on duplicate seed ids, which registration
        // already vetted.
        let _ = self.load_seed();
    }

    /// Drop every item without restoring seed. Returns the removed count.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.items.len();
        inner.items.clear();
        count
    }

    pub fn count(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            name: self.config.name.clone(),
            base_path: self.config.base_path.clone(),
            item_count: self.count(),
            seed_count: self.config.seed_data.len(),
            id_field: self.id_field.clone(),
            parent_field: self.config.parent_field.clone(),
            max_items: self.config.max_items,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Read helper for templates: `state.users.1.name`-style lookups.
    pub fn read_field(&self, id: &str, field_path: &str) -> Option<serde_json::Value> {
        let item = self.get(id)?;
        if field_path.is_empty() {
            return Some(item.to_json(&self.id_field));
        }
        let json = item.to_json(&self.id_field);
        jsonpath::extract_value(&json, field_path).cloned()
    }
}

fn field_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_values(
    a: Option<&serde_json::Value>,
    b: Option<&serde_json::Value>,
) -> std::cmp::Ordering {
    use serde_json::Value;
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Compile ":param" segments of a base path into a regex with an optional
/// trailing item-id capture.
fn compile_base_path(base_path: &str) -> (Option<regex::Regex>, Vec<String>) {
    if base_path.is_empty() {
        return (None, Vec::new());
    }

    let mut params = Vec::new();
    let mut pattern = String::from("^");
    for (i, segment) in base_path.split('/').enumerate() {
        if i > 0 {
            pattern.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            params.push(name.to_string());
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push_str("(?:/([^/]+))?$");

    (regex::Regex::new(&pattern).ok(), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource_with_seed() -> Resource {
        let r = Resource::new(
            serde_json::from_value(json!({
                "name": "books",
                "basePath": "/api/books",
                "seedData": [
                    {"id": "1", "title": "Dune", "year": 1965},
                    {"id": "2", "title": "Neuromancer", "year": 1984},
                    {"id": "3", "title": "Hyperion", "year": 1989}
                ]
            }))
            .unwrap(),
        );
        r.load_seed().unwrap();
        r
    }

    #[test]
    fn create_assigns_id_and_timestamps() {
        let r = resource_with_seed();
        let item = r
            .create(
                json!({"title": "Anathem"}).as_object().unwrap().clone(),
                &HashMap::new(),
            )
            .unwrap();
        assert!(!item.id.is_empty());
        let json = item.to_json("id");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());

        let fetched = r.get(&item.id).unwrap();
        assert_eq!(fetched.data["title"], "Anathem");
    }

    #[test]
    fn duplicate_id_conflicts() {
        let r = resource_with_seed();
        let err = r
            .create(
                json!({"id": "1", "title": "Dup"}).as_object().unwrap().clone(),
                &HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, StatefulError::Conflict { .. }));
    }

    #[test]
    fn capacity_enforced() {
        let r = Resource::new(
            serde_json::from_value(json!({"name": "tiny", "maxItems": 1})).unwrap(),
        );
        r.load_seed().unwrap();
        r.create(json!({"a": 1}).as_object().unwrap().clone(), &HashMap::new())
            .unwrap();
        let err = r
            .create(json!({"a": 2}).as_object().unwrap().clone(), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, StatefulError::Capacity { .. }));
    }

    #[test]
    fn update_merges_and_preserves_created_at() {
        let r = resource_with_seed();
        let before = r.get("1").unwrap();
        let updated = r
            .update("1", json!({"title": "Dune Messiah"}).as_object().unwrap().clone())
            .unwrap();
        assert_eq!(updated.created_at, before.created_at);
        assert_eq!(updated.data["title"], "Dune Messiah");
        // Update merges: unspecified fields survive.
        assert_eq!(updated.data["year"], 1965);
    }

    #[test]
    fn update_then_get_returns_merge_of_prior_and_delta() {
        let r = resource_with_seed();
        r.update("1", json!({"year": 1966}).as_object().unwrap().clone())
            .unwrap();
        let fetched = r.get("1").unwrap();
        assert_eq!(fetched.data["title"], "Dune");
        assert_eq!(fetched.data["year"], 1966);
    }

    #[test]
    fn delete_is_idempotent() {
        let r = resource_with_seed();
        assert!(r.delete("1"));
        assert!(!r.delete("1"));
        assert_eq!(r.count(), 2);
    }

    #[test]
    fn list_filters_sorts_paginates() {
        let r = resource_with_seed();

        let mut filter = QueryFilter {
            sort: "year".into(),
            descending: true,
            ..Default::default()
        };
        let listed = r.list(&filter);
        assert_eq!(listed.data[0]["title"], "Hyperion");
        assert_eq!(listed.meta.total, 3);

        filter.descending = false;
        filter.limit = 2;
        filter.offset = 1;
        let page = r.list(&filter);
        assert_eq!(page.meta.count, 2);
        assert_eq!(page.data[0]["title"], "Neuromancer");

        let filtered = r.list(&QueryFilter {
            filters: [("title".to_string(), "Dune".to_string())].into(),
            ..Default::default()
        });
        assert_eq!(filtered.meta.total, 1);
    }

    #[test]
    fn reset_restores_seed_ids_deterministically() {
        let r = Resource::new(
            serde_json::from_value(json!({
                "name": "gen",
                "seedData": [{"name": "no-id-seed"}]
            }))
            .unwrap(),
        );
        r.load_seed().unwrap();
        let first_id = r.list(&QueryFilter::default()).data[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        r.reset();
        let second_id = r.list(&QueryFilter::default()).data[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(first_id, second_id);
    }
}
