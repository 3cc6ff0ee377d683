//! Normalized storage of entities and their views.
//!
//! Values are keyed by the name of the type they were stored as and by their id. An entity value always takes
//! precedence over a view value of the same id: when a view is written while the entity is known, the view's fields
//! are merged into the entity and every view value of that entity type is purged. Reads of a view then resolve to the
//! merged entity.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde_json::Map;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::EntityConfig;
use crate::error::CacheError;
use crate::error::Result;
use crate::identity::Identified;
use crate::types::Id;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StoreKey {
    kind: String,
    id:   Id,
}

impl StoreKey {
    fn new(kind: &str, id: &Id) -> Self {
        Self {
            kind: kind.to_string(),
            id:   id.clone(),
        }
    }
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A value together with the moment it was written.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub value:     Identified,
    pub timestamp: Instant,
}

impl StoredValue {
    pub fn new(value: Identified) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
        }
    }
}

/// Whether a value written at `timestamp` is stale under the TTL of `entity`.
pub fn has_expired(entity: &EntityConfig, timestamp: Instant) -> bool {
    i128::try_from(timestamp.elapsed().as_millis()).unwrap_or(i128::MAX) > i128::from(entity.ttl()) * 1000
}

/// Merge `source` into `destination`, producing a new value shaped exactly like `destination`.
///
/// Only the keys `destination` already has are considered. A key gets the source's value unless both sides hold an
/// object there, in which case they are merged recursively. If either argument is not an object the source wins.
pub fn merge(source: &Value, destination: &Value) -> Value {
    let (Value::Object(src), Value::Object(dst)) = (source, destination)
    else {
        return source.clone();
    };

    let merged = dst
        .iter()
        .map(|(key, dst_value)| {
            let value = match (src.get(key), dst_value) {
                (Some(src_value @ Value::Object(_)), Value::Object(_)) => merge(src_value, dst_value),
                (Some(src_value), _) => src_value.clone(),
                (None, _) => dst_value.clone(),
            };
            (key.clone(), value)
        })
        .collect::<Map<String, Value>>();

    Value::Object(merged)
}

/// Stored state of a single id, taken before an optimistic write.
pub(crate) struct Snapshot {
    entries: Vec<(StoreKey, Option<Arc<StoredValue>>)>,
}

pub struct EntityStore {
    /// Entity type name into the names of its views.
    index: HashMap<String, Vec<String>>,

    values: Cache<StoreKey, Arc<StoredValue>>,

    // Serializes read-modify-write sequences. Plain reads don't take it.
    write_lock: Mutex<()>,
}

impl EntityStore {
    pub fn new<'a>(entities: impl IntoIterator<Item = &'a EntityConfig>, max_capacity: Option<u64>) -> Self {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for entity in entities {
            if let Some(parent) = entity.view_of() {
                index.entry(parent.clone()).or_default().push(entity.name().clone());
            }
        }

        let mut builder = Cache::builder()
            .name("entity store")
            .eviction_policy(EvictionPolicy::tiny_lfu());
        if let Some(capacity) = max_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            index,
            values: builder.build(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn views_of(&self, entity_type: &str) -> &[String] {
        self.index.get(entity_type).map_or(&[], |views| views.as_slice())
    }

    fn check_id(entity: &EntityConfig, value: &Identified) -> Result<()> {
        if value.id.is_empty() {
            return Err(CacheError::MissingId {
                entity: entity.name().clone(),
            });
        }
        Ok(())
    }

    // Must be called with the write lock held.
    fn purge_views(&self, entity_type: &str) {
        for view in self.views_of(entity_type) {
            let keys = self
                .values
                .iter()
                .filter(|(key, _)| &key.kind == view)
                .map(|(key, _)| key)
                .collect::<Vec<_>>();
            if !keys.is_empty() {
                log::trace!("Purging {} value(s) of view '{view}'", keys.len());
            }
            for key in keys {
                self.values.invalidate(key.as_ref());
            }
        }
    }

    pub fn put(&self, entity: &EntityConfig, value: Identified) -> Result<()> {
        Self::check_id(entity, &value)?;

        let Some(parent) = entity.view_of()
        else {
            self.values
                .insert(StoreKey::new(entity.name(), &value.id), Arc::new(StoredValue::new(value)));
            return Ok(());
        };

        let _guard = self.write_lock.lock();
        let entity_key = StoreKey::new(parent, &value.id);
        if let Some(existing) = self.values.get(&entity_key) {
            let merged = merge(&value.item, &existing.value.item);
            log::trace!("View '{}' merged into {entity_key}", entity.name());
            self.values.insert(
                entity_key,
                Arc::new(StoredValue::new(Identified::new(value.id, merged))),
            );
            self.purge_views(parent);
        }
        else {
            self.values
                .insert(StoreKey::new(entity.name(), &value.id), Arc::new(StoredValue::new(value)));
        }
        Ok(())
    }

    pub fn m_put(&self, entity: &EntityConfig, values: Vec<Identified>) -> Result<()> {
        // Validate all first so a bad element doesn't leave a half-written batch behind.
        for value in &values {
            Self::check_id(entity, value)?;
        }
        for value in values {
            self.put(entity, value)?;
        }
        Ok(())
    }

    pub fn get(&self, entity: &EntityConfig, id: &Id) -> Option<Arc<StoredValue>> {
        match entity.view_of() {
            Some(parent) => self
                .values
                .get(&StoreKey::new(parent, id))
                .or_else(|| self.values.get(&StoreKey::new(entity.name(), id))),
            None => self.values.get(&StoreKey::new(entity.name(), id)),
        }
    }

    pub fn contains(&self, entity: &EntityConfig, id: &Id) -> bool {
        self.get(entity, id).is_some()
    }

    /// Remove an entity and purge every view value of its type. Returns the bare removed value, if there was one.
    pub fn remove(&self, entity: &EntityConfig, id: &Id) -> Option<Value> {
        let entity_type = entity.entity_type();
        let _guard = self.write_lock.lock();
        let removed = self.values.remove(&StoreKey::new(entity_type, id));
        self.purge_views(entity_type);
        removed.map(|stored| stored.value.item.clone())
    }

    /// Record what is currently stored for `id` under the entity's own key and, for a view, under its parent's key.
    pub(crate) fn snapshot(&self, entity: &EntityConfig, id: &Id) -> Snapshot {
        let mut keys = vec![StoreKey::new(entity.name(), id)];
        if let Some(parent) = entity.view_of() {
            keys.push(StoreKey::new(parent, id));
        }
        Snapshot {
            entries: keys
                .into_iter()
                .map(|key| {
                    let stored = self.values.get(&key);
                    (key, stored)
                })
                .collect(),
        }
    }

    /// Put back the values of a snapshot exactly as they were, timestamps included. View values purged in between
    /// are not brought back.
    pub(crate) fn restore(&self, snapshot: Snapshot) {
        let _guard = self.write_lock.lock();
        for (key, stored) in snapshot.entries {
            log::trace!("Restoring {key}");
            match stored {
                Some(stored) => self.values.insert(key, stored),
                None => self.values.invalidate(&key),
            }
        }
    }

    pub fn clear(&self) {
        self.values.invalidate_all();
        self.values.run_pending_tasks();
    }

    /// Apply evictions and invalidations moka has queued so far.
    pub fn run_pending_tasks(&self) {
        self.values.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> EntityConfig {
        EntityConfig::builder().name("user").build().unwrap()
    }

    fn mini_user() -> EntityConfig {
        EntityConfig::builder().name("mini_user").view_of("user").build().unwrap()
    }

    fn store() -> EntityStore {
        EntityStore::new(&[user(), mini_user()], None)
    }

    fn item(id: i64, value: Value) -> Identified {
        Identified::new(Id::from(id), value)
    }

    #[test]
    fn merge_keeps_destination_shape() {
        let destination = json!({"id": 1, "name": "Kalle", "address": {"city": "Lund", "zip": "222"}, "tags": [1]});
        let source = json!({"name": "Karl", "extra": true, "address": {"city": "Malmö", "street": "X"}, "tags": []});
        let merged = merge(&source, &destination);
        assert_eq!(
            merged,
            json!({"id": 1, "name": "Karl", "address": {"city": "Malmö", "zip": "222"}, "tags": []})
        );

        let keys = |v: &Value| v.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys(&merged), keys(&destination));
    }

    #[test]
    fn merge_null_and_non_objects() {
        assert_eq!(merge(&json!({"a": null}), &json!({"a": {"b": 1}})), json!({"a": null}));
        assert_eq!(merge(&json!({"a": {"b": 2}}), &json!({"a": 1})), json!({"a": {"b": 2}}));
        assert_eq!(merge(&json!(5), &json!({"a": 1})), json!(5));
    }

    #[test]
    fn entity_put_get_remove() {
        let store = store();
        let user = user();
        store.put(&user, item(1, json!({"id": 1, "name": "Kalle"}))).unwrap();
        assert!(store.contains(&user, &Id::from(1)));
        assert_eq!(store.get(&user, &Id::from(1)).unwrap().value.item["name"], "Kalle");

        assert_eq!(store.remove(&user, &Id::from(1)), Some(json!({"id": 1, "name": "Kalle"})));
        assert!(!store.contains(&user, &Id::from(1)));
        assert_eq!(store.remove(&user, &Id::from(1)), None);
    }

    #[test]
    fn rejects_empty_id() {
        let store = store();
        let err = store.put(&user(), Identified::new(Id::from(""), json!({}))).unwrap_err();
        assert!(matches!(err, CacheError::MissingId { .. }));
    }

    #[test]
    fn view_without_entity_is_stored_as_view() {
        let store = store();
        let (user, mini) = (user(), mini_user());
        store.put(&mini, item(1, json!({"id": 1, "name": "Kalle"}))).unwrap();
        assert!(store.contains(&mini, &Id::from(1)));
        assert!(!store.contains(&user, &Id::from(1)));
    }

    #[test]
    fn view_merges_into_entity() {
        let store = store();
        let (user, mini) = (user(), mini_user());
        let full = json!({"id": 1, "name": "Kalle", "email": "kalle@example.com"});
        let view = json!({"id": 1, "name": "Karl"});
        store.put(&user, item(1, full.clone())).unwrap();
        store.put(&mini, item(1, view.clone())).unwrap();

        let expected = merge(&view, &full);
        assert_eq!(store.get(&mini, &Id::from(1)).unwrap().value.item, expected);
        assert_eq!(store.get(&user, &Id::from(1)).unwrap().value.item, expected);
    }

    #[test]
    fn entity_write_purges_stale_views_on_merge() {
        let store = store();
        let (user, mini) = (user(), mini_user());
        store.put(&mini, item(2, json!({"id": 2, "name": "Anka"}))).unwrap();
        store.put(&user, item(1, json!({"id": 1, "name": "Kalle"}))).unwrap();
        // A view write for 1 merges into the entity and purges every view value of the type, 2 included.
        store.put(&mini, item(1, json!({"id": 1, "name": "Karl"}))).unwrap();
        assert!(!store.contains(&mini, &Id::from(2)));
        assert!(store.contains(&mini, &Id::from(1)));
    }

    #[test]
    fn remove_cascades_to_views() {
        let store = store();
        let (user, mini) = (user(), mini_user());
        store.put(&mini, item(3, json!({"id": 3}))).unwrap();
        store.put(&user, item(1, json!({"id": 1}))).unwrap();
        store.remove(&user, &Id::from(1));
        assert!(!store.contains(&mini, &Id::from(3)));
    }

    #[test]
    fn unknown_parent_is_harmless() {
        let orphan = EntityConfig::builder().name("orphan").view_of("ghost").build().unwrap();
        let store = EntityStore::new(&[orphan.clone()], None);
        store.put(&orphan, item(1, json!({"id": 1}))).unwrap();
        assert!(store.contains(&orphan, &Id::from(1)));
        assert_eq!(store.remove(&orphan, &Id::from(1)), None);
    }

    #[test]
    fn snapshot_restores_both_keys() {
        let store = store();
        let (user, mini) = (user(), mini_user());
        store.put(&user, item(1, json!({"id": 1, "name": "Kalle"}))).unwrap();
        let before = store.get(&user, &Id::from(1)).unwrap();

        let snapshot = store.snapshot(&mini, &Id::from(1));
        store.put(&mini, item(1, json!({"id": 1, "name": "Karl"}))).unwrap();
        store.put(&mini, item(2, json!({"id": 2, "name": "Anka"}))).unwrap();
        store.restore(snapshot);

        let after = store.get(&user, &Id::from(1)).unwrap();
        assert_eq!(after.value.item["name"], "Kalle");
        assert_eq!(after.timestamp, before.timestamp);
        assert!(store.contains(&mini, &Id::from(2)));

        let snapshot = store.snapshot(&user, &Id::from(5));
        store.put(&user, item(5, json!({"id": 5}))).unwrap();
        store.restore(snapshot);
        assert!(!store.contains(&user, &Id::from(5)));
    }

    #[test]
    fn clear_is_immediate() {
        let store = store();
        let user = user();
        store.m_put(&user, vec![item(1, json!({"id": 1})), item(2, json!({"id": 2}))]).unwrap();
        store.clear();
        assert!(!store.contains(&user, &Id::from(1)));
        assert_eq!(store.remove(&user, &Id::from(2)), None);
        assert_eq!(store.values.entry_count(), 0);
    }

    #[test]
    fn capacity_bounds_the_store() {
        let user = user();
        let store = EntityStore::new(&[user.clone()], Some(1));
        store
            .m_put(&user, (1..=3).map(|id| item(id, json!({"id": id}))).collect())
            .unwrap();
        store.run_pending_tasks();

        let kept = (1..=3).filter(|id| store.contains(&user, &Id::from(*id))).count();
        assert_eq!(kept, 1);
        assert_eq!(store.values.entry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry() {
        let short = EntityConfig::builder().name("user").ttl(1).build().unwrap();
        let stored = StoredValue::new(item(1, json!({"id": 1})));
        assert!(!has_expired(&short, stored.timestamp));
        tokio::time::advance(std::time::Duration::from_millis(1001)).await;
        assert!(has_expired(&short, stored.timestamp));

        let never = EntityConfig::builder().name("user").ttl(-1).build().unwrap();
        assert!(has_expired(&never, Instant::now()));
    }
}
