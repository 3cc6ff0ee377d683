//! Cache of query responses.
//!
//! An entry maps an `(entity, function, arguments)` triple to the ids of the values that answered the call. The values
//! themselves live in the [`EntityStore`] the query cache is layered on, so an update of an entity is seen by every
//! query referencing it.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::ApiFunctionConfig;
use crate::config::EntityConfig;
use crate::entity_store::EntityStore;
use crate::error::CacheError;
use crate::error::Result;
use crate::identity;
use crate::identity::IdentifiedSet;
use crate::serializer::ArgsSerializer;
use crate::types::Id;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    entity:   String,
    function: String,
    args:     String,
}

impl QueryKey {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn function(&self) -> &str {
        &self.function
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.entity, self.function, self.args)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryIds {
    Single(Id),
    List(Vec<Id>),
}

impl QueryIds {
    fn of(values: &IdentifiedSet) -> Self {
        match values {
            IdentifiedSet::Single(v) => Self::Single(v.id.clone()),
            IdentifiedSet::List(_) => Self::List(values.ids()),
        }
    }
}

#[derive(Debug, Clone)]
struct QueryEntry {
    ids:           QueryIds,
    timestamp:     Instant,
    create_events: Vec<Id>,
}

/// What [`QueryCache::get`] hands back.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// `None` when a referenced entity is no longer in the entity store.
    pub values:    Option<IdentifiedSet>,
    pub timestamp: Instant,
}

impl QueryResponse {
    pub fn is_complete(&self) -> bool {
        self.values.is_some()
    }
}

pub struct QueryCache {
    entity_store: Arc<EntityStore>,
    serializer:   Arc<dyn ArgsSerializer>,
    entries:      Cache<QueryKey, Arc<QueryEntry>>,
    write_lock:   Mutex<()>,
}

impl QueryCache {
    pub fn new(entity_store: Arc<EntityStore>, serializer: Arc<dyn ArgsSerializer>, max_capacity: Option<u64>) -> Self {
        let mut builder = Cache::builder()
            .name("query cache")
            .eviction_policy(EvictionPolicy::tiny_lfu());
        if let Some(capacity) = max_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            entity_store,
            serializer,
            entries: builder.build(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn entity_store(&self) -> &Arc<EntityStore> {
        &self.entity_store
    }

    pub fn serializer(&self) -> &dyn ArgsSerializer {
        self.serializer.as_ref()
    }

    pub fn key(&self, entity: &EntityConfig, function: &ApiFunctionConfig, args: &[Value]) -> QueryKey {
        QueryKey {
            entity:   entity.name().clone(),
            function: function.fn_name().clone(),
            args:     self.serializer.serialize_args(args),
        }
    }

    /// Cache the response of a call and write its values into the entity store.
    pub fn put(
        &self,
        entity: &EntityConfig,
        function: &ApiFunctionConfig,
        args: &[Value],
        values: IdentifiedSet,
    ) -> Result<()> {
        let key = self.key(entity, function, args);
        let ids = QueryIds::of(&values);

        match values {
            IdentifiedSet::Single(v) => self.entity_store.put(entity, v)?,
            IdentifiedSet::List(items) => self.entity_store.m_put(entity, items)?,
        }

        log::trace!("Caching query {key}");
        self.entries.insert(
            key,
            Arc::new(QueryEntry {
                ids,
                timestamp: Instant::now(),
                create_events: Vec::new(),
            }),
        );
        Ok(())
    }

    /// Key existence only; staleness is not considered.
    pub fn contains(&self, entity: &EntityConfig, function: &ApiFunctionConfig, args: &[Value]) -> bool {
        self.entries.contains_key(&self.key(entity, function, args))
    }

    pub fn has_expired(&self, entity: &EntityConfig, timestamp: Instant) -> bool {
        crate::entity_store::has_expired(entity, timestamp)
    }

    fn resolve(&self, entity: &EntityConfig, ids: &QueryIds) -> Option<IdentifiedSet> {
        let fetch = |id: &Id| self.entity_store.get(entity, id).map(|stored| stored.value.clone());
        Some(match ids {
            QueryIds::Single(id) => IdentifiedSet::Single(fetch(id)?),
            QueryIds::List(ids) => IdentifiedSet::List(ids.iter().map(fetch).collect::<Option<Vec<_>>>()?),
        })
    }

    /// Fetch a cached response. The key must be known to exist: check with [`contains`](Self::contains) first.
    ///
    /// Pending create events of the entry are consumed before the response is assembled if the function has an
    /// `update_on_create` reducer.
    pub fn get(&self, entity: &EntityConfig, function: &ApiFunctionConfig, args: &[Value]) -> Result<QueryResponse> {
        self.lookup(entity, function, args)?.ok_or_else(|| CacheError::QueryNotCached {
            key: self.key(entity, function, args).to_string(),
        })
    }

    /// Like [`get`](Self::get), but a missing entry is `None`. The entry may be invalidated or evicted concurrently at
    /// any moment, so this is what readers racing with writers must use.
    pub fn lookup(
        &self,
        entity: &EntityConfig,
        function: &ApiFunctionConfig,
        args: &[Value],
    ) -> Result<Option<QueryResponse>> {
        let key = self.key(entity, function, args);

        if let Some(reducer) = function.update_on_create() {
            while let Some(created_id) = self.next_create_event(&key) {
                let Some(created) = self.entity_store.get(entity, &created_id)
                else {
                    log::trace!("Created {created_id} is gone, skipping event of {key}");
                    continue;
                };

                let Some(entry) = self.entries.get(&key)
                else {
                    break;
                };
                let current = self.resolve(entity, &entry.ids).map(identity::remove_id);
                let current_items = match &current {
                    Some(Value::Array(items)) => items.clone(),
                    Some(value) => vec![value.clone()],
                    None => Vec::new(),
                };

                let replacement = reducer.apply(args, &created.value.item, &current_items);
                if replacement.is_empty() {
                    continue;
                }

                let values = match (&entry.ids, current) {
                    (QueryIds::List(_), _) => {
                        identity::add_ids(self.serializer(), entity, Some(function), args, &replacement)?
                    }
                    // A list identified as a whole stays one.
                    (QueryIds::Single(_), Some(Value::Array(_))) => identity::add_id(
                        self.serializer(),
                        entity,
                        Some(function),
                        args,
                        &Value::Array(replacement),
                    )?,
                    _ if replacement.len() == 1 => {
                        identity::add_id(self.serializer(), entity, Some(function), args, &replacement[0])?
                    }
                    _ => identity::add_ids(self.serializer(), entity, Some(function), args, &replacement)?,
                };
                self.replace_ids(&key, entity, values)?;
            }
        }

        Ok(self.entries.get(&key).map(|entry| QueryResponse {
            values:    self.resolve(entity, &entry.ids),
            timestamp: entry.timestamp,
        }))
    }

    // Pops the oldest pending create event of the entry. A vanished entry has none.
    fn next_create_event(&self, key: &QueryKey) -> Option<Id> {
        let _guard = self.write_lock.lock();
        let entry = self.entries.get(key)?;
        if entry.create_events.is_empty() {
            return None;
        }

        let mut updated = (*entry).clone();
        let id = updated.create_events.remove(0);
        self.entries.insert(key.clone(), Arc::new(updated));
        Some(id)
    }

    // Rewrites the ids of an entry, keeping its timestamp and any create events still queued.
    fn replace_ids(&self, key: &QueryKey, entity: &EntityConfig, values: IdentifiedSet) -> Result<()> {
        let ids = QueryIds::of(&values);
        self.entity_store.m_put(entity, values.into_items())?;

        let _guard = self.write_lock.lock();
        if let Some(entry) = self.entries.get(key) {
            let mut updated = (*entry).clone();
            updated.ids = ids;
            self.entries.insert(key.clone(), Arc::new(updated));
        }
        Ok(())
    }

    /// Queue `id` on every cached response of every `update_on_create` function of the entity.
    pub fn store_create_event(&self, entity: &EntityConfig, id: &Id) {
        let functions = entity
            .api()
            .iter()
            .filter(|f| f.update_on_create().is_some())
            .map(|f| f.fn_name().as_str())
            .collect::<Vec<_>>();
        if functions.is_empty() {
            return;
        }

        let _guard = self.write_lock.lock();
        let keys = self
            .entries
            .iter()
            .filter(|(key, _)| key.entity == *entity.name() && functions.contains(&key.function.as_str()))
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        for key in keys {
            if let Some(entry) = self.entries.get(key.as_ref()) {
                let mut updated = (*entry).clone();
                updated.create_events.push(id.clone());
                self.entries.insert((*key).clone(), Arc::new(updated));
            }
        }
    }

    fn invalidate_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryKey) -> bool,
    {
        let _guard = self.write_lock.lock();
        let keys = self
            .entries
            .iter()
            .filter(|(key, _)| predicate(key.as_ref()))
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in &keys {
            self.entries.invalidate(key.as_ref());
        }
        keys.len()
    }

    /// Drop responses of the entity's functions listed in the function's own `invalidates`.
    pub fn invalidate_function_scope(&self, entity: &EntityConfig, function: &ApiFunctionConfig) {
        for name in function.invalidates() {
            let dropped = self.invalidate_where(|key| key.entity == *entity.name() && key.function == *name);
            if dropped > 0 {
                log::debug!("{} invalidated {dropped} response(s) of {}.{name}", function.fn_name(), entity.name());
            }
        }
    }

    /// Apply both invalidation sweeps triggered by a successful call of `function`.
    ///
    /// Entity-scoped: if the function's operation is one of the entity's `invalidates_on`, every response of each
    /// entity in `invalidates` is dropped. Function-scoped: see
    /// [`invalidate_function_scope`](Self::invalidate_function_scope).
    pub fn invalidate(&self, entity: &EntityConfig, function: &ApiFunctionConfig) {
        if entity.invalidates_on_op(function.operation()) {
            for name in entity.invalidates() {
                let dropped = self.invalidate_where(|key| key.entity == *name);
                if dropped > 0 {
                    log::debug!(
                        "{} on {} invalidated {dropped} response(s) of {name}",
                        function.operation(),
                        entity.name()
                    );
                }
            }
        }
        self.invalidate_function_scope(entity, function);
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateOnCreate;
    use crate::error::BoxError;
    use crate::serializer::DashSerializer;
    use crate::traits::ApiFunction;
    use crate::types::Operation;
    use serde_json::json;

    fn handler() -> Arc<dyn ApiFunction> {
        Arc::new(|_args: Vec<Value>| async move { Ok::<_, BoxError>(Value::Null) })
    }

    fn function(name: &str, operation: Operation) -> ApiFunctionConfig {
        ApiFunctionConfig::builder()
            .fn_name(name)
            .operation(operation)
            .handler(handler())
            .build()
            .unwrap()
    }

    fn query_cache(entities: &[EntityConfig]) -> QueryCache {
        let store = Arc::new(EntityStore::new(entities, None));
        QueryCache::new(store, Arc::new(DashSerializer), None)
    }

    fn identified(entity: &EntityConfig, value: Value) -> IdentifiedSet {
        identity::add_id(&DashSerializer, entity, None, &[], &value).unwrap()
    }

    #[test]
    fn put_contains_get() {
        let user = EntityConfig::builder().name("user").build().unwrap();
        let get_users = function("getUsers", Operation::Read);
        let qc = query_cache(&[user.clone()]);
        let users = json!([{"id": 1, "name": "Kalle"}, {"id": 2, "name": "Anka"}]);

        assert!(!qc.contains(&user, &get_users, &[json!("x")]));
        qc.put(&user, &get_users, &[json!("x")], identified(&user, users.clone())).unwrap();
        assert!(qc.contains(&user, &get_users, &[json!("x")]));
        assert!(!qc.contains(&user, &get_users, &[json!("y")]));
        assert!(qc.entity_store().contains(&user, &Id::from(2)));

        let response = qc.get(&user, &get_users, &[json!("x")]).unwrap();
        assert!(response.is_complete());
        assert!(!qc.has_expired(&user, response.timestamp));
        assert_eq!(identity::remove_id(response.values.unwrap()), users);
    }

    #[test]
    fn get_of_unknown_key_fails() {
        let user = EntityConfig::builder().name("user").build().unwrap();
        let qc = query_cache(&[user.clone()]);
        let err = qc.get(&user, &function("getUsers", Operation::Read), &[]).unwrap_err();
        assert!(matches!(err, CacheError::QueryNotCached { .. }));
    }

    #[test]
    fn lookup_treats_a_vanished_entry_as_missing() {
        let user = EntityConfig::builder().name("user").build().unwrap();
        let get_users = function("getUsers", Operation::Read);
        let qc = query_cache(&[user.clone()]);
        qc.put(&user, &get_users, &[], identified(&user, json!([{"id": 1}]))).unwrap();
        assert!(qc.lookup(&user, &get_users, &[]).unwrap().is_some());

        let add_user = ApiFunctionConfig::builder()
            .fn_name("addUser")
            .operation(Operation::Create)
            .invalidates(vec!["getUsers".to_string()])
            .handler(handler())
            .build()
            .unwrap();
        qc.invalidate_function_scope(&user, &add_user);
        assert!(qc.lookup(&user, &get_users, &[]).unwrap().is_none());

        qc.put(&user, &get_users, &[], identified(&user, json!([{"id": 1}]))).unwrap();
        qc.clear();
        assert!(qc.lookup(&user, &get_users, &[]).unwrap().is_none());
        assert!(!qc.contains(&user, &get_users, &[]));
    }

    #[test]
    fn evicted_entity_leaves_response_incomplete() {
        let user = EntityConfig::builder().name("user").build().unwrap();
        let get_users = function("getUsers", Operation::Read);
        let store = Arc::new(EntityStore::new(&[user.clone()], Some(1)));
        let qc = QueryCache::new(Arc::clone(&store), Arc::new(DashSerializer), Some(1));

        qc.put(&user, &get_users, &[], identified(&user, json!([{"id": 1}, {"id": 2}])))
            .unwrap();
        store.run_pending_tasks();

        let response = qc.lookup(&user, &get_users, &[]).unwrap().unwrap();
        assert!(!response.is_complete());
    }

    #[test]
    fn response_sees_entity_updates_and_removals() {
        let user = EntityConfig::builder().name("user").build().unwrap();
        let get_users = function("getUsers", Operation::Read);
        let qc = query_cache(&[user.clone()]);
        qc.put(&user, &get_users, &[], identified(&user, json!([{"id": 1, "name": "Kalle"}])))
            .unwrap();

        qc.entity_store()
            .put(&user, identity::Identified::new(Id::from(1), json!({"id": 1, "name": "Karl"})))
            .unwrap();
        let response = qc.get(&user, &get_users, &[]).unwrap();
        assert_eq!(identity::remove_id(response.values.unwrap()), json!([{"id": 1, "name": "Karl"}]));

        qc.entity_store().remove(&user, &Id::from(1));
        assert!(!qc.get(&user, &get_users, &[]).unwrap().is_complete());
    }

    #[test]
    fn entity_scoped_invalidation_respects_invalidates_on() {
        let user = EntityConfig::builder()
            .name("user")
            .invalidates(vec!["activity".to_string()])
            .invalidates_on(vec![Operation::Create])
            .build()
            .unwrap();
        let activity = EntityConfig::builder().name("activity").build().unwrap();
        let get_activities = function("getActivities", Operation::Read);
        let qc = query_cache(&[user.clone(), activity.clone()]);
        let fill = || {
            qc.put(&activity, &get_activities, &[], identified(&activity, json!([{"id": 1}])))
                .unwrap()
        };

        fill();
        qc.invalidate(&user, &function("updateUser", Operation::Update));
        assert!(qc.contains(&activity, &get_activities, &[]));

        qc.invalidate(&user, &function("createUser", Operation::Create));
        assert!(!qc.contains(&activity, &get_activities, &[]));
    }

    #[test]
    fn function_scoped_invalidation() {
        let user = EntityConfig::builder().name("user").invalidates_on(vec![]).build().unwrap();
        let get_users = function("getUsers", Operation::Read);
        let get_user = function("getUser", Operation::Read);
        let qc = query_cache(&[user.clone()]);
        qc.put(&user, &get_users, &[], identified(&user, json!([{"id": 1}]))).unwrap();
        qc.put(&user, &get_user, &[json!(1)], identified(&user, json!({"id": 1}))).unwrap();

        let rename = ApiFunctionConfig::builder()
            .fn_name("renameUsers")
            .operation(Operation::Command)
            .invalidates(vec!["getUsers".to_string()])
            .handler(handler())
            .build()
            .unwrap();
        qc.invalidate(&user, &rename);
        assert!(!qc.contains(&user, &get_users, &[]));
        assert!(qc.contains(&user, &get_user, &[json!(1)]));
    }

    #[test]
    fn create_events_are_folded_into_collections() {
        let get_users = ApiFunctionConfig::builder()
            .fn_name("getUsers")
            .operation(Operation::Read)
            .update_on_create(UpdateOnCreate::new(|_args, created, current| {
                let mut all = current.to_vec();
                all.push(created.clone());
                all
            }))
            .handler(handler())
            .build()
            .unwrap();
        let user = EntityConfig::builder().name("user").api(vec![get_users.clone()]).build().unwrap();
        let qc = query_cache(&[user.clone()]);
        qc.put(&user, &get_users, &[], identified(&user, json!([{"id": 1}]))).unwrap();

        qc.entity_store()
            .put(&user, identity::Identified::new(Id::from(2), json!({"id": 2})))
            .unwrap();
        qc.store_create_event(&user, &Id::from(2));
        qc.entity_store()
            .put(&user, identity::Identified::new(Id::from(3), json!({"id": 3})))
            .unwrap();
        qc.store_create_event(&user, &Id::from(3));
        // Deleted before the query is read again.
        qc.entity_store().remove(&user, &Id::from(3));

        let response = qc.get(&user, &get_users, &[]).unwrap();
        assert_eq!(identity::remove_id(response.values.unwrap()), json!([{"id": 1}, {"id": 2}]));

        // The events are consumed.
        let response = qc.get(&user, &get_users, &[]).unwrap();
        assert_eq!(identity::remove_id(response.values.unwrap()), json!([{"id": 1}, {"id": 2}]));
    }
}
