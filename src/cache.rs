use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::time::Instant;

use crate::api_fn::ApiFn;
use crate::change::Change;
use crate::change::ChangeFeed;
use crate::change::Subscription;
use crate::config::ApiFunctionConfig;
use crate::config::EntityConfig;
use crate::dedup::Deduplicator;
use crate::entity_store::EntityStore;
use crate::entity_store::StoredValue;
use crate::error::CacheError;
use crate::error::Result;
use crate::identity::Identified;
use crate::identity::IdentifiedSet;
use crate::query_cache::QueryCache;
use crate::query_cache::QueryResponse;
use crate::serializer::ArgsSerializer;
use crate::serializer::DashSerializer;
use crate::types::Id;
use crate::types::Operation;

/// An entity configuration with its functions, resolved by name.
#[derive(Debug)]
pub(crate) struct Registered {
    pub(crate) config:    Arc<EntityConfig>,
    pub(crate) functions: HashMap<String, Arc<ApiFunctionConfig>>,
}

/// The cache instance. Everything it knows lives here: the entity store, the query cache, calls in flight, and change
/// listeners.
///
/// ```ignore
/// let cache = Cache::builder()
///     .name("users")
///     .entities(vec![
///         EntityConfig::builder()
///             .name("user")
///             .invalidates(vec!["user".to_string()])
///             .api(vec![
///                 ApiFunctionConfig::builder()
///                     .fn_name("getUsers")
///                     .operation(Operation::Read)
///                     .handler(Arc::new(|_args| async { Ok::<_, BoxError>(json!([{"id": 1, "name": "Kalle"}])) }) as Arc<dyn ApiFunction>)
///                     .build()?,
///             ])
///             .build()?,
///     ])
///     .build()?;
///
/// let users = cache.api("user", "getUsers")?.call(vec![]).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`Cache`].", "", "See [`Cache::builder()`] method."),
        method_doc("Implement builder pattern for [`Cache`]."),
    )
)]
pub struct Cache {
    /// Cache name. Most useful for debugging and logging.
    #[fieldx(optional, get(off), builder(into))]
    name: String,

    #[fieldx(get, default(Vec::new()))]
    entities: Vec<EntityConfig>,

    /// Global switch of READ call deduplication. Entities and functions have their own.
    #[fieldx(get(copy), default(true))]
    deduplicate: bool,

    /// Upper bound of both the entity store and the query cache. Unbounded when not set.
    #[fieldx(optional, get(off))]
    max_capacity: u64,

    /// Argument serializer. [`DashSerializer`] unless set.
    #[fieldx(optional, get(off))]
    serializer: Arc<dyn ArgsSerializer>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    registry: Arc<HashMap<String, Registered>>,

    #[fieldx(lazy, get(clone), builder(off))]
    entity_store: Arc<EntityStore>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    query_cache: Arc<QueryCache>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    deduplicator: Arc<Deduplicator>,

    #[fieldx(lazy, get(clone), builder(off))]
    changes: Arc<ChangeFeed>,
}

impl Cache {
    fn build_registry(&self) -> Arc<HashMap<String, Registered>> {
        let entities = self.entities();
        let mut registry = HashMap::with_capacity(entities.len());

        for entity in entities {
            let known = |name: &str| entities.iter().any(|e| e.name() == name);
            if let Some(parent) = entity.view_of() {
                if !known(parent) {
                    log::warn!("[{}] '{}' is a view of unknown entity '{parent}'", self.label(), entity.name());
                }
            }
            for target in entity.invalidates() {
                if !known(target) {
                    log::warn!("[{}] '{}' invalidates unknown entity '{target}'", self.label(), entity.name());
                }
            }

            let functions = entity
                .api()
                .iter()
                .map(|f| (f.fn_name().clone(), Arc::new(f.clone())))
                .collect();
            registry.insert(
                entity.name().clone(),
                Registered {
                    config: Arc::new(entity.clone()),
                    functions,
                },
            );
        }

        Arc::new(registry)
    }

    fn build_entity_store(&self) -> Arc<EntityStore> {
        Arc::new(EntityStore::new(self.entities(), self.max_capacity))
    }

    fn build_query_cache(&self) -> Arc<QueryCache> {
        let serializer = self
            .serializer
            .clone()
            .unwrap_or_else(|| Arc::new(DashSerializer) as Arc<dyn ArgsSerializer>);
        Arc::new(QueryCache::new(self.entity_store(), serializer, self.max_capacity))
    }

    fn build_deduplicator(&self) -> Arc<Deduplicator> {
        Arc::new(Deduplicator::new())
    }

    fn build_changes(&self) -> Arc<ChangeFeed> {
        Arc::new(ChangeFeed::new())
    }

    #[inline]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<anon>")
    }

    /// Configuration of the entity or view `name`.
    pub fn entity(&self, name: &str) -> Result<Arc<EntityConfig>> {
        self.registry()
            .get(name)
            .map(|r| Arc::clone(&r.config))
            .ok_or_else(|| CacheError::UnknownEntity(name.to_string()))
    }

    /// Decorated handle of function `fn_name` of entity `entity`.
    pub fn api(&self, entity: &str, fn_name: &str) -> Result<ApiFn> {
        let registry = self.registry();
        let registered = registry
            .get(entity)
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))?;
        let function = registered
            .functions
            .get(fn_name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownFunction {
                entity:   entity.to_string(),
                function: fn_name.to_string(),
            })?;

        child_build!(
            self,
            ApiFn {
                entity:   Arc::clone(&registered.config),
                function: function,
            }
        )
        .map_err(|err| CacheError::Build {
            what:    "API function handle",
            message: err.to_string(),
        })
    }

    /// Concurrent calls of `function` are collapsed only for reads and only if nobody opted out.
    pub(crate) fn dedup_enabled(&self, entity: &EntityConfig, function: &ApiFunctionConfig) -> bool {
        function.operation() == Operation::Read
            && self.deduplicate()
            && entity.deduplicate()
            && function.deduplicate()
    }

    pub fn add_change_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.changes().add_listener(listener)
    }

    /// Forget every stored entity and query response. Calls in flight and listeners are not affected.
    pub fn clear(&self) {
        log::debug!("[{}] CLEAR", self.label());
        self.query_cache().clear();
        self.entity_store().clear();
    }

    pub fn get_entity(&self, entity: &str, id: &Id) -> Result<Option<Arc<StoredValue>>> {
        Ok(self.entity_store().get(&*self.entity(entity)?, id))
    }

    pub fn store_entity(&self, entity: &str, value: Identified) -> Result<()> {
        self.entity_store().put(&*self.entity(entity)?, value)
    }

    pub fn store_entities(&self, entity: &str, values: Vec<Identified>) -> Result<()> {
        self.entity_store().m_put(&*self.entity(entity)?, values)
    }

    pub fn remove_entity(&self, entity: &str, id: &Id) -> Result<Option<Value>> {
        Ok(self.entity_store().remove(&*self.entity(entity)?, id))
    }

    pub fn contains_entity(&self, entity: &str, id: &Id) -> Result<bool> {
        Ok(self.entity_store().contains(&*self.entity(entity)?, id))
    }

    fn function_of(&self, entity: &str, fn_name: &str) -> Result<(Arc<EntityConfig>, Arc<ApiFunctionConfig>)> {
        let handle = self.api(entity, fn_name)?;
        Ok((handle.entity_config(), handle.function_config()))
    }

    pub fn get_query_response(&self, entity: &str, fn_name: &str, args: &[Value]) -> Result<QueryResponse> {
        let (entity, function) = self.function_of(entity, fn_name)?;
        self.query_cache().get(&entity, &function, args)
    }

    pub fn store_query_response(&self, entity: &str, fn_name: &str, args: &[Value], values: IdentifiedSet) -> Result<()> {
        let (entity, function) = self.function_of(entity, fn_name)?;
        self.query_cache().put(&entity, &function, args, values)
    }

    /// Run the invalidation sweeps a successful call of `fn_name` would.
    pub fn invalidate_query(&self, entity: &str, fn_name: &str) -> Result<()> {
        let (entity, function) = self.function_of(entity, fn_name)?;
        self.query_cache().invalidate(&entity, &function);
        Ok(())
    }

    pub fn contains_query_response(&self, entity: &str, fn_name: &str, args: &[Value]) -> Result<bool> {
        let (entity, function) = self.function_of(entity, fn_name)?;
        Ok(self.query_cache().contains(&entity, &function, args))
    }

    pub fn has_expired(&self, entity: &str, timestamp: Instant) -> Result<bool> {
        Ok(self.query_cache().has_expired(&*self.entity(entity)?, timestamp))
    }

    pub fn store_create_event(&self, entity: &str, id: &Id) -> Result<()> {
        self.query_cache().store_create_event(&*self.entity(entity)?, id);
        Ok(())
    }
}

impl Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.label())
            .field("entities", &self.entities().iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("deduplicate", &self.deduplicate())
            .finish()
    }
}
