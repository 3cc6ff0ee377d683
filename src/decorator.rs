//! Per-operation caching disciplines.
//!
//! A [`Decoration`] binds a wrapped function to its entity and to the cache instance. [`Decoration::apply`] selects
//! the discipline by the function's [`Operation`] and runs it. Every discipline calls through to the wrapped function
//! unless a read can be answered from the cache, and leaves the cache untouched when the wrapped function fails.

mod command;
mod create;
mod delete;
mod no_operation;
mod read;
mod update;

use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

use crate::cache::Cache;
use crate::change::Change;
use crate::config::ApiFunctionConfig;
use crate::config::EntityConfig;
use crate::config::IdFrom;
use crate::entity_store::EntityStore;
use crate::error::Result;
use crate::identity;
use crate::identity::IdentifiedSet;
use crate::query_cache::QueryCache;
use crate::serializer::ArgsSerializer;
use crate::types::Id;
use crate::types::Operation;

pub(crate) struct Decoration {
    cache:       Arc<Cache>,
    query_cache: Arc<QueryCache>,
    entity:      Arc<EntityConfig>,
    function:    Arc<ApiFunctionConfig>,
}

impl Decoration {
    pub(crate) fn new(cache: Arc<Cache>, entity: Arc<EntityConfig>, function: Arc<ApiFunctionConfig>) -> Self {
        Self {
            query_cache: cache.query_cache(),
            cache,
            entity,
            function,
        }
    }

    #[instrument(level = "debug", skip_all, fields(entity = %self.entity.name(), function = %self.function.fn_name()))]
    pub(crate) async fn apply(self, args: Vec<Value>) -> Result<Value> {
        log::debug!(
            "[{}] {} {}.{}",
            self.cache.label(),
            self.function.operation(),
            self.entity.name(),
            self.function.fn_name()
        );

        match self.function.operation() {
            Operation::Create => create::run(&self, args).await,
            Operation::Read if self.function.by_ids() => read::by_ids(&self, args).await,
            Operation::Read if self.function.by_id() => read::by_id(&self, args).await,
            Operation::Read => read::query(&self, args).await,
            Operation::Update => update::run(&self, args).await,
            Operation::Delete => delete::run(&self, args).await,
            Operation::Command => command::run(&self, args).await,
            Operation::NoOperation => no_operation::run(&self, args).await,
        }
    }

    fn entity(&self) -> &EntityConfig {
        &self.entity
    }

    fn function(&self) -> &ApiFunctionConfig {
        &self.function
    }

    fn fn_name(&self) -> &str {
        self.function.fn_name()
    }

    fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    fn entity_store(&self) -> &EntityStore {
        self.query_cache.entity_store()
    }

    fn serializer(&self) -> &dyn ArgsSerializer {
        self.query_cache.serializer()
    }

    fn serialized_id(&self, arg: &Value) -> Id {
        Id::from(self.serializer().serialize(arg))
    }

    fn is_fresh(&self, timestamp: tokio::time::Instant) -> bool {
        !self.query_cache.has_expired(&self.entity, timestamp)
    }

    async fn call_upstream(&self, args: Vec<Value>) -> Result<Value> {
        let result = self.function.handler().call(args).await;
        if let Err(ref err) = result {
            log::debug!("[{}] {} failed: {err}", self.cache.label(), self.fn_name());
        }
        Ok(result?)
    }

    /// Identify a response according to the function's `id_from` rule.
    fn add_id(&self, args: &[Value], value: &Value) -> Result<IdentifiedSet> {
        identity::add_id(self.serializer(), &self.entity, Some(&self.function), args, value)
    }

    /// Identify a value by what it carries itself. Argument-derived ids make no sense for a value passed as an
    /// argument, so only a custom extractor is honored besides the entity's id field.
    fn own_identity(&self, args: &[Value], value: &Value) -> Result<IdentifiedSet> {
        let function = match self.function.id_from() {
            IdFrom::Custom(_) => Some(self.function.as_ref()),
            _ => None,
        };
        identity::add_id(self.serializer(), &self.entity, function, args, value)
    }

    fn store(&self, values: IdentifiedSet) -> Result<()> {
        match values {
            IdentifiedSet::Single(v) => self.entity_store().put(&self.entity, v),
            IdentifiedSet::List(items) => self.entity_store().m_put(&self.entity, items),
        }
    }

    fn invalidate(&self) {
        self.query_cache.invalidate(&self.entity, &self.function);
    }

    fn notify(&self, values: Vec<Value>, args: Vec<Value>) {
        self.cache.changes().notify(Change {
            operation: self.function.operation(),
            entity: self.entity.name().clone(),
            api_fn: self.function.fn_name().clone(),
            values,
            args,
        });
    }
}

/// Values a response contributes to a change notification.
fn values_of(result: &Value) -> Vec<Value> {
    match result {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}
