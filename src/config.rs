use fieldx::fxstruct;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::traits::ApiFunction;
use crate::types::Id;
use crate::types::Operation;

type IdExtractor = dyn Fn(&Value) -> Option<Id> + Send + Sync;
type CreateReducer = dyn Fn(&[Value], &Value, &[Value]) -> Vec<Value> + Send + Sync;

/// Where the identity of a value returned by an API function comes from.
#[derive(Clone, Default)]
pub enum IdFrom {
    /// Read the entity's id field of the value.
    #[default]
    Entity,
    /// Serialize the call arguments. Useful for singleton-like resources which have no id of their own.
    Args,
    /// Apply a custom extractor to the value.
    Custom(Arc<IdExtractor>),
}

impl IdFrom {
    pub fn custom<F>(extractor: F) -> Self
    where
        F: Fn(&Value) -> Option<Id> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(extractor))
    }
}

impl Debug for IdFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity => write!(f, "IdFrom::Entity"),
            Self::Args => write!(f, "IdFrom::Args"),
            Self::Custom(_) => write!(f, "IdFrom::Custom(..)"),
        }
    }
}

/// Reducer letting a cached collection query absorb a newly created entity instead of being refetched.
///
/// Called with the query arguments, the created value, and the values currently cached for the query. A non-empty
/// return replaces the cached values; an empty one leaves them alone.
#[derive(Clone)]
pub struct UpdateOnCreate(Arc<CreateReducer>);

impl UpdateOnCreate {
    pub fn new<F>(reducer: F) -> Self
    where
        F: Fn(&[Value], &Value, &[Value]) -> Vec<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(reducer))
    }

    pub fn apply(&self, args: &[Value], created: &Value, current: &[Value]) -> Vec<Value> {
        (self.0)(args, created, current)
    }
}

impl Debug for UpdateOnCreate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpdateOnCreate(..)")
    }
}

/// Configuration of a single wrapped API function.
#[derive(Clone)]
#[fxstruct(no_new, default(off), builder, get)]
pub struct ApiFunctionConfig {
    #[fieldx(builder(into))]
    fn_name: String,

    #[fieldx(get(copy), default(Operation::NoOperation))]
    operation: Operation,

    #[fieldx(default(IdFrom::Entity))]
    id_from: IdFrom,

    /// Names of functions of the same entity whose cached responses are dropped whenever this function succeeds.
    #[fieldx(default(Vec::new()))]
    invalidates: Vec<String>,

    /// READ a single entity by the id passed as the first argument.
    #[fieldx(get(copy), default(false))]
    by_id: bool,

    /// READ a batch of entities by the list of ids passed as the first argument.
    #[fieldx(get(copy), default(false))]
    by_ids: bool,

    #[fieldx(get(copy), default(false))]
    always_get_fresh_data: bool,

    #[fieldx(optional, get(as_ref))]
    update_on_create: UpdateOnCreate,

    #[fieldx(get(copy), default(true))]
    deduplicate: bool,

    #[fieldx(get(clone))]
    handler: Arc<dyn ApiFunction>,
}

impl Debug for ApiFunctionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiFunctionConfig")
            .field("fn_name", &self.fn_name)
            .field("operation", &self.operation)
            .field("id_from", &self.id_from)
            .field("invalidates", &self.invalidates)
            .field("by_id", &self.by_id)
            .field("by_ids", &self.by_ids)
            .field("always_get_fresh_data", &self.always_get_fresh_data)
            .field("update_on_create", &self.update_on_create)
            .field("deduplicate", &self.deduplicate)
            .finish_non_exhaustive()
    }
}

/// Configuration of an entity or of a view of one.
#[derive(Clone, Debug)]
#[fxstruct(no_new, builder, get)]
pub struct EntityConfig {
    #[fieldx(builder(into))]
    name: String,

    /// Seconds a cached value stays fresh. A negative value disables caching of reads.
    #[fieldx(get(copy), default(300))]
    ttl: i64,

    /// Entities whose cached query responses are dropped when one of the `invalidates_on` operations of this entity
    /// succeeds.
    #[fieldx(default(Vec::new()))]
    invalidates: Vec<String>,

    #[fieldx(default(vec![Operation::Create, Operation::Update, Operation::Delete]))]
    invalidates_on: Vec<Operation>,

    /// Makes this entity a view of the named one.
    #[fieldx(optional, get(as_ref), builder(into))]
    view_of: String,

    #[fieldx(builder(into), default(String::from("id")))]
    id_field: String,

    #[fieldx(get(copy), default(true))]
    deduplicate: bool,

    #[fieldx(default(Vec::new()))]
    api: Vec<ApiFunctionConfig>,
}

impl EntityConfig {
    pub fn is_view(&self) -> bool {
        self.view_of().is_some()
    }

    /// Name of the entity values of this config are normalized under: the parent for a view, the own name otherwise.
    pub fn entity_type(&self) -> &str {
        self.view_of().map_or(self.name().as_str(), |parent| parent.as_str())
    }

    pub fn function(&self, fn_name: &str) -> Option<&ApiFunctionConfig> {
        self.api().iter().find(|f| f.fn_name() == fn_name)
    }

    pub fn invalidates_on_op(&self, operation: Operation) -> bool {
        self.invalidates_on().contains(&operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use serde_json::json;

    fn noop() -> Arc<dyn ApiFunction> {
        Arc::new(|_args: Vec<Value>| async move { Ok::<_, BoxError>(Value::Null) })
    }

    #[test]
    fn entity_defaults() {
        let config = EntityConfig::builder().name("user").build().unwrap();
        assert_eq!(config.ttl(), 300);
        assert_eq!(config.id_field(), "id");
        assert!(config.deduplicate());
        assert!(!config.is_view());
        assert_eq!(config.entity_type(), "user");
        assert!(config.invalidates_on_op(Operation::Create));
        assert!(!config.invalidates_on_op(Operation::Read));
    }

    #[test]
    fn view_resolves_to_parent() {
        let config = EntityConfig::builder().name("mini_user").view_of("user").build().unwrap();
        assert!(config.is_view());
        assert_eq!(config.entity_type(), "user");
    }

    #[test]
    fn function_lookup() {
        let config = EntityConfig::builder()
            .name("user")
            .api(vec![ApiFunctionConfig::builder()
                .fn_name("getUsers")
                .operation(Operation::Read)
                .handler(noop())
                .build()
                .unwrap()])
            .build()
            .unwrap();
        let function = config.function("getUsers").unwrap();
        assert_eq!(function.operation(), Operation::Read);
        assert!(function.deduplicate());
        assert!(function.update_on_create().is_none());
        assert!(config.function("getUser").is_none());
    }

    #[test]
    fn reducer_and_extractor() {
        let reducer = UpdateOnCreate::new(|_args, created, current| {
            let mut all = current.to_vec();
            all.push(created.clone());
            all
        });
        assert_eq!(reducer.apply(&[], &json!(2), &[json!(1)]), vec![json!(1), json!(2)]);

        let IdFrom::Custom(extract) = IdFrom::custom(|v| v.get("key").and_then(Id::from_value))
        else {
            panic!("expected a custom extractor");
        };
        assert_eq!(extract(&json!({"key": "k1"})), Some(Id::from("k1")));
    }
}
