//! # normcache
//!
//! Normalized, entity-aware caching in front of remote data-access functions.
//!
//! Think of it as a client-side store for REST or RPC backends which knows what the data it caches is.
//!
//! # The Basics
//!
//! The `normcache` crate is designed for the following use case:
//!
//! - Data is fetched by calling functions which return JSON-shaped values, usually over the network.
//! - The same records come back from different calls: lists, lookups by id, narrower projections.
//! - Writes through some of these functions make the responses of others stale.
//!
//! The cache operates on the following principles:
//!
//! - Every wrapped function belongs to an *entity* and declares an [`Operation`](types::Operation): `CREATE`, `READ`,
//!   `UPDATE`, `DELETE`, `COMMAND`, or `NO_OPERATION`. The operation defines the caching discipline applied to calls.
//! - Values are stored once, normalized by their id, in the [entity store](entity_store). A *view* is an entity
//!   configured as a projection of another one; when both are known the view's data is merged into the entity.
//! - The [query cache](query_cache) maps a call's entity, function, and arguments onto ids only. Whatever updates an
//!   entity is therefore seen by every cached response referencing it.
//! - Successful writes invalidate query responses declaratively: an entity lists the entities whose responses it
//!   invalidates, a function lists the sibling functions it invalidates.
//! - Concurrent identical reads are [collapsed](dedup) into a single upstream call.
//! - Each reconciled call is reported to change listeners.
//! - Implemented over the [moka](https://crates.io/crates/moka) cache, runs on tokio.
//! - As a client cache, it doesn't support distributed caching nor persistence.
//!
//! # Configuration
//!
//! Entities and their functions are described with [`EntityConfig`](config::EntityConfig) and
//! [`ApiFunctionConfig`](config::ApiFunctionConfig) builders and handed over to [`Cache::builder()`]. A wrapped
//! function is anything implementing [`ApiFunction`], closures included. Decorated handles are then obtained with
//! [`Cache::api`]:
//!
//! ```ignore
//! let users = cache.api("user", "getUsers")?;
//! let list = users.call(vec![]).await?; // upstream
//! let list = users.call(vec![]).await?; // from the cache
//! ```
//!
//! # Identity
//!
//! Each function picks how values it returns are identified, see [`IdFrom`](config::IdFrom): by the entity's id
//! field, by the call arguments, or by a custom extractor. Arguments are serialized into ids and query keys by an
//! [`ArgsSerializer`](serializer::ArgsSerializer); [`DashSerializer`](serializer::DashSerializer) is the default.

pub mod api_fn;
pub mod cache;
pub mod change;
pub mod config;
pub(crate) mod decorator;
pub mod dedup;
pub mod entity_store;
pub mod error;
pub mod identity;
pub mod query_cache;
pub mod serializer;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use api_fn::ApiFn;
#[doc(inline)]
pub use cache::Cache;
#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use traits::ApiFunction;

pub mod prelude {
    pub use crate::api_fn::ApiFn;
    pub use crate::cache::Cache;
    pub use crate::change::Change;
    pub use crate::change::Subscription;
    pub use crate::config::ApiFunctionConfig;
    pub use crate::config::EntityConfig;
    pub use crate::config::IdFrom;
    pub use crate::config::UpdateOnCreate;
    pub use crate::error::BoxError;
    pub use crate::error::CacheError;
    pub use crate::identity::Identified;
    pub use crate::identity::IdentifiedSet;
    pub use crate::serializer::ArgsSerializer;
    pub use crate::serializer::DashSerializer;
    pub use crate::traits::ApiFunction;
    pub use crate::types::*;
}
