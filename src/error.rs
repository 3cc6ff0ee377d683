use std::sync::Arc;
use thiserror::Error;

/// Error type produced by wrapped API functions.
///
/// It is reference-counted because a single upstream failure may be handed to several deduplicated callers.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A value was about to be stored without a resolvable identity.
    #[error("value of '{entity}' has no resolvable id")]
    MissingId { entity: String },

    /// `QueryCache::get` was called for a key which wasn't verified with `contains` first.
    #[error("query '{key}' is not cached")]
    QueryNotCached { key: String },

    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("entity '{entity}' has no API function '{function}'")]
    UnknownFunction { entity: String, function: String },

    /// Arguments or an upstream response don't have the shape the operation requires.
    #[error("invalid call of '{function}': {message}")]
    InvalidCall { function: String, message: String },

    #[error("failed to build {what}: {message}")]
    Build { what: &'static str, message: String },

    /// The task running a decorated call didn't finish; most likely it panicked.
    #[error("call of '{function}' was aborted: {message}")]
    Aborted { function: String, message: String },

    #[error("upstream call failed: {0}")]
    Upstream(#[from] BoxError),
}

impl CacheError {
    pub(crate) fn invalid_call<S: ToString>(function: &str, message: S) -> Self {
        Self::InvalidCall {
            function: function.to_string(),
            message:  message.to_string(),
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}
