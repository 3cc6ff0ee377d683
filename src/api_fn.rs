use fieldx_plus::fx_plus;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::Cache;
use crate::config::ApiFunctionConfig;
use crate::config::EntityConfig;
use crate::decorator::Decoration;
use crate::error::CacheError;
use crate::error::Result;

/// A wrapped API function bound to its entity and cache. Obtained with [`Cache::api`].
///
/// Every call runs as a task of its own. Dropping the future returned by [`call`](Self::call) doesn't stop the wrapped
/// function nor the following cache update.
#[fx_plus(child(Cache, rc_strong), sync, default(off))]
pub struct ApiFn {
    entity:   Arc<EntityConfig>,
    function: Arc<ApiFunctionConfig>,
}

impl ApiFn {
    pub fn entity_config(&self) -> Arc<EntityConfig> {
        Arc::clone(&self.entity)
    }

    pub fn function_config(&self) -> Arc<ApiFunctionConfig> {
        Arc::clone(&self.function)
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let cache = self.parent();
        let label = format!("{}.{}", self.entity.name(), self.function.fn_name());
        let decoration = Decoration::new(Arc::clone(&cache), self.entity_config(), self.function_config());

        if cache.dedup_enabled(&self.entity, &self.function) {
            let key = format!(
                "{}-{}-{}",
                self.entity.name(),
                self.function.fn_name(),
                Value::Array(args.clone())
            );
            return cache
                .deduplicator()
                .run(key, &label, move || decoration.apply(args))
                .await;
        }

        tokio::spawn(decoration.apply(args)).await.unwrap_or_else(|err| {
            Err(CacheError::Aborted {
                function: label,
                message:  err.to_string(),
            })
        })
    }
}
