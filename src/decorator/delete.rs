use serde_json::Value;

use super::Decoration;
use crate::error::CacheError;
use crate::error::Result;

pub(super) async fn run(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let id = args
        .first()
        .map(|arg| d.serialized_id(arg))
        .ok_or_else(|| CacheError::invalid_call(d.fn_name(), "the id of the deleted entity must be the first argument"))?;

    let result = d.call_upstream(args.clone()).await?;

    d.invalidate();
    match d.entity_store().remove(d.entity(), &id) {
        Some(removed) => d.notify(vec![removed], args),
        None => log::trace!("{} {id} was not cached, nothing to notify about", d.entity().name()),
    }

    Ok(result)
}
