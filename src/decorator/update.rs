use serde_json::Value;

use super::Decoration;
use crate::error::CacheError;
use crate::error::Result;

/// The updated value is written to the entity store before the upstream call and rolled back if the call fails.
pub(super) async fn run(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let value = args
        .first()
        .ok_or_else(|| CacheError::invalid_call(d.fn_name(), "the updated value must be the first argument"))?;
    let updated = d.own_identity(&args, value)?;

    let snapshots = updated
        .ids()
        .iter()
        .map(|id| d.entity_store().snapshot(d.entity(), id))
        .collect::<Vec<_>>();
    d.store(updated.clone())?;

    let result = match d.call_upstream(args.clone()).await {
        Ok(result) => result,
        Err(err) => {
            log::debug!("{}: rolling back {} value(s)", d.fn_name(), snapshots.len());
            for snapshot in snapshots {
                d.entity_store().restore(snapshot);
            }
            return Err(err);
        }
    };

    d.invalidate();
    // Once more, so the value is timestamped by the confirmed write.
    d.store(updated)?;
    d.notify(vec![value.clone()], args.clone());

    Ok(result)
}
