use serde_json::Value;
use std::collections::HashMap;

use super::values_of;
use super::Decoration;
use crate::error::CacheError;
use crate::error::Result;
use crate::identity;
use crate::identity::Identified;
use crate::types::Id;

/// Cached query response keyed by the call arguments.
pub(super) async fn query(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let qc = d.query_cache();

    if !d.function().always_get_fresh_data() {
        // A concurrent invalidation may drop the entry at any point; that's a plain miss.
        if let Some(response) = qc.lookup(d.entity(), d.function(), &args)? {
            if d.is_fresh(response.timestamp) {
                if let Some(values) = response.values {
                    log::trace!("{}: served from query cache", d.fn_name());
                    return Ok(identity::remove_id(values));
                }
            }
        }
    }

    let result = d.call_upstream(args.clone()).await?;
    if result.is_null() {
        // Nothing to identify; don't remember an absence.
        d.invalidate();
        d.notify(values_of(&result), args);
        return Ok(result);
    }

    let identified = d.add_id(&args, &result)?;
    qc.put(d.entity(), d.function(), &args, identified)?;
    d.invalidate();
    d.notify(values_of(&result), args);

    Ok(result)
}

/// A single entity by the id passed as the first argument.
pub(super) async fn by_id(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let id = args
        .first()
        .map(|arg| d.serialized_id(arg))
        .ok_or_else(|| CacheError::invalid_call(d.fn_name(), "the id must be the first argument"))?;

    if !d.function().always_get_fresh_data() {
        if let Some(stored) = d.entity_store().get(d.entity(), &id) {
            if d.is_fresh(stored.timestamp) {
                log::trace!("{}: {id} served from entity store", d.fn_name());
                return Ok(stored.value.item.clone());
            }
        }
    }

    let result = d.call_upstream(args.clone()).await?;
    if result.is_null() {
        d.invalidate();
        d.notify(values_of(&result), args);
        return Ok(result);
    }

    let identified = d.add_id(&args, &result)?;
    d.store(identified)?;
    d.invalidate();
    d.notify(values_of(&result), args);

    Ok(result)
}

/// A batch of entities by the list of ids passed as the first argument. Only the ids which are not cached or have
/// expired are requested from upstream; the response is expected to list the values in the order of the request.
pub(super) async fn by_ids(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let Some(Value::Array(requested)) = args.first()
    else {
        return Err(CacheError::invalid_call(
            d.fn_name(),
            "a list of ids must be the first argument",
        ));
    };

    let requested_ids = requested.iter().map(|arg| d.serialized_id(arg)).collect::<Vec<_>>();
    let use_cache = !d.function().always_get_fresh_data();
    let mut found: HashMap<Id, Value> = HashMap::new();
    let mut missing: Vec<(Id, Value)> = Vec::new();

    for (id, raw) in requested_ids.iter().zip(requested) {
        if found.contains_key(id) || missing.iter().any(|(m, _)| m == id) {
            continue;
        }
        match d.entity_store().get(d.entity(), id) {
            Some(stored) if use_cache && d.is_fresh(stored.timestamp) => {
                found.insert(id.clone(), stored.value.item.clone());
            }
            _ => missing.push((id.clone(), raw.clone())),
        }
    }

    let assemble = |found: &HashMap<Id, Value>| {
        Value::Array(requested_ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    };

    if missing.is_empty() {
        log::trace!("{}: all {} id(s) served from entity store", d.fn_name(), requested_ids.len());
        return Ok(assemble(&found));
    }

    let mut call_args = Vec::with_capacity(args.len());
    call_args.push(Value::Array(missing.iter().map(|(_, raw)| raw.clone()).collect()));
    call_args.extend(args.iter().skip(1).cloned());

    let result = d.call_upstream(call_args.clone()).await?;
    let Value::Array(fetched) = result
    else {
        return Err(CacheError::invalid_call(d.fn_name(), "expected a list of values in response"));
    };
    if fetched.len() != missing.len() {
        log::warn!(
            "{}: requested {} id(s), got {} value(s) back",
            d.fn_name(),
            missing.len(),
            fetched.len()
        );
    }

    let identified = missing
        .iter()
        .zip(&fetched)
        .map(|((id, _), item)| Identified::new(id.clone(), item.clone()))
        .collect::<Vec<_>>();
    d.entity_store().m_put(d.entity(), identified.clone())?;
    d.invalidate();
    d.notify(fetched, call_args);

    found.extend(identified.into_iter().map(|v| (v.id, v.item)));
    Ok(assemble(&found))
}
