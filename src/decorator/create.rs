use serde_json::Value;

use super::Decoration;
use crate::error::Result;

pub(super) async fn run(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let result = d.call_upstream(args.clone()).await?;

    d.invalidate();
    let created = d.add_id(&args, &result)?.into_items();
    let ids = created.iter().map(|v| v.id.clone()).collect::<Vec<_>>();
    d.entity_store().m_put(d.entity(), created)?;
    for id in &ids {
        d.query_cache().store_create_event(d.entity(), id);
    }

    d.notify(vec![result.clone()], args);
    Ok(result)
}
