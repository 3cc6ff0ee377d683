use serde_json::Value;

use super::Decoration;
use crate::error::Result;

// Like CREATE, the server-authoritative state comes back as the result; unlike CREATE, it's not a new member of any
// collection.
pub(super) async fn run(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let result = d.call_upstream(args.clone()).await?;

    d.invalidate();
    if !result.is_null() {
        let identified = d.add_id(&args, &result)?;
        d.store(identified)?;
    }

    d.notify(vec![result.clone()], args);
    Ok(result)
}
