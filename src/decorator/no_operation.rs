use serde_json::Value;

use super::Decoration;
use crate::error::Result;

pub(super) async fn run(d: &Decoration, args: Vec<Value>) -> Result<Value> {
    let result = d.call_upstream(args.clone()).await?;

    d.query_cache().invalidate_function_scope(d.entity(), d.function());
    d.notify(Vec::new(), args);

    Ok(result)
}
