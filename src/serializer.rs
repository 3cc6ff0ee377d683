//! Serialization of call arguments into key fragments.
//!
//! The fragments take part in query keys, in ids derived from arguments, and in the id of the entity a `DELETE`
//! operation removes. Anything implementing [`ArgsSerializer`] can be passed to the cache builder to replace the
//! default scheme.

use serde_json::Value;

pub trait ArgsSerializer: Send + Sync + 'static {
    /// Deterministic string form of a single argument.
    fn serialize(&self, value: &Value) -> String;

    /// Serialize a whole argument list.
    fn serialize_args(&self, args: &[Value]) -> String {
        args.iter().map(|arg| self.serialize(arg)).collect::<Vec<_>>().join("-")
    }
}

/// Default serializer: scalars are rendered verbatim, containers as their serialized elements joined with `-`.
///
/// Object keys are not part of the output, so `{"id": 1}` and `1` both serialize to `"1"`. This lets an id be
/// passed either bare or wrapped into a record. Object members are visited in key order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DashSerializer;

impl ArgsSerializer for DashSerializer {
    fn serialize(&self, value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(items) => items.iter().map(|v| self.serialize(v)).collect::<Vec<_>>().join("-"),
            Value::Object(map) => {
                // Don't rely on the map ordering; serde_json may be built with `preserve_order`.
                let mut keys = map.keys().collect::<Vec<_>>();
                keys.sort();
                keys.into_iter()
                    .map(|k| self.serialize(&map[k]))
                    .collect::<Vec<_>>()
                    .join("-")
            }
        }
    }
}
