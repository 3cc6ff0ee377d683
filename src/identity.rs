use serde_json::Value;

use crate::config::ApiFunctionConfig;
use crate::config::EntityConfig;
use crate::config::IdFrom;
use crate::error::CacheError;
use crate::error::Result;
use crate::serializer::ArgsSerializer;
use crate::types::Id;

/// Id given to values identified by arguments when the call had no meaningful arguments.
pub const EMPTY_ARGS_ID: &str = "__EMPTY_ARGS__";

/// A value tagged with its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Identified {
    pub id:   Id,
    pub item: Value,
}

impl Identified {
    pub fn new(id: Id, item: Value) -> Self {
        Self { id, item }
    }
}

/// Either a single identified value or a list of them, mirroring the shape of an API function response.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifiedSet {
    Single(Identified),
    List(Vec<Identified>),
}

impl IdentifiedSet {
    pub fn ids(&self) -> Vec<Id> {
        match self {
            Self::Single(v) => vec![v.id.clone()],
            Self::List(items) => items.iter().map(|v| v.id.clone()).collect(),
        }
    }

    pub fn items(&self) -> Vec<&Identified> {
        match self {
            Self::Single(v) => vec![v],
            Self::List(items) => items.iter().collect(),
        }
    }

    pub fn into_items(self) -> Vec<Identified> {
        match self {
            Self::Single(v) => vec![v],
            Self::List(items) => items,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

/// Resolve the id of `value` according to the function's `id_from` rule.
pub fn get_id(
    serializer: &dyn ArgsSerializer,
    entity: &EntityConfig,
    function: Option<&ApiFunctionConfig>,
    args: &[Value],
    value: &Value,
) -> Option<Id> {
    let id = match function.map_or(&IdFrom::Entity, |f| f.id_from()) {
        IdFrom::Args => {
            let serialized = serializer.serialize_args(args);
            Some(if serialized.is_empty() {
                Id::from(EMPTY_ARGS_ID)
            }
            else {
                Id::from(serialized)
            })
        }
        IdFrom::Custom(extract) => extract(value),
        IdFrom::Entity => value.get(entity.id_field().as_str()).and_then(Id::from_value),
    };
    id.filter(|id| !id.is_empty())
}

fn identify(
    serializer: &dyn ArgsSerializer,
    entity: &EntityConfig,
    function: Option<&ApiFunctionConfig>,
    args: &[Value],
    value: &Value,
) -> Result<Identified> {
    let id = get_id(serializer, entity, function, args, value).ok_or_else(|| CacheError::MissingId {
        entity: entity.name().clone(),
    })?;
    Ok(Identified::new(id, value.clone()))
}

// Arguments identify a response as a whole; they can't tell its elements apart.
fn identifies_whole(function: Option<&ApiFunctionConfig>) -> bool {
    matches!(function.map(|f| f.id_from()), Some(IdFrom::Args))
}

/// Tag a value, or every element of an array value, with its identity. The value itself is left untouched.
///
/// With [`IdFrom::Args`] an array is tagged as a single value.
pub fn add_id(
    serializer: &dyn ArgsSerializer,
    entity: &EntityConfig,
    function: Option<&ApiFunctionConfig>,
    args: &[Value],
    value: &Value,
) -> Result<IdentifiedSet> {
    Ok(match value {
        Value::Array(items) if !identifies_whole(function) => IdentifiedSet::List(
            items
                .iter()
                .map(|item| identify(serializer, entity, function, args, item))
                .collect::<Result<Vec<_>>>()?,
        ),
        _ => IdentifiedSet::Single(identify(serializer, entity, function, args, value)?),
    })
}

/// Identify every element of a list, producing a list set even for a single element. With [`IdFrom::Args`] the list
/// is identified as a whole, as [`add_id`] does.
pub fn add_ids(
    serializer: &dyn ArgsSerializer,
    entity: &EntityConfig,
    function: Option<&ApiFunctionConfig>,
    args: &[Value],
    values: &[Value],
) -> Result<IdentifiedSet> {
    if identifies_whole(function) {
        return add_id(serializer, entity, function, args, &Value::Array(values.to_vec()));
    }
    Ok(IdentifiedSet::List(
        values
            .iter()
            .map(|item| identify(serializer, entity, function, args, item))
            .collect::<Result<Vec<_>>>()?,
    ))
}

/// Strip identities, giving back the bare value in the shape it was identified from.
pub fn remove_id(set: IdentifiedSet) -> Value {
    match set {
        IdentifiedSet::Single(v) => v.item,
        IdentifiedSet::List(items) => Value::Array(items.into_iter().map(|v| v.item).collect()),
    }
}
