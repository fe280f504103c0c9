// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON encoding of individual change records.
//!
//! Scalars travel under `value` and node references under `nodeValue`, so the
//! decoder never has to guess from the payload's JSON type. List splices use
//! `add` for values and `addNodes` for references in the same way.

use serde_json::{Map, Value};
use tether_tree::{FeatureId, FeatureValue, NodeChange, NodeId, SpliceItems};

use crate::error::DecodeError;

const NODE: &str = "node";
const TYPE: &str = "type";
const FEAT: &str = "feat";
const KEY: &str = "key";
const VALUE: &str = "value";
const NODE_VALUE: &str = "nodeValue";
const INDEX: &str = "index";
const REMOVE: &str = "remove";
const ADD: &str = "add";
const ADD_NODES: &str = "addNodes";

/// Encodes one record as a JSON object.
pub fn encode_change(change: &NodeChange) -> Value {
    let mut obj = Map::new();
    obj.insert(NODE.into(), change.node().into());
    let kind = match change {
        NodeChange::Attach { .. } => "attach",
        NodeChange::Detach { .. } => "detach",
        NodeChange::Put { .. } => "put",
        NodeChange::PutOverride { .. } => "putOverride",
        NodeChange::Remove { .. } => "remove",
        NodeChange::Splice { .. } => "splice",
        NodeChange::Clear { .. } => "clear",
    };
    obj.insert(TYPE.into(), kind.into());
    if let Some(feature) = change.feature() {
        obj.insert(FEAT.into(), feature.into());
    }
    if let Some(key) = change.key() {
        obj.insert(KEY.into(), key.into());
    }
    match change {
        NodeChange::Put { value, .. } => insert_value(&mut obj, value),
        NodeChange::PutOverride {
            value: Some(value), ..
        } => insert_value(&mut obj, value),
        NodeChange::Splice {
            index, remove, add, ..
        } => {
            obj.insert(INDEX.into(), (*index as u64).into());
            if *remove > 0 {
                obj.insert(REMOVE.into(), (*remove as u64).into());
            }
            match add {
                SpliceItems::None => {}
                SpliceItems::Values(values) => {
                    obj.insert(ADD.into(), Value::Array(values.clone()));
                }
                SpliceItems::Nodes(ids) => {
                    obj.insert(
                        ADD_NODES.into(),
                        Value::Array(ids.iter().map(|id| Value::from(*id)).collect()),
                    );
                }
            }
        }
        _ => {}
    }
    Value::Object(obj)
}

fn insert_value(obj: &mut Map<String, Value>, value: &FeatureValue) {
    match value {
        FeatureValue::Value(v) => {
            obj.insert(VALUE.into(), v.clone());
        }
        FeatureValue::Node(id) => {
            obj.insert(NODE_VALUE.into(), (*id).into());
        }
    }
}

/// Decodes one record. Unknown keys are ignored; missing or mistyped keys are errors.
pub fn decode_change(value: &Value) -> Result<NodeChange, DecodeError> {
    let obj = value
        .as_object()
        .ok_or(DecodeError::NotAnObject("change"))?;
    let node = node_id(obj, NODE)?;
    let kind = obj
        .get(TYPE)
        .ok_or(DecodeError::MissingField(TYPE))?
        .as_str()
        .ok_or_else(|| invalid(TYPE, "expected a string"))?;
    Ok(match kind {
        "attach" => NodeChange::Attach { node },
        "detach" => NodeChange::Detach { node },
        "put" => NodeChange::Put {
            node,
            feature: feature(obj)?,
            key: key(obj)?,
            value: put_value(obj)?.ok_or(DecodeError::MissingField(VALUE))?,
        },
        "putOverride" => NodeChange::PutOverride {
            node,
            feature: feature(obj)?,
            key: key(obj)?,
            value: put_value(obj)?,
        },
        "remove" => NodeChange::Remove {
            node,
            feature: feature(obj)?,
            key: key(obj)?,
        },
        "splice" => {
            let feature = feature(obj)?;
            let index = usize_field(obj, INDEX)?.ok_or(DecodeError::MissingField(INDEX))?;
            let remove = usize_field(obj, REMOVE)?.unwrap_or(0);
            let add = match (obj.get(ADD), obj.get(ADD_NODES)) {
                (Some(_), Some(_)) => return Err(DecodeError::Conflicting(ADD, ADD_NODES)),
                (Some(values), None) => SpliceItems::Values(
                    values
                        .as_array()
                        .ok_or_else(|| invalid(ADD, "expected an array"))?
                        .clone(),
                ),
                (None, Some(ids)) => SpliceItems::Nodes(
                    ids.as_array()
                        .ok_or_else(|| invalid(ADD_NODES, "expected an array"))?
                        .iter()
                        .map(|id| {
                            id.as_u64()
                                .ok_or_else(|| invalid(ADD_NODES, "expected node ids"))
                        })
                        .collect::<Result<_, _>>()?,
                ),
                (None, None) => SpliceItems::None,
            };
            NodeChange::Splice {
                node,
                feature,
                index,
                remove,
                add,
            }
        }
        "clear" => NodeChange::Clear {
            node,
            feature: feature(obj)?,
        },
        other => return Err(DecodeError::UnknownType(other.to_owned())),
    })
}

/// Encodes a batch as a JSON array, preserving order.
pub fn encode_changes(changes: &[NodeChange]) -> Value {
    Value::Array(changes.iter().map(encode_change).collect())
}

/// Decodes a JSON array of records. The first bad record fails the batch.
pub fn decode_changes(value: &Value) -> Result<Vec<NodeChange>, DecodeError> {
    value
        .as_array()
        .ok_or_else(|| invalid("changes", "expected an array"))?
        .iter()
        .map(decode_change)
        .collect()
}

fn invalid(field: &'static str, reason: &str) -> DecodeError {
    DecodeError::InvalidField {
        field,
        reason: reason.to_owned(),
    }
}

fn node_id(obj: &Map<String, Value>, field: &'static str) -> Result<NodeId, DecodeError> {
    obj.get(field)
        .ok_or(DecodeError::MissingField(field))?
        .as_u64()
        .ok_or_else(|| invalid(field, "expected a node id"))
}

fn feature(obj: &Map<String, Value>) -> Result<FeatureId, DecodeError> {
    let raw = obj
        .get(FEAT)
        .ok_or(DecodeError::MissingField(FEAT))?
        .as_u64()
        .ok_or_else(|| invalid(FEAT, "expected a feature id"))?;
    FeatureId::try_from(raw).map_err(|_| invalid(FEAT, "feature id out of range"))
}

fn key(obj: &Map<String, Value>) -> Result<String, DecodeError> {
    obj.get(KEY)
        .ok_or(DecodeError::MissingField(KEY))?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| invalid(KEY, "expected a string"))
}

fn usize_field(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<usize>, DecodeError> {
    match obj.get(field) {
        None => Ok(None),
        Some(raw) => {
            let n = raw
                .as_u64()
                .ok_or_else(|| invalid(field, "expected a non-negative integer"))?;
            usize::try_from(n)
                .map(Some)
                .map_err(|_| invalid(field, "out of range"))
        }
    }
}

fn put_value(obj: &Map<String, Value>) -> Result<Option<FeatureValue>, DecodeError> {
    match (obj.get(VALUE), obj.get(NODE_VALUE)) {
        (Some(_), Some(_)) => Err(DecodeError::Conflicting(VALUE, NODE_VALUE)),
        (Some(v), None) => Ok(Some(FeatureValue::Value(v.clone()))),
        (None, Some(_)) => Ok(Some(FeatureValue::Node(node_id(obj, NODE_VALUE)?))),
        (None, None) => Ok(None),
    }
}
