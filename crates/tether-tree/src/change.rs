// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Change records emitted by a flush and replayed by mirrors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident::{FeatureId, NodeId};

/// Value stored in a map entry or list slot.
///
/// Scalars and node references are distinct variants so a scalar that happens
/// to look like a node id is never mistaken for a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureValue {
    /// JSON scalar/object/array payload.
    Value(Value),
    /// Reference to a child node.
    Node(NodeId),
}

impl FeatureValue {
    /// Node id when this is a reference.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            Self::Value(_) => None,
        }
    }

    /// JSON payload when this is a scalar.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Node(_) => None,
        }
    }
}

impl From<Value> for FeatureValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Items added by a splice. Homogeneous per list shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpliceItems {
    /// Pure removal.
    None,
    /// Scalar items (value lists).
    Values(Vec<Value>),
    /// Node references (node lists).
    Nodes(Vec<NodeId>),
}

impl SpliceItems {
    /// Number of added items.
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Values(v) => v.len(),
            Self::Nodes(n) => n.len(),
        }
    }

    /// Returns `true` when nothing is added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts to feature values in order.
    pub fn to_feature_values(&self) -> Vec<FeatureValue> {
        match self {
            Self::None => Vec::new(),
            Self::Values(v) => v.iter().cloned().map(FeatureValue::Value).collect(),
            Self::Nodes(n) => n.iter().copied().map(FeatureValue::Node).collect(),
        }
    }
}

/// One atomic change, tagged with the node that owns it.
///
/// Records are replayed strictly in emission order; list indexes are valid at
/// the moment the record was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeChange {
    /// The node became reachable from the root. Its full state follows.
    Attach {
        /// Node id.
        node: NodeId,
    },
    /// The node is no longer reachable from the root.
    Detach {
        /// Node id.
        node: NodeId,
    },
    /// Map entry set.
    Put {
        /// Owning node.
        node: NodeId,
        /// Map feature.
        feature: FeatureId,
        /// Entry key.
        key: String,
        /// Scalar or node reference.
        value: FeatureValue,
    },
    /// Server value replacing a client-proposed one. `None` means the key is
    /// absent on the server.
    PutOverride {
        /// Owning node.
        node: NodeId,
        /// Map feature.
        feature: FeatureId,
        /// Entry key.
        key: String,
        /// Authoritative value.
        value: Option<FeatureValue>,
    },
    /// Map entry removed.
    Remove {
        /// Owning node.
        node: NodeId,
        /// Map feature.
        feature: FeatureId,
        /// Entry key.
        key: String,
    },
    /// List splice: remove `remove` items at `index`, then insert `add` there.
    Splice {
        /// Owning node.
        node: NodeId,
        /// List feature.
        feature: FeatureId,
        /// Position at capture time.
        index: usize,
        /// Number of removed items.
        remove: usize,
        /// Inserted items.
        add: SpliceItems,
    },
    /// All list items removed.
    Clear {
        /// Owning node.
        node: NodeId,
        /// List feature.
        feature: FeatureId,
    },
}

impl NodeChange {
    /// Node the record is addressed to.
    pub fn node(&self) -> NodeId {
        match self {
            Self::Attach { node }
            | Self::Detach { node }
            | Self::Put { node, .. }
            | Self::PutOverride { node, .. }
            | Self::Remove { node, .. }
            | Self::Splice { node, .. }
            | Self::Clear { node, .. } => *node,
        }
    }

    /// Feature the record touches, if any.
    pub fn feature(&self) -> Option<FeatureId> {
        match self {
            Self::Attach { .. } | Self::Detach { .. } => None,
            Self::Put { feature, .. }
            | Self::PutOverride { feature, .. }
            | Self::Remove { feature, .. }
            | Self::Splice { feature, .. }
            | Self::Clear { feature, .. } => Some(*feature),
        }
    }

    /// Map key the record touches, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Put { key, .. } | Self::PutOverride { key, .. } | Self::Remove { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }

    /// Node ids referenced as values (not as owner).
    pub fn referenced_nodes(&self) -> Vec<NodeId> {
        match self {
            Self::Put {
                value: FeatureValue::Node(id),
                ..
            }
            | Self::PutOverride {
                value: Some(FeatureValue::Node(id)),
                ..
            } => vec![*id],
            Self::Splice {
                add: SpliceItems::Nodes(ids),
                ..
            } => ids.clone(),
            _ => Vec::new(),
        }
    }
}
