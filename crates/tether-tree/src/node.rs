// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Arena record for one state node.

use std::collections::BTreeMap;

use crate::change::NodeChange;
use crate::feature::{FeatureShape, NodeType};
use crate::ident::{FeatureId, NodeId};
use crate::storage::FeatureData;

/// Identifier-based link from a child to the feature that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    /// Parent node.
    pub node: NodeId,
    /// Feature of the parent holding the reference.
    pub feature: FeatureId,
}

#[derive(Debug, Clone)]
pub(crate) struct StateNode {
    pub(crate) node_type: NodeType,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) features: BTreeMap<FeatureId, FeatureData>,
    /// Reachable from the root right now.
    pub(crate) attached: bool,
    /// Attach state reported by the previous flush.
    pub(crate) was_attached: bool,
    pub(crate) ever_attached: bool,
    /// Set when this node or one of its descendants has pending changes.
    pub(crate) subtree_dirty: bool,
}

impl StateNode {
    pub(crate) fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            parent: None,
            features: BTreeMap::new(),
            attached: false,
            was_attached: false,
            ever_attached: false,
            subtree_dirty: false,
        }
    }

    pub(crate) fn children(&self) -> Vec<NodeId> {
        self.features
            .values()
            .flat_map(FeatureData::children)
            .collect()
    }

    pub(crate) fn shape_of(&self, feature: FeatureId) -> FeatureShape {
        self.node_type
            .descriptor(feature)
            .map_or(FeatureShape::Map, |d| d.shape)
    }

    #[cfg(test)]
    pub(crate) fn has_changes(&self) -> bool {
        self.features.values().any(FeatureData::has_changes)
    }

    pub(crate) fn clear_trackers(&mut self) {
        for data in self.features.values_mut() {
            data.clear_tracker();
        }
    }

    pub(crate) fn drain_changes(&mut self, id: NodeId, out: &mut Vec<NodeChange>) {
        let shapes: Vec<(FeatureId, FeatureShape)> = self
            .features
            .keys()
            .map(|f| (*f, self.shape_of(*f)))
            .collect();
        for (feature, shape) in shapes {
            match self.features.get_mut(&feature) {
                Some(FeatureData::Map(map)) => map.drain_changes(id, feature, out),
                Some(FeatureData::List(list)) => list.drain_changes(id, feature, shape, out),
                None => {}
            }
        }
    }

    /// Emits the node's complete content as if every feature started empty.
    pub(crate) fn generate_from_empty(&self, id: NodeId, out: &mut Vec<NodeChange>) {
        for (feature, data) in &self.features {
            match data {
                FeatureData::Map(map) => map.generate(id, *feature, out),
                FeatureData::List(list) => {
                    list.generate(id, *feature, self.shape_of(*feature), out);
                }
            }
        }
    }
}
