// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical, comparable view of a tree.
//!
//! Both the server tree and a client mirror can produce a [`TreeView`]; two
//! views are equal exactly when the observable states are equal.

use blake3::Hash;
use ciborium::ser::into_writer;
use serde::{Deserialize, Serialize};

use crate::change::FeatureValue;
use crate::error::TreeError;
use crate::ident::{FeatureId, Hash32, NodeId};

/// Content of one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureContent {
    /// Map entries sorted by key.
    Map(Vec<(String, FeatureValue)>),
    /// List items in order.
    List(Vec<FeatureValue>),
}

/// One non-empty feature of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureView {
    /// Feature id.
    pub id: FeatureId,
    /// Current content.
    pub content: FeatureContent,
}

/// One attached node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    /// Node id.
    pub id: NodeId,
    /// Parent node id (`None` for the root).
    pub parent: Option<NodeId>,
    /// Non-empty features in id order.
    pub features: Vec<FeatureView>,
}

/// All attached nodes sorted by id. Empty features are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeView {
    /// Nodes in id order.
    pub nodes: Vec<NodeView>,
}

impl TreeView {
    /// Looks up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&NodeView> {
        self.nodes
            .binary_search_by_key(&id, |n| n.id)
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// Serialize to canonical CBOR bytes.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, TreeError> {
        let mut view = self.clone();
        view.nodes.sort_by_key(|n| n.id);
        for node in &mut view.nodes {
            node.features.sort_by_key(|f| f.id);
        }
        let mut bytes = Vec::new();
        into_writer(&view, &mut bytes).map_err(|e| TreeError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Blake3 hash of the canonical form.
    pub fn compute_hash(&self) -> Result<Hash32, TreeError> {
        let h: Hash = blake3::hash(&self.to_canonical_bytes()?);
        Ok(h.into())
    }
}
