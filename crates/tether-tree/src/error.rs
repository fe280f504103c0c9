// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type for tree construction and mutation.

use thiserror::Error;

use crate::feature::FeatureShape;
use crate::ident::{FeatureId, NodeId};

/// Errors returned by [`crate::StateTree`] and [`crate::FeatureRegistry`].
///
/// Configuration errors ([`TreeError::is_configuration`]) signal a node used
/// for a capability its type does not declare. They are programming errors and
/// must not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The node's type does not declare the requested feature.
    #[error("feature {feature} is not configured for node type `{node_type}`")]
    FeatureNotConfigured {
        /// Name of the node type.
        node_type: String,
        /// Requested feature id.
        feature: FeatureId,
    },
    /// A map operation was used on a list feature or vice versa.
    #[error("feature {feature} has shape {actual:?}, expected {expected}")]
    ShapeMismatch {
        /// Feature id.
        feature: FeatureId,
        /// Shape the operation needs.
        expected: &'static str,
        /// Shape the feature was registered with.
        actual: FeatureShape,
    },
    /// Feature id not present in the registry.
    #[error("unknown feature id {0}")]
    UnknownFeature(FeatureId),
    /// Feature id or name registered twice.
    #[error("duplicate feature registration `{0}`")]
    DuplicateFeature(String),
    /// Node id not present in the tree (never allocated or already collected).
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// List index outside `0..=len` (insert) or `0..len` (remove).
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds {
        /// Offending index.
        index: usize,
        /// List length at the time of the call.
        len: usize,
    },
    /// Inserting `child` under `parent` would make it its own ancestor.
    #[error("node {child} cannot be placed under its own descendant {parent}")]
    Cycle {
        /// Node being inserted.
        child: NodeId,
        /// Intended parent.
        parent: NodeId,
    },
    /// The root node can never be a child.
    #[error("the root node cannot be a child")]
    RootAsChild,
    /// The same node appears twice in a single insertion.
    #[error("node {0} appears twice in one insertion")]
    DuplicateChild(NodeId),
    /// Canonical encoding of a view failed.
    #[error("canonical encoding failed: {0}")]
    Encode(String),
}

impl TreeError {
    /// Returns `true` for errors caused by a wrong node/feature configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::FeatureNotConfigured { .. }
                | Self::ShapeMismatch { .. }
                | Self::UnknownFeature(_)
                | Self::DuplicateFeature(_)
        )
    }
}
