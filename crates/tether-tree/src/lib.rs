// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server-side state tree shared between the Tether session host and its clients.
//!
//! A [`StateTree`] is an arena of state nodes. Each node carries typed feature
//! storages (insertion-ordered maps, ordered node/value lists) and records every
//! mutation into a per-feature change tracker *before* the in-memory update is
//! applied. [`StateTree::collect_changes`] drains those trackers into an ordered
//! list of [`NodeChange`] records that a client can replay to mirror the tree.
//!
//! Pure data shared with the client side (change records, feature values and the
//! canonical [`TreeView`]) lives next to the engine so both ends agree on one
//! vocabulary.

mod change;
mod error;
mod feature;
mod ident;
mod node;
mod storage;
mod tree;
mod view;

pub use change::{FeatureValue, NodeChange, SpliceItems};
pub use error::TreeError;
pub use feature::{FeatureDescriptor, FeatureRegistry, FeatureShape, NodeType};
pub use ident::{FeatureId, Hash32, ListenerId, NodeId, ROOT_ID};
pub use node::ParentLink;
pub use tree::{ClientPutOutcome, LifecycleEvent, StateTree, DEFAULT_GC_GRACE_CYCLES};
pub use view::{FeatureContent, FeatureView, NodeView, TreeView};
