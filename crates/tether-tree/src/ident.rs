// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

/// Tree-unique node identifier. Allocated monotonically, never reused.
pub type NodeId = u64;
/// Feature identifier assigned by the [`crate::FeatureRegistry`].
pub type FeatureId = u16;
/// Handle returned when registering a lifecycle listener.
pub type ListenerId = u64;
/// Blake3 digest (32 bytes).
pub type Hash32 = [u8; 32];

/// Identifier of the root node of every tree.
pub const ROOT_ID: NodeId = 1;
