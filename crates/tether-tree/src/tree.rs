// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The state tree arena: node lifecycle, feature mutations and flushing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use indexmap::IndexSet;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::change::{FeatureValue, NodeChange};
use crate::error::TreeError;
use crate::feature::{FeatureShape, NodeType};
use crate::ident::{FeatureId, ListenerId, NodeId, ROOT_ID};
use crate::node::{ParentLink, StateNode};
use crate::storage::{FeatureData, NodeList, NodeMap};
use crate::view::{FeatureView, NodeView, TreeView};

/// Number of flushes a detached node survives before the GC sweep removes it.
pub const DEFAULT_GC_GRACE_CYCLES: u64 = 1;

/// Attach/detach notification delivered to lifecycle listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The node became reachable from the root.
    Attached {
        /// Node id.
        node: NodeId,
        /// `true` the first time the node is ever attached.
        initial: bool,
    },
    /// The node is no longer reachable from the root.
    Detached {
        /// Node id.
        node: NodeId,
    },
}

/// Result of [`StateTree::apply_client_put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPutOutcome {
    /// Value stored; the client already holds it so nothing is echoed.
    Accepted,
    /// Value refused; the server value is queued as a `PutOverride`.
    Overridden,
    /// Target no longer exists or is not attached.
    Ignored,
}

type LifecycleListener = Box<dyn FnMut(LifecycleEvent) + Send>;

struct Registration {
    id: ListenerId,
    on_attach: bool,
    listener: LifecycleListener,
}

#[derive(Clone, Copy)]
enum Want {
    Map,
    List,
    NodeList,
    ValueList,
}

impl Want {
    fn label(self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::List => "list",
            Self::NodeList => "node list",
            Self::ValueList => "value list",
        }
    }

    fn accepts(self, shape: FeatureShape) -> bool {
        match self {
            Self::Map => shape == FeatureShape::Map,
            Self::List => shape.is_list(),
            Self::NodeList => shape == FeatureShape::NodeList,
            Self::ValueList => shape == FeatureShape::ValueList,
        }
    }
}

fn require_shape(
    node: &StateNode,
    feature: FeatureId,
    want: Want,
) -> Result<FeatureShape, TreeError> {
    let shape = node.node_type.require(feature)?.shape;
    if want.accepts(shape) {
        Ok(shape)
    } else {
        Err(TreeError::ShapeMismatch {
            feature,
            expected: want.label(),
            actual: shape,
        })
    }
}

/// Arena of state nodes for one session.
///
/// Every mutation is recorded in the owning feature's tracker before it is
/// applied, and the node is queued in an ordered dirty set.
/// [`StateTree::collect_changes`] drains the queue in first-marked order.
pub struct StateTree {
    nodes: BTreeMap<NodeId, StateNode>,
    next_id: NodeId,
    dirty: IndexSet<NodeId>,
    subtree_marked: Vec<NodeId>,
    cycle: u64,
    gc_grace_cycles: u64,
    /// Detached nodes and the cycle in which they were detached.
    gc_pending: BTreeMap<NodeId, u64>,
    listeners: BTreeMap<NodeId, Vec<Registration>>,
    next_listener: ListenerId,
    events: Vec<LifecycleEvent>,
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("nodes", &self.nodes.len())
            .field("next_id", &self.next_id)
            .field("dirty", &self.dirty.len())
            .field("cycle", &self.cycle)
            .field("gc_pending", &self.gc_pending.len())
            .finish_non_exhaustive()
    }
}

impl StateTree {
    /// Creates a tree whose root (id [`ROOT_ID`]) has `root_type`.
    pub fn new(root_type: NodeType) -> Self {
        let mut root = StateNode::new(root_type);
        root.attached = true;
        root.ever_attached = true;
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_ID, root);
        let mut dirty = IndexSet::new();
        dirty.insert(ROOT_ID);
        Self {
            nodes,
            next_id: ROOT_ID + 1,
            dirty,
            subtree_marked: Vec::new(),
            cycle: 0,
            gc_grace_cycles: DEFAULT_GC_GRACE_CYCLES,
            gc_pending: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_listener: 0,
            events: Vec::new(),
        }
    }

    /// Overrides the GC grace period (in flush cycles).
    pub fn with_gc_grace(mut self, cycles: u64) -> Self {
        self.gc_grace_cycles = cycles;
        self
    }

    // --- Queries ------------------------------------------------------------

    /// Root node id.
    pub fn root(&self) -> NodeId {
        ROOT_ID
    }

    /// Returns `true` if `id` is registered (attached or awaiting GC).
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of completed flush cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Returns `true` when `id` is reachable from the root.
    pub fn is_attached(&self, id: NodeId) -> Result<bool, TreeError> {
        Ok(self.node_ref(id)?.attached)
    }

    /// Parent link of `id`, if any.
    pub fn parent(&self, id: NodeId) -> Result<Option<ParentLink>, TreeError> {
        Ok(self.node_ref(id)?.parent)
    }

    /// Node type of `id`.
    pub fn node_type(&self, id: NodeId) -> Result<&NodeType, TreeError> {
        Ok(&self.node_ref(id)?.node_type)
    }

    /// Child node ids of `id` across all features.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        Ok(self.node_ref(id)?.children())
    }

    /// Returns `true` when some node has unflushed changes.
    pub fn has_pending_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Returns `true` when `id` or one of its descendants changed since the last flush.
    pub fn subtree_has_changes(&self, id: NodeId) -> Result<bool, TreeError> {
        Ok(self.node_ref(id)?.subtree_dirty)
    }

    /// Pre-order walk of the subtree rooted at `id`.
    pub fn visit_subtree(
        &self,
        id: NodeId,
        mut visitor: impl FnMut(NodeId),
    ) -> Result<(), TreeError> {
        self.node_ref(id)?;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            visitor(current);
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
        }
        Ok(())
    }

    /// Map entry lookup. Reading never creates the feature.
    pub fn map_get(
        &self,
        id: NodeId,
        feature: FeatureId,
        key: &str,
    ) -> Result<Option<&FeatureValue>, TreeError> {
        let node = self.node_ref(id)?;
        require_shape(node, feature, Want::Map)?;
        Ok(match node.features.get(&feature) {
            Some(FeatureData::Map(map)) => map.get(key),
            _ => None,
        })
    }

    /// Map keys in insertion order.
    pub fn map_keys(&self, id: NodeId, feature: FeatureId) -> Result<Vec<String>, TreeError> {
        let node = self.node_ref(id)?;
        require_shape(node, feature, Want::Map)?;
        Ok(match node.features.get(&feature) {
            Some(FeatureData::Map(map)) => map.keys().map(str::to_owned).collect(),
            _ => Vec::new(),
        })
    }

    /// List items in order.
    pub fn list_items(&self, id: NodeId, feature: FeatureId) -> Result<&[FeatureValue], TreeError> {
        let node = self.node_ref(id)?;
        require_shape(node, feature, Want::List)?;
        Ok(match node.features.get(&feature) {
            Some(FeatureData::List(list)) => list.items(),
            _ => &[],
        })
    }

    /// List length.
    pub fn list_len(&self, id: NodeId, feature: FeatureId) -> Result<usize, TreeError> {
        Ok(self.list_items(id, feature)?.len())
    }

    // --- Node lifecycle -----------------------------------------------------

    /// Allocates a detached node of `node_type`.
    ///
    /// The node becomes attached once a reference to it is placed in an
    /// attached node's feature. Nodes never attached are collected like
    /// detached ones.
    pub fn create_node(&mut self, node_type: &NodeType) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, StateNode::new(node_type.clone()));
        self.gc_pending.insert(id, self.cycle);
        trace!(node = id, node_type = node_type.name(), "created node");
        id
    }

    /// Returns the shape of `feature` on `id`, creating its storage on first access.
    pub fn ensure_feature(
        &mut self,
        id: NodeId,
        feature: FeatureId,
    ) -> Result<FeatureShape, TreeError> {
        let node = self.node_mut(id)?;
        let shape = node.node_type.require(feature)?.shape;
        node.features
            .entry(feature)
            .or_insert_with(|| FeatureData::new(shape));
        Ok(shape)
    }

    /// Removes `id` from its parent feature, detaching its subtree.
    pub fn detach(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.unlink_from_parent(id)?;
        self.fire_events();
        Ok(())
    }

    /// Registers a listener fired whenever `id` becomes attached.
    pub fn add_attach_listener(
        &mut self,
        id: NodeId,
        listener: impl FnMut(LifecycleEvent) + Send + 'static,
    ) -> Result<ListenerId, TreeError> {
        self.add_listener(id, true, Box::new(listener))
    }

    /// Registers a listener fired whenever `id` becomes detached.
    pub fn add_detach_listener(
        &mut self,
        id: NodeId,
        listener: impl FnMut(LifecycleEvent) + Send + 'static,
    ) -> Result<ListenerId, TreeError> {
        self.add_listener(id, false, Box::new(listener))
    }

    /// Removes a lifecycle listener. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: NodeId, listener: ListenerId) -> bool {
        let Some(regs) = self.listeners.get_mut(&id) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| r.id != listener);
        regs.len() != before
    }

    fn add_listener(
        &mut self,
        id: NodeId,
        on_attach: bool,
        listener: LifecycleListener,
    ) -> Result<ListenerId, TreeError> {
        self.node_ref(id)?;
        let handle = self.next_listener;
        self.next_listener += 1;
        self.listeners.entry(id).or_default().push(Registration {
            id: handle,
            on_attach,
            listener,
        });
        Ok(handle)
    }

    // --- Map features -------------------------------------------------------

    /// Sets a scalar map entry.
    pub fn map_put(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), TreeError> {
        let previous = self
            .map_mut(id, feature)?
            .put(key.into(), FeatureValue::Value(value));
        self.mark_dirty(id);
        if let Some(FeatureValue::Node(old)) = previous {
            self.release_child(old);
        }
        self.fire_events();
        Ok(())
    }

    /// Places `child` under `key`. A child with another parent is moved.
    pub fn map_put_node(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        key: impl Into<String>,
        child: NodeId,
    ) -> Result<(), TreeError> {
        let key = key.into();
        self.check_children(id, &[child])?;
        if self.map_get(id, feature, &key)? == Some(&FeatureValue::Node(child)) {
            return Ok(());
        }
        self.unlink_from_parent(child)?;
        let previous = self.map_mut(id, feature)?.put(key, FeatureValue::Node(child));
        self.mark_dirty(id);
        if let Some(FeatureValue::Node(old)) = previous {
            self.release_child(old);
        }
        self.link_child(child, ParentLink { node: id, feature });
        self.fire_events();
        Ok(())
    }

    /// Removes a map entry, returning its previous value.
    pub fn map_remove(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        key: &str,
    ) -> Result<Option<FeatureValue>, TreeError> {
        let removed = self.map_mut(id, feature)?.remove(key);
        if removed.is_some() {
            self.mark_dirty(id);
        }
        if let Some(FeatureValue::Node(old)) = removed {
            self.release_child(old);
        }
        self.fire_events();
        Ok(removed)
    }

    // --- List features ------------------------------------------------------

    /// Inserts one value into a value list.
    pub fn list_insert(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        index: usize,
        value: Value,
    ) -> Result<(), TreeError> {
        self.list_insert_values(id, feature, index, vec![value])
    }

    /// Inserts values into a value list at `index`.
    pub fn list_insert_values(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        index: usize,
        values: Vec<Value>,
    ) -> Result<(), TreeError> {
        let list = self.list_mut(id, feature, Want::ValueList)?;
        if index > list.len() {
            return Err(TreeError::IndexOutOfBounds {
                index,
                len: list.len(),
            });
        }
        if values.is_empty() {
            return Ok(());
        }
        list.insert(index, values.into_iter().map(FeatureValue::Value).collect());
        self.mark_dirty(id);
        Ok(())
    }

    /// Inserts one child into a node list.
    pub fn list_insert_node(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        index: usize,
        child: NodeId,
    ) -> Result<(), TreeError> {
        self.list_insert_nodes(id, feature, index, &[child])
    }

    /// Inserts children into a node list at `index`.
    ///
    /// Children that already have a parent are removed from it first; `index`
    /// is interpreted after those removals.
    pub fn list_insert_nodes(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        index: usize,
        children: &[NodeId],
    ) -> Result<(), TreeError> {
        self.check_children(id, children)?;
        let here = ParentLink { node: id, feature };
        let len = {
            let node = self.node_ref(id)?;
            require_shape(node, feature, Want::NodeList)?;
            match node.features.get(&feature) {
                Some(FeatureData::List(list)) => list.len(),
                _ => 0,
            }
        };
        let moving_within = children
            .iter()
            .filter(|c| self.nodes.get(c).and_then(|n| n.parent) == Some(here))
            .count();
        let effective_len = len - moving_within;
        if index > effective_len {
            return Err(TreeError::IndexOutOfBounds {
                index,
                len: effective_len,
            });
        }
        if children.is_empty() {
            return Ok(());
        }
        for child in children {
            self.unlink_from_parent(*child)?;
        }
        let items = children.iter().copied().map(FeatureValue::Node).collect();
        self.list_mut(id, feature, Want::NodeList)?.insert(index, items);
        self.mark_dirty(id);
        for child in children {
            self.link_child(*child, here);
        }
        self.fire_events();
        Ok(())
    }

    /// Removes the item at `index`.
    pub fn list_remove(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        index: usize,
    ) -> Result<FeatureValue, TreeError> {
        let list = self.list_mut(id, feature, Want::List)?;
        if index >= list.len() {
            return Err(TreeError::IndexOutOfBounds {
                index,
                len: list.len(),
            });
        }
        let removed = list.remove(index);
        self.mark_dirty(id);
        if let FeatureValue::Node(child) = removed {
            self.release_child(child);
        }
        self.fire_events();
        Ok(removed)
    }

    /// Removes `remove` values at `index` from a value list and inserts `values` there.
    pub fn list_splice(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        index: usize,
        remove: usize,
        values: Vec<Value>,
    ) -> Result<Vec<Value>, TreeError> {
        let list = self.list_mut(id, feature, Want::ValueList)?;
        let len = list.len();
        if index > len || remove > len - index {
            return Err(TreeError::IndexOutOfBounds { index, len });
        }
        let removed: Vec<Value> = (0..remove)
            .filter_map(|_| match list.remove(index) {
                FeatureValue::Value(v) => Some(v),
                FeatureValue::Node(_) => None,
            })
            .collect();
        list.insert(index, values.into_iter().map(FeatureValue::Value).collect());
        self.mark_dirty(id);
        Ok(removed)
    }

    /// Removes every item of a list.
    pub fn list_clear(
        &mut self,
        id: NodeId,
        feature: FeatureId,
    ) -> Result<Vec<FeatureValue>, TreeError> {
        let removed = self.list_mut(id, feature, Want::List)?.clear();
        self.mark_dirty(id);
        for child in removed.iter().filter_map(FeatureValue::as_node) {
            self.release_child(child);
        }
        self.fire_events();
        Ok(removed)
    }

    // --- Client edits -------------------------------------------------------

    /// Applies a value proposed by the client.
    ///
    /// Accepted values are stored without a change record because the client
    /// already shows them. Values for features that are not client writable,
    /// or that would replace a node reference, are refused and the server
    /// value is sent back as a `PutOverride`.
    pub fn apply_client_put(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        key: &str,
        value: Value,
    ) -> Result<ClientPutOutcome, TreeError> {
        let Some(node) = self.nodes.get(&id) else {
            warn!(node = id, "client edit for unknown node ignored");
            return Ok(ClientPutOutcome::Ignored);
        };
        if !node.attached {
            warn!(node = id, "client edit for detached node ignored");
            return Ok(ClientPutOutcome::Ignored);
        }
        let Some(descriptor) = node.node_type.descriptor(feature) else {
            warn!(node = id, feature, "client edit for unconfigured feature ignored");
            return Ok(ClientPutOutcome::Ignored);
        };
        if descriptor.shape != FeatureShape::Map {
            warn!(node = id, feature, "client edit for list feature ignored");
            return Ok(ClientPutOutcome::Ignored);
        }
        let writable = descriptor.client_writable;
        let holds_node = matches!(self.map_get(id, feature, key)?, Some(FeatureValue::Node(_)));
        let map = self.map_mut(id, feature)?;
        if !writable || holds_node {
            map.mark_override(key);
            self.mark_dirty(id);
            debug!(node = id, feature, key, "client edit overridden");
            return Ok(ClientPutOutcome::Overridden);
        }
        map.put_untracked(key.to_owned(), FeatureValue::Value(value));
        Ok(ClientPutOutcome::Accepted)
    }

    // --- Flushing -----------------------------------------------------------

    /// Drains all pending changes in emission order and closes the cycle.
    ///
    /// A node that became attached emits `Attach` followed by its full state.
    /// Changes of nodes that are not attached are discarded; they are
    /// regenerated from scratch if the node is attached later.
    pub fn collect_changes(&mut self) -> Vec<NodeChange> {
        let mut out = Vec::new();
        let dirty: Vec<NodeId> = self.dirty.drain(..).collect();
        for id in dirty {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.attached != node.was_attached {
                if node.attached {
                    out.push(NodeChange::Attach { node: id });
                    node.clear_trackers();
                    node.generate_from_empty(id, &mut out);
                } else {
                    out.push(NodeChange::Detach { node: id });
                    node.clear_trackers();
                }
                node.was_attached = node.attached;
            } else if node.attached {
                node.drain_changes(id, &mut out);
            } else {
                node.clear_trackers();
            }
        }
        for id in self.subtree_marked.drain(..) {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.subtree_dirty = false;
            }
        }
        self.cycle += 1;
        let collected = self.gc_sweep();
        debug!(
            cycle = self.cycle,
            changes = out.len(),
            collected,
            "collected tree changes"
        );
        out
    }

    /// Full state of every attached node, parents before children.
    ///
    /// Used to rebuild a mirror from scratch; does not touch pending changes.
    pub fn collect_full_state(&self) -> Vec<NodeChange> {
        let mut out = Vec::new();
        let mut stack = vec![ROOT_ID];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            out.push(NodeChange::Attach { node: id });
            node.generate_from_empty(id, &mut out);
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Removes detached subtrees whose grace period has elapsed.
    ///
    /// Returns the number of nodes removed. Runs automatically at the end of
    /// every flush.
    pub fn gc_sweep(&mut self) -> usize {
        let expired: Vec<NodeId> = self
            .gc_pending
            .iter()
            .filter(|(_, detached_in)| **detached_in + self.gc_grace_cycles < self.cycle)
            .map(|(id, _)| *id)
            .collect();
        let mut removed = 0;
        for id in expired {
            let is_top = self
                .nodes
                .get(&id)
                .is_some_and(|n| n.parent.is_none() && !n.attached);
            if !is_top {
                continue;
            }
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                if let Some(node) = self.nodes.remove(&current) {
                    stack.extend(node.children());
                    removed += 1;
                }
                self.gc_pending.remove(&current);
                self.listeners.remove(&current);
                self.dirty.shift_remove(&current);
            }
        }
        removed
    }

    /// Canonical view of every attached node.
    pub fn view(&self) -> TreeView {
        let nodes = self
            .nodes
            .iter()
            .filter(|(_, node)| node.attached)
            .map(|(id, node)| NodeView {
                id: *id,
                parent: node.parent.map(|p| p.node),
                features: node
                    .features
                    .iter()
                    .filter(|(_, data)| !data.is_empty())
                    .map(|(feature, data)| FeatureView {
                        id: *feature,
                        content: data.content(),
                    })
                    .collect(),
            })
            .collect();
        TreeView { nodes }
    }

    // --- Internals ----------------------------------------------------------

    fn node_ref(&self, id: NodeId) -> Result<&StateNode, TreeError> {
        self.nodes.get(&id).ok_or(TreeError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut StateNode, TreeError> {
        self.nodes.get_mut(&id).ok_or(TreeError::UnknownNode(id))
    }

    fn map_mut(&mut self, id: NodeId, feature: FeatureId) -> Result<&mut NodeMap, TreeError> {
        let node = self.node_mut(id)?;
        let shape = require_shape(node, feature, Want::Map)?;
        match node
            .features
            .entry(feature)
            .or_insert_with(|| FeatureData::new(shape))
        {
            FeatureData::Map(map) => Ok(map),
            FeatureData::List(_) => Err(TreeError::ShapeMismatch {
                feature,
                expected: Want::Map.label(),
                actual: shape,
            }),
        }
    }

    fn list_mut(
        &mut self,
        id: NodeId,
        feature: FeatureId,
        want: Want,
    ) -> Result<&mut NodeList, TreeError> {
        let node = self.node_mut(id)?;
        let shape = require_shape(node, feature, want)?;
        match node
            .features
            .entry(feature)
            .or_insert_with(|| FeatureData::new(shape))
        {
            FeatureData::List(list) => Ok(list),
            FeatureData::Map(_) => Err(TreeError::ShapeMismatch {
                feature,
                expected: want.label(),
                actual: shape,
            }),
        }
    }

    fn check_children(&self, parent: NodeId, children: &[NodeId]) -> Result<(), TreeError> {
        self.node_ref(parent)?;
        let mut seen = BTreeSet::new();
        for &child in children {
            if child == ROOT_ID {
                return Err(TreeError::RootAsChild);
            }
            self.node_ref(child)?;
            if !seen.insert(child) {
                return Err(TreeError::DuplicateChild(child));
            }
            let mut cursor = Some(parent);
            while let Some(current) = cursor {
                if current == child {
                    return Err(TreeError::Cycle { child, parent });
                }
                cursor = self
                    .nodes
                    .get(&current)
                    .and_then(|n| n.parent)
                    .map(|p| p.node);
            }
        }
        Ok(())
    }

    /// Removes the reference to `child` from its parent's feature (recorded).
    fn unlink_from_parent(&mut self, child: NodeId) -> Result<(), TreeError> {
        let Some(link) = self.node_ref(child)?.parent else {
            return Ok(());
        };
        let parent = self.node_mut(link.node)?;
        match parent.features.get_mut(&link.feature) {
            Some(FeatureData::Map(map)) => {
                if let Some(key) = map.key_of(child) {
                    map.remove(&key);
                }
            }
            Some(FeatureData::List(list)) => {
                if let Some(index) = list.position(child) {
                    list.remove(index);
                }
            }
            None => {}
        }
        self.mark_dirty(link.node);
        self.release_child(child);
        Ok(())
    }

    fn release_child(&mut self, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = None;
        }
        self.refresh_attachment(child);
    }

    fn link_child(&mut self, child: NodeId, link: ParentLink) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(link);
        }
        self.refresh_attachment(child);
    }

    /// Propagates the attach state of `id`'s parent through its subtree.
    fn refresh_attachment(&mut self, id: NodeId) {
        let attached = match self.nodes.get(&id) {
            None => return,
            Some(node) => match node.parent {
                None => id == ROOT_ID,
                Some(link) => self.nodes.get(&link.node).is_some_and(|p| p.attached),
            },
        };
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if node.attached == attached {
                continue;
            }
            node.attached = attached;
            let initial = attached && !node.ever_attached;
            if attached {
                node.ever_attached = true;
            }
            let children = node.children();
            if attached {
                self.gc_pending.remove(&current);
                self.events.push(LifecycleEvent::Attached {
                    node: current,
                    initial,
                });
            } else {
                self.gc_pending.insert(current, self.cycle);
                self.events.push(LifecycleEvent::Detached { node: current });
            }
            self.mark_dirty(current);
            stack.extend(children);
        }
    }

    fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get_mut(&current) else {
                break;
            };
            if node.subtree_dirty {
                break;
            }
            node.subtree_dirty = true;
            self.subtree_marked.push(current);
            cursor = node.parent.map(|p| p.node);
        }
    }

    fn fire_events(&mut self) {
        let events = std::mem::take(&mut self.events);
        for event in events {
            let (node, on_attach) = match event {
                LifecycleEvent::Attached { node, .. } => (node, true),
                LifecycleEvent::Detached { node } => (node, false),
            };
            if let Some(regs) = self.listeners.get_mut(&node) {
                for reg in regs.iter_mut().filter(|r| r.on_attach == on_attach) {
                    (reg.listener)(event);
                }
            }
        }
    }

    /// Returns `true` when any feature of `id` holds unflushed records.
    #[cfg(test)]
    fn has_tracked_changes(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(StateNode::has_changes)
    }
}
