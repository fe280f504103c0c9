// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-side mirror of the server tree.
//!
//! The mirror is rebuilt purely from change records. A batch is applied to a
//! staging overlay and committed only if every record is valid and every
//! forward reference was resolved, so a rejected batch leaves the mirror
//! untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;
use tether_proto::{ClientEdit, ClientSeq};
use tether_tree::{
    FeatureContent, FeatureId, FeatureValue, FeatureView, ListenerId, NodeChange, NodeId,
    NodeView, SpliceItems, TreeView, ROOT_ID,
};
use thiserror::Error;
use tracing::debug;

/// Lifecycle of a mirrored node, driven only by records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Referenced before its `Attach` record arrived.
    PendingCreate,
    /// Created and reachable.
    Attached,
    /// `Detach` received; removed when the batch commits.
    DetachedPendingCleanup,
}

/// Feature content as seen by the client. Shape is inferred from the records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorFeature {
    /// Map entries in insertion order.
    Map(IndexMap<String, FeatureValue>),
    /// List items.
    List(Vec<FeatureValue>),
}

impl MirrorFeature {
    fn is_empty(&self) -> bool {
        match self {
            Self::Map(map) => map.is_empty(),
            Self::List(items) => items.is_empty(),
        }
    }

    fn children(&self) -> Vec<NodeId> {
        match self {
            Self::Map(map) => map.values().filter_map(FeatureValue::as_node).collect(),
            Self::List(items) => items.iter().filter_map(FeatureValue::as_node).collect(),
        }
    }

    fn content(&self) -> FeatureContent {
        match self {
            Self::Map(map) => {
                let mut entries: Vec<(String, FeatureValue)> =
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                FeatureContent::Map(entries)
            }
            Self::List(items) => FeatureContent::List(items.clone()),
        }
    }
}

/// One mirrored node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorNode {
    /// Node id.
    pub id: NodeId,
    /// Lifecycle state.
    pub state: NodeState,
    /// Node whose feature last referenced this one.
    pub parent: Option<NodeId>,
    /// Features by id.
    pub features: BTreeMap<FeatureId, MirrorFeature>,
}

impl MirrorNode {
    fn new(id: NodeId, state: NodeState) -> Self {
        Self {
            id,
            state,
            parent: None,
            features: BTreeMap::new(),
        }
    }

    fn children(&self) -> Vec<NodeId> {
        self.features.values().flat_map(MirrorFeature::children).collect()
    }
}

/// Reason a batch was rejected. The mirror is unchanged; callers resynchronize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// A record addressed a node that is not attached.
    #[error("record {index} addresses unknown node {node}")]
    UnknownNode {
        /// Position of the record in the batch.
        index: usize,
        /// Node id.
        node: NodeId,
    },
    /// A record does not fit the current content (shape or index).
    #[error("record {index} is invalid: {reason}")]
    Protocol {
        /// Position of the record in the batch.
        index: usize,
        /// What was wrong.
        reason: String,
    },
    /// A referenced node was never created in the batch.
    #[error("node {0} referenced but never created")]
    DanglingReference(NodeId),
    /// A non-root node is attached but no attached parent holds it.
    #[error("node {0} attached without a parent reference")]
    Unreferenced(NodeId),
}

/// Aggregate of what one applied message changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorChanges {
    /// Nodes that became attached.
    pub attached: BTreeSet<NodeId>,
    /// Nodes that were removed.
    pub detached: BTreeSet<NodeId>,
    /// Map entries written or removed.
    pub keys: BTreeSet<(NodeId, FeatureId, String)>,
    /// Lists spliced or cleared.
    pub lists: BTreeSet<(NodeId, FeatureId)>,
    /// The whole mirror was replaced from a snapshot.
    pub resynchronized: bool,
}

impl MirrorChanges {
    /// Returns `true` when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
            && self.detached.is_empty()
            && self.keys.is_empty()
            && self.lists.is_empty()
            && !self.resynchronized
    }

    /// Merges `other` into `self`.
    pub fn merge(&mut self, other: MirrorChanges) {
        self.attached.extend(other.attached);
        self.detached.extend(other.detached);
        self.keys.extend(other.keys);
        self.lists.extend(other.lists);
        self.resynchronized |= other.resynchronized;
    }
}

#[derive(Debug, Clone)]
struct PendingEdit {
    value: Value,
    sent_in: Option<ClientSeq>,
}

type ChangeListener = Box<dyn FnMut(&MirrorChanges) + Send>;

/// Staging overlay: nodes are copied from the committed set on first write.
struct Staging<'a> {
    base: &'a BTreeMap<NodeId, MirrorNode>,
    touched: BTreeMap<NodeId, MirrorNode>,
    changes: MirrorChanges,
}

impl<'a> Staging<'a> {
    fn new(base: &'a BTreeMap<NodeId, MirrorNode>) -> Self {
        Self {
            base,
            touched: BTreeMap::new(),
            changes: MirrorChanges::default(),
        }
    }

    fn get(&self, id: NodeId) -> Option<&MirrorNode> {
        self.touched.get(&id).or_else(|| self.base.get(&id))
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut MirrorNode> {
        if !self.touched.contains_key(&id) {
            let node = self.base.get(&id)?.clone();
            self.touched.insert(id, node);
        }
        self.touched.get_mut(&id)
    }

    fn attached_owner(&mut self, index: usize, id: NodeId) -> Result<&mut MirrorNode, ApplyError> {
        match self.get_mut(id) {
            Some(node) if node.state == NodeState::Attached => Ok(node),
            _ => Err(ApplyError::UnknownNode { index, node: id }),
        }
    }

    /// Points `child` at `parent`, creating a placeholder for unknown ids.
    fn reference(&mut self, parent: NodeId, child: NodeId) {
        match self.get_mut(child) {
            Some(node) => node.parent = Some(parent),
            None => {
                let mut node = MirrorNode::new(child, NodeState::PendingCreate);
                node.parent = Some(parent);
                self.touched.insert(child, node);
            }
        }
    }

    fn apply(&mut self, index: usize, change: &NodeChange) -> Result<(), ApplyError> {
        match change {
            NodeChange::Attach { node } => {
                let id = *node;
                match self.get_mut(id) {
                    Some(existing) => {
                        existing.state = NodeState::Attached;
                        existing.features.clear();
                    }
                    None => {
                        self.touched.insert(id, MirrorNode::new(id, NodeState::Attached));
                    }
                }
                self.changes.detached.remove(&id);
                self.changes.attached.insert(id);
            }
            NodeChange::Detach { node } => {
                let id = *node;
                let existing = self
                    .get_mut(id)
                    .ok_or(ApplyError::UnknownNode { index, node: id })?;
                existing.state = NodeState::DetachedPendingCleanup;
                self.changes.attached.remove(&id);
                self.changes.detached.insert(id);
            }
            NodeChange::Put {
                node,
                feature,
                key,
                value,
            } => {
                self.put(index, *node, *feature, key, Some(value))?;
            }
            NodeChange::PutOverride {
                node,
                feature,
                key,
                value,
            } => {
                self.put(index, *node, *feature, key, value.as_ref())?;
            }
            NodeChange::Remove { node, feature, key } => {
                self.put(index, *node, *feature, key, None)?;
            }
            NodeChange::Splice {
                node,
                feature,
                index: at,
                remove,
                add,
            } => {
                let owner = self.attached_owner(index, *node)?;
                let items = list_mut(owner, *feature, index)?;
                if *at > items.len() || *remove > items.len() - *at {
                    return Err(ApplyError::Protocol {
                        index,
                        reason: format!(
                            "splice {at}+{remove} outside list of length {}",
                            items.len()
                        ),
                    });
                }
                items.splice(*at..*at + *remove, add.to_feature_values());
                if let SpliceItems::Nodes(ids) = add {
                    for child in ids {
                        self.reference(*node, *child);
                    }
                }
                self.changes.lists.insert((*node, *feature));
            }
            NodeChange::Clear { node, feature } => {
                let owner = self.attached_owner(index, *node)?;
                list_mut(owner, *feature, index)?.clear();
                self.changes.lists.insert((*node, *feature));
            }
        }
        Ok(())
    }

    fn put(
        &mut self,
        index: usize,
        node: NodeId,
        feature: FeatureId,
        key: &str,
        value: Option<&FeatureValue>,
    ) -> Result<(), ApplyError> {
        let owner = self.attached_owner(index, node)?;
        let map = match owner
            .features
            .entry(feature)
            .or_insert_with(|| MirrorFeature::Map(IndexMap::new()))
        {
            MirrorFeature::Map(map) => map,
            MirrorFeature::List(_) => {
                return Err(ApplyError::Protocol {
                    index,
                    reason: format!("map record for list feature {feature}"),
                })
            }
        };
        match value {
            Some(value) => {
                map.insert(key.to_owned(), value.clone());
                if let FeatureValue::Node(child) = value {
                    self.reference(node, *child);
                }
            }
            None => {
                map.shift_remove(key);
            }
        }
        self.changes.keys.insert((node, feature, key.to_owned()));
        Ok(())
    }

    /// Checks references and returns the nodes to write back and to drop.
    fn finish(self) -> Result<(BTreeMap<NodeId, MirrorNode>, MirrorChanges), ApplyError> {
        for node in self.touched.values() {
            if node.state == NodeState::PendingCreate {
                return Err(ApplyError::DanglingReference(node.id));
            }
        }
        for node in self.touched.values() {
            if node.state != NodeState::Attached {
                continue;
            }
            for child in node.children() {
                if self.get(child).map(|c| c.state) != Some(NodeState::Attached) {
                    return Err(ApplyError::DanglingReference(child));
                }
            }
            if node.id != ROOT_ID && !self.held_by_parent(node) {
                return Err(ApplyError::Unreferenced(node.id));
            }
        }
        Ok((self.touched, self.changes))
    }

    fn held_by_parent(&self, node: &MirrorNode) -> bool {
        node.parent
            .and_then(|parent| self.get(parent))
            .is_some_and(|parent| {
                parent.state == NodeState::Attached && parent.children().contains(&node.id)
            })
    }
}

fn list_mut(
    owner: &mut MirrorNode,
    feature: FeatureId,
    index: usize,
) -> Result<&mut Vec<FeatureValue>, ApplyError> {
    match owner
        .features
        .entry(feature)
        .or_insert_with(|| MirrorFeature::List(Vec::new()))
    {
        MirrorFeature::List(items) => Ok(items),
        MirrorFeature::Map(_) => Err(ApplyError::Protocol {
            index,
            reason: format!("list record for map feature {feature}"),
        }),
    }
}

/// Mirror of one server tree plus the client's unconfirmed edits.
#[derive(Default)]
pub struct MirrorTree {
    nodes: BTreeMap<NodeId, MirrorNode>,
    pending: IndexMap<(NodeId, FeatureId, String), PendingEdit>,
    listeners: Vec<(ListenerId, ChangeListener)>,
    next_listener: ListenerId,
}

impl fmt::Debug for MirrorTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorTree")
            .field("nodes", &self.nodes.len())
            .field("pending", &self.pending.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl MirrorTree {
    /// Empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&MirrorNode> {
        self.nodes.get(&id)
    }

    /// Number of mirrored nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` before the first batch.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Confirmed map value.
    pub fn get(&self, id: NodeId, feature: FeatureId, key: &str) -> Option<&FeatureValue> {
        match self.nodes.get(&id)?.features.get(&feature)? {
            MirrorFeature::Map(map) => map.get(key),
            MirrorFeature::List(_) => None,
        }
    }

    /// Confirmed list items.
    pub fn list(&self, id: NodeId, feature: FeatureId) -> Option<&[FeatureValue]> {
        match self.nodes.get(&id)?.features.get(&feature)? {
            MirrorFeature::List(items) => Some(items),
            MirrorFeature::Map(_) => None,
        }
    }

    /// Applies one ordered batch, all or nothing.
    pub fn apply(&mut self, changes: &[NodeChange]) -> Result<MirrorChanges, ApplyError> {
        let mut staging = Staging::new(&self.nodes);
        for (index, change) in changes.iter().enumerate() {
            staging.apply(index, change)?;
        }
        let (touched, aggregate) = staging.finish()?;
        self.commit(touched, &aggregate);
        debug!(
            records = changes.len(),
            attached = aggregate.attached.len(),
            detached = aggregate.detached.len(),
            "applied batch"
        );
        self.notify(&aggregate);
        Ok(aggregate)
    }

    /// Replaces the whole mirror with a snapshot batch.
    pub fn replace_with_snapshot(
        &mut self,
        changes: &[NodeChange],
    ) -> Result<MirrorChanges, ApplyError> {
        let empty = BTreeMap::new();
        let mut staging = Staging::new(&empty);
        for (index, change) in changes.iter().enumerate() {
            staging.apply(index, change)?;
        }
        let (touched, mut aggregate) = staging.finish()?;
        let previous = std::mem::take(&mut self.nodes);
        for id in previous.keys() {
            if !touched.contains_key(id) {
                aggregate.detached.insert(*id);
            }
        }
        self.commit(touched, &aggregate);
        let nodes = &self.nodes;
        self.pending
            .retain(|(node, _, _), edit| edit.sent_in.is_none() && nodes.contains_key(node));
        aggregate.resynchronized = true;
        debug!(nodes = self.nodes.len(), "replaced mirror from snapshot");
        self.notify(&aggregate);
        Ok(aggregate)
    }

    fn commit(&mut self, touched: BTreeMap<NodeId, MirrorNode>, aggregate: &MirrorChanges) {
        for (id, node) in touched {
            if node.state == NodeState::DetachedPendingCleanup {
                self.nodes.remove(&id);
            } else {
                self.nodes.insert(id, node);
            }
        }
        for (node, feature, key) in &aggregate.keys {
            // the server's word wins over anything still pending for this key
            if let Some(edit) = self.pending.get(&(*node, *feature, key.clone())) {
                if edit.sent_in.is_none() {
                    continue;
                }
            }
            self.pending.shift_remove(&(*node, *feature, key.clone()));
        }
        self.pending
            .retain(|(node, _, _), _| !aggregate.detached.contains(node));
    }

    fn notify(&mut self, aggregate: &MirrorChanges) {
        if aggregate.is_empty() {
            return;
        }
        for (_, listener) in &mut self.listeners {
            listener(aggregate);
        }
    }

    /// Registers a listener fired once per applied message.
    pub fn on_change(
        &mut self,
        listener: impl FnMut(&MirrorChanges) + Send + 'static,
    ) -> ListenerId {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    /// Records a local edit shown immediately and sent with the next message.
    pub fn set_local(
        &mut self,
        node: NodeId,
        feature: FeatureId,
        key: &str,
        value: Value,
    ) -> Result<ClientEdit, ApplyError> {
        match self.nodes.get(&node) {
            Some(n) if n.state == NodeState::Attached => {}
            _ => return Err(ApplyError::UnknownNode { index: 0, node }),
        }
        let existing = self.nodes.get(&node).and_then(|n| n.features.get(&feature));
        if let Some(MirrorFeature::List(_)) = existing {
            return Err(ApplyError::Protocol {
                index: 0,
                reason: format!("local edit for list feature {feature}"),
            });
        }
        self.pending.shift_remove(&(node, feature, key.to_owned()));
        self.pending.insert(
            (node, feature, key.to_owned()),
            PendingEdit {
                value: value.clone(),
                sent_in: None,
            },
        );
        Ok(ClientEdit {
            node,
            feature,
            key: key.to_owned(),
            value,
        })
    }

    /// Pending value if any, else the confirmed value.
    pub fn effective_value(
        &self,
        node: NodeId,
        feature: FeatureId,
        key: &str,
    ) -> Option<FeatureValue> {
        if let Some(edit) = self.pending.get(&(node, feature, key.to_owned())) {
            return Some(FeatureValue::Value(edit.value.clone()));
        }
        self.get(node, feature, key).cloned()
    }

    /// Number of unconfirmed edits.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when some edit has not been sent yet.
    pub fn has_unsent_edits(&self) -> bool {
        self.pending.values().any(|e| e.sent_in.is_none())
    }

    /// Marks unsent edits as sent in message `seq` and returns them in order.
    pub fn take_unsent(&mut self, seq: ClientSeq) -> Vec<ClientEdit> {
        self.pending
            .iter_mut()
            .filter(|(_, edit)| edit.sent_in.is_none())
            .map(|((node, feature, key), edit)| {
                edit.sent_in = Some(seq);
                ClientEdit {
                    node: *node,
                    feature: *feature,
                    key: key.clone(),
                    value: edit.value.clone(),
                }
            })
            .collect()
    }

    /// Promotes edits sent before `next_expected` into the confirmed state.
    pub fn acknowledge(&mut self, next_expected: ClientSeq) {
        let confirmed: Vec<(NodeId, FeatureId, String, Value)> = self
            .pending
            .iter()
            .filter(|(_, e)| e.sent_in.is_some_and(|s| s < next_expected))
            .map(|((n, f, k), e)| (*n, *f, k.clone(), e.value.clone()))
            .collect();
        for (node, feature, key, value) in confirmed {
            self.pending.shift_remove(&(node, feature, key.clone()));
            if let Some(MirrorFeature::Map(map)) = self
                .nodes
                .get_mut(&node)
                .map(|n| {
                    n.features
                        .entry(feature)
                        .or_insert_with(|| MirrorFeature::Map(IndexMap::new()))
                })
            {
                map.insert(key, FeatureValue::Value(value));
            }
        }
    }

    /// Canonical view of the confirmed state, comparable with the server's.
    pub fn view(&self) -> TreeView {
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Attached)
            .map(|n| NodeView {
                id: n.id,
                parent: n.parent,
                features: n
                    .features
                    .iter()
                    .filter(|(_, f)| !f.is_empty())
                    .map(|(id, f)| FeatureView {
                        id: *id,
                        content: f.content(),
                    })
                    .collect(),
            })
            .collect();
        TreeView { nodes }
    }
}
