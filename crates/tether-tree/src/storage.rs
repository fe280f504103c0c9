// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Feature storages with write-through change trackers.
//!
//! Each storage records the change *before* applying it, so list indexes in the
//! tracker are the indexes observed at the time of the call, never values
//! reconstructed from before/after snapshots.

use indexmap::{IndexMap, IndexSet};

use crate::change::{FeatureValue, NodeChange, SpliceItems};
use crate::feature::FeatureShape;
use crate::ident::{FeatureId, NodeId};
use crate::view::FeatureContent;

/// Map storage: insertion-ordered entries plus per-key origin tracking.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeMap {
    entries: IndexMap<String, FeatureValue>,
    /// Value each touched key had at the start of the cycle.
    origin: IndexMap<String, Option<FeatureValue>>,
    /// Keys whose server value must be re-sent as an override.
    overrides: IndexSet<String>,
}

impl NodeMap {
    pub(crate) fn get(&self, key: &str) -> Option<&FeatureValue> {
        self.entries.get(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub(crate) fn put(&mut self, key: String, value: FeatureValue) -> Option<FeatureValue> {
        self.track(&key);
        self.entries.insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<FeatureValue> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.track(key);
        self.entries.shift_remove(key)
    }

    /// Applies a value the client already holds; nothing is recorded.
    pub(crate) fn put_untracked(&mut self, key: String, value: FeatureValue) {
        self.entries.insert(key, value);
    }

    pub(crate) fn mark_override(&mut self, key: &str) {
        self.overrides.insert(key.to_owned());
    }

    pub(crate) fn key_of(&self, child: NodeId) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, v)| v.as_node() == Some(child))
            .map(|(k, _)| k.clone())
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.values().filter_map(FeatureValue::as_node)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn has_changes(&self) -> bool {
        !self.origin.is_empty() || !self.overrides.is_empty()
    }

    fn track(&mut self, key: &str) {
        if !self.origin.contains_key(key) {
            let current = self.entries.get(key).cloned();
            self.origin.insert(key.to_owned(), current);
        }
    }

    /// Last write wins per key; keys back at their origin value are elided.
    pub(crate) fn drain_changes(
        &mut self,
        node: NodeId,
        feature: FeatureId,
        out: &mut Vec<NodeChange>,
    ) {
        for (key, origin) in self.origin.drain(..) {
            if self.overrides.contains(&key) {
                continue;
            }
            let current = self.entries.get(&key);
            if current == origin.as_ref() {
                continue;
            }
            match current {
                Some(value) => out.push(NodeChange::Put {
                    node,
                    feature,
                    key,
                    value: value.clone(),
                }),
                None => out.push(NodeChange::Remove { node, feature, key }),
            }
        }
        for key in self.overrides.drain(..) {
            let value = self.entries.get(&key).cloned();
            out.push(NodeChange::PutOverride {
                node,
                feature,
                key,
                value,
            });
        }
    }

    pub(crate) fn generate(&self, node: NodeId, feature: FeatureId, out: &mut Vec<NodeChange>) {
        for (key, value) in &self.entries {
            out.push(NodeChange::Put {
                node,
                feature,
                key: key.clone(),
                value: value.clone(),
            });
        }
    }

    pub(crate) fn clear_tracker(&mut self) {
        self.origin.clear();
        self.overrides.clear();
    }

    pub(crate) fn content(&self) -> FeatureContent {
        let mut entries: Vec<(String, FeatureValue)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        FeatureContent::Map(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListOp {
    Insert { index: usize, items: Vec<FeatureValue> },
    Remove { index: usize, count: usize },
    Clear,
}

/// List storage with an index-faithful operation log.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeList {
    items: Vec<FeatureValue>,
    ops: Vec<ListOp>,
}

impl NodeList {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn items(&self) -> &[FeatureValue] {
        &self.items
    }

    pub(crate) fn position(&self, child: NodeId) -> Option<usize> {
        self.items.iter().position(|v| v.as_node() == Some(child))
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.items.iter().filter_map(FeatureValue::as_node)
    }

    #[cfg(test)]
    pub(crate) fn has_changes(&self) -> bool {
        !self.ops.is_empty()
    }

    /// Inserts at `index`; the caller has checked `index <= len`.
    pub(crate) fn insert(&mut self, index: usize, values: Vec<FeatureValue>) {
        if values.is_empty() {
            return;
        }
        self.record_insert(index, values.clone());
        self.items.splice(index..index, values);
    }

    /// Removes at `index`; the caller has checked `index < len`.
    pub(crate) fn remove(&mut self, index: usize) -> FeatureValue {
        self.record_remove(index);
        self.items.remove(index)
    }

    pub(crate) fn clear(&mut self) -> Vec<FeatureValue> {
        self.ops.clear();
        self.ops.push(ListOp::Clear);
        std::mem::take(&mut self.items)
    }

    fn record_insert(&mut self, index: usize, values: Vec<FeatureValue>) {
        if let Some(ListOp::Insert { index: at, items }) = self.ops.last_mut() {
            if *at + items.len() == index {
                items.extend(values);
                return;
            }
        }
        self.ops.push(ListOp::Insert {
            index,
            items: values,
        });
    }

    fn record_remove(&mut self, index: usize) {
        if self.cancel_pending_insert(index) {
            return;
        }
        if let Some(ListOp::Remove { index: at, count }) = self.ops.last_mut() {
            if *at == index {
                *count += 1;
                return;
            }
        }
        self.ops.push(ListOp::Remove { index, count: 1 });
    }

    /// If the item at `index` was inserted during this cycle, drop it from its
    /// insert record and re-index the records captured after that insert.
    fn cancel_pending_insert(&mut self, index: usize) -> bool {
        let mut pos = index;
        let mut found = None;
        for (k, op) in self.ops.iter().enumerate().rev() {
            match op {
                ListOp::Insert { index: at, items } => {
                    if pos >= at + items.len() {
                        pos -= items.len();
                    } else if pos >= *at {
                        found = Some((k, pos - at));
                        break;
                    }
                }
                ListOp::Remove { index: at, count } => {
                    if pos >= *at {
                        pos += count;
                    }
                }
                ListOp::Clear => break,
            }
        }
        let Some((k, offset)) = found else {
            return false;
        };
        let (mut pos, emptied) = match &mut self.ops[k] {
            ListOp::Insert { index: at, items } => {
                items.remove(offset);
                (*at + offset, items.is_empty())
            }
            _ => return false,
        };
        for op in &mut self.ops[k + 1..] {
            match op {
                ListOp::Insert { index: at, items } => {
                    if *at <= pos {
                        pos += items.len();
                    } else {
                        *at -= 1;
                    }
                }
                ListOp::Remove { index: at, count } => {
                    if *at > pos {
                        *at -= 1;
                    } else {
                        pos -= *count;
                    }
                }
                ListOp::Clear => {}
            }
        }
        if emptied {
            self.ops.remove(k);
        }
        true
    }

    pub(crate) fn drain_changes(
        &mut self,
        node: NodeId,
        feature: FeatureId,
        shape: FeatureShape,
        out: &mut Vec<NodeChange>,
    ) {
        for op in self.ops.drain(..) {
            out.push(match op {
                ListOp::Insert { index, items } => NodeChange::Splice {
                    node,
                    feature,
                    index,
                    remove: 0,
                    add: splice_items(shape, &items),
                },
                ListOp::Remove { index, count } => NodeChange::Splice {
                    node,
                    feature,
                    index,
                    remove: count,
                    add: SpliceItems::None,
                },
                ListOp::Clear => NodeChange::Clear { node, feature },
            });
        }
    }

    pub(crate) fn generate(
        &self,
        node: NodeId,
        feature: FeatureId,
        shape: FeatureShape,
        out: &mut Vec<NodeChange>,
    ) {
        if self.items.is_empty() {
            return;
        }
        out.push(NodeChange::Splice {
            node,
            feature,
            index: 0,
            remove: 0,
            add: splice_items(shape, &self.items),
        });
    }

    pub(crate) fn clear_tracker(&mut self) {
        self.ops.clear();
    }

    pub(crate) fn content(&self) -> FeatureContent {
        FeatureContent::List(self.items.clone())
    }
}

fn splice_items(shape: FeatureShape, items: &[FeatureValue]) -> SpliceItems {
    match shape {
        FeatureShape::NodeList => {
            SpliceItems::Nodes(items.iter().filter_map(FeatureValue::as_node).collect())
        }
        FeatureShape::ValueList | FeatureShape::Map => SpliceItems::Values(
            items
                .iter()
                .filter_map(|v| v.as_value().cloned())
                .collect(),
        ),
    }
}

/// Storage of one feature instance.
#[derive(Debug, Clone)]
pub(crate) enum FeatureData {
    Map(NodeMap),
    List(NodeList),
}

impl FeatureData {
    pub(crate) fn new(shape: FeatureShape) -> Self {
        match shape {
            FeatureShape::Map => Self::Map(NodeMap::default()),
            FeatureShape::NodeList | FeatureShape::ValueList => Self::List(NodeList::default()),
        }
    }

    pub(crate) fn children(&self) -> Vec<NodeId> {
        match self {
            Self::Map(map) => map.children().collect(),
            Self::List(list) => list.children().collect(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Map(map) => map.is_empty(),
            Self::List(list) => list.len() == 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn has_changes(&self) -> bool {
        match self {
            Self::Map(map) => map.has_changes(),
            Self::List(list) => list.has_changes(),
        }
    }

    pub(crate) fn clear_tracker(&mut self) {
        match self {
            Self::Map(map) => map.clear_tracker(),
            Self::List(list) => list.clear_tracker(),
        }
    }

    pub(crate) fn content(&self) -> FeatureContent {
        match self {
            Self::Map(map) => map.content(),
            Self::List(list) => list.content(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(s: &str) -> FeatureValue {
        FeatureValue::Value(json!(s))
    }

    fn drain(list: &mut NodeList) -> Vec<NodeChange> {
        let mut out = Vec::new();
        list.drain_changes(1, 0, FeatureShape::ValueList, &mut out);
        out
    }

    fn seeded(n: usize) -> NodeList {
        let mut list = NodeList::default();
        list.insert(0, (0..n).map(|i| v(&format!("item{i}"))).collect());
        list.clear_tracker();
        list
    }

    fn splice(index: usize, remove: usize, add: &[&str]) -> NodeChange {
        NodeChange::Splice {
            node: 1,
            feature: 0,
            index,
            remove,
            add: if add.is_empty() {
                SpliceItems::None
            } else {
                SpliceItems::Values(add.iter().map(|s| json!(s)).collect())
            },
        }
    }

    #[test]
    fn add_then_immediate_remove_is_discarded() {
        let mut list = seeded(3);
        list.insert(3, vec![v("foo")]);
        list.remove(3);
        assert!(drain(&mut list).is_empty());
    }

    #[test]
    fn remove_then_add_back_is_not_adjusted() {
        let mut list = seeded(3);
        let removed = list.remove(1);
        list.insert(2, vec![removed]);
        assert_eq!(
            drain(&mut list),
            vec![splice(1, 1, &[]), splice(2, 0, &["item1"])]
        );
    }

    #[test]
    fn removing_from_a_batch_insert_shrinks_it() {
        let mut list = seeded(2);
        list.insert(2, vec![v("a"), v("b"), v("c")]);
        list.remove(3);
        assert_eq!(drain(&mut list), vec![splice(2, 0, &["a", "c"])]);
    }

    #[test]
    fn later_inserts_are_reindexed_after_cancel() {
        let mut list = seeded(2);
        list.insert(2, vec![v("foo")]);
        list.insert(0, vec![v("head")]);
        list.insert(4, vec![v("tail")]);
        // foo now sits at index 3
        list.remove(3);
        assert_eq!(
            drain(&mut list),
            vec![splice(0, 0, &["head"]), splice(3, 0, &["tail"])]
        );
    }

    #[test]
    fn remove_in_between_keeps_the_pre_existing_remove() {
        let mut list = seeded(3);
        list.insert(3, vec![v("foo")]);
        list.remove(2);
        list.remove(2);
        assert_eq!(drain(&mut list), vec![splice(2, 1, &[])]);
    }

    #[test]
    fn clear_discards_earlier_records_and_later_cancel_stays_safe() {
        let mut list = seeded(3);
        list.insert(3, vec![v("foo")]);
        list.clear();
        list.insert(0, vec![v("bar")]);
        list.remove(0);
        assert_eq!(
            drain(&mut list),
            vec![NodeChange::Clear { node: 1, feature: 0 }]
        );
    }

    #[test]
    fn consecutive_removes_merge() {
        let mut list = seeded(4);
        list.remove(1);
        list.remove(1);
        assert_eq!(drain(&mut list), vec![splice(1, 2, &[])]);
        assert_eq!(list.items(), &[v("item0"), v("item3")]);
    }

    #[test]
    fn map_last_write_wins_and_restored_values_are_elided() {
        let mut map = NodeMap::default();
        map.put("x".into(), v("a"));
        map.put("x".into(), v("b"));
        map.put("y".into(), v("1"));
        map.remove("y");
        let mut out = Vec::new();
        map.drain_changes(1, 0, &mut out);
        assert_eq!(
            out,
            vec![NodeChange::Put {
                node: 1,
                feature: 0,
                key: "x".into(),
                value: v("b"),
            }]
        );

        map.put("x".into(), v("c"));
        map.put("x".into(), v("b"));
        let mut out = Vec::new();
        map.drain_changes(1, 0, &mut out);
        assert!(out.is_empty());
    }
}
