// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]

use proptest::prelude::*;
use serde_json::{json, Value};
use tether_tree::{
    FeatureDescriptor, FeatureId, FeatureRegistry, FeatureValue, NodeChange, NodeType, SpliceItems,
    StateTree, ROOT_ID,
};

const PROPS: FeatureId = 0;
const CHILDREN: FeatureId = 1;
const CLASSES: FeatureId = 2;

fn element() -> NodeType {
    FeatureRegistry::new()
        .with(FeatureDescriptor::map(PROPS, "properties"))
        .unwrap()
        .with(FeatureDescriptor::node_list(CHILDREN, "children"))
        .unwrap()
        .with(FeatureDescriptor::value_list(CLASSES, "classes"))
        .unwrap()
        .node_type("element", &[PROPS, CHILDREN, CLASSES])
        .unwrap()
}

fn fresh_tree() -> StateTree {
    let mut tree = StateTree::new(element());
    tree.collect_changes();
    tree
}

/// Replays splice/clear records for one list onto `items`.
fn replay_list(
    items: &mut Vec<FeatureValue>,
    changes: &[NodeChange],
    node: u64,
    feature: FeatureId,
) {
    for change in changes {
        match change {
            NodeChange::Splice {
                node: n,
                feature: f,
                index,
                remove,
                add,
            } if *n == node && *f == feature => {
                items.splice(*index..*index + *remove, add.to_feature_values());
            }
            NodeChange::Clear { node: n, feature: f } if *n == node && *f == feature => {
                items.clear();
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, u8),
    Remove(usize),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..16, any::<u8>()).prop_map(|(i, v)| Op::Insert(i, v)),
        4 => (0usize..16).prop_map(Op::Remove),
        1 => Just(Op::Clear),
    ]
}

proptest! {
    #[test]
    fn value_list_changes_replay_to_current_items(
        seed in proptest::collection::vec(any::<u8>(), 0..6),
        cycles in proptest::collection::vec(proptest::collection::vec(op_strategy(), 0..24), 1..4),
    ) {
        let mut tree = fresh_tree();
        let mut mirror: Vec<FeatureValue> = Vec::new();
        let seeded = seed.iter().map(|v| json!(v)).collect();
        tree.list_insert_values(ROOT_ID, CLASSES, 0, seeded).unwrap();
        replay_list(&mut mirror, &tree.collect_changes(), ROOT_ID, CLASSES);

        for ops in cycles {
            for op in ops {
                let len = tree.list_len(ROOT_ID, CLASSES).unwrap();
                match op {
                    Op::Insert(i, v) => {
                        tree.list_insert(ROOT_ID, CLASSES, i % (len + 1), json!(v)).unwrap();
                    }
                    Op::Remove(i) if len > 0 => {
                        tree.list_remove(ROOT_ID, CLASSES, i % len).unwrap();
                    }
                    Op::Remove(_) => {}
                    Op::Clear => {
                        tree.list_clear(ROOT_ID, CLASSES).unwrap();
                    }
                }
            }
            replay_list(&mut mirror, &tree.collect_changes(), ROOT_ID, CLASSES);
            prop_assert_eq!(mirror.as_slice(), tree.list_items(ROOT_ID, CLASSES).unwrap());
        }
    }
}

#[test]
fn remove_then_insert_at_front_replays_in_order() {
    let mut tree = fresh_tree();
    let a = tree.create_node(&element());
    let b = tree.create_node(&element());
    let c = tree.create_node(&element());
    tree.list_insert_nodes(ROOT_ID, CHILDREN, 0, &[a, b]).unwrap();
    let mut mirror = Vec::new();
    replay_list(&mut mirror, &tree.collect_changes(), ROOT_ID, CHILDREN);

    tree.list_remove(ROOT_ID, CHILDREN, 0).unwrap();
    tree.list_insert_node(ROOT_ID, CHILDREN, 0, c).unwrap();
    let changes = tree.collect_changes();
    replay_list(&mut mirror, &changes, ROOT_ID, CHILDREN);

    assert_eq!(mirror, vec![FeatureValue::Node(c), FeatureValue::Node(b)]);
    let splices: Vec<&NodeChange> = changes
        .iter()
        .filter(|c| matches!(c, NodeChange::Splice { node, .. } if *node == ROOT_ID))
        .collect();
    assert_eq!(
        splices,
        vec![
            &NodeChange::Splice {
                node: ROOT_ID,
                feature: CHILDREN,
                index: 0,
                remove: 1,
                add: SpliceItems::None,
            },
            &NodeChange::Splice {
                node: ROOT_ID,
                feature: CHILDREN,
                index: 0,
                remove: 0,
                add: SpliceItems::Nodes(vec![c]),
            },
        ]
    );
}

#[test]
fn repeated_puts_collapse_to_the_last_value() {
    let mut tree = fresh_tree();
    tree.map_put(ROOT_ID, PROPS, "x", json!("a")).unwrap();
    tree.map_put(ROOT_ID, PROPS, "x", json!("b")).unwrap();
    let puts: Vec<Value> = tree
        .collect_changes()
        .into_iter()
        .filter_map(|c| match c {
            NodeChange::Put {
                value: FeatureValue::Value(v),
                ..
            } => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(puts, vec![json!("b")]);
}

#[test]
fn full_state_rebuilds_the_same_view_hash() {
    let mut tree = fresh_tree();
    let a = tree.create_node(&element());
    tree.list_insert_node(ROOT_ID, CHILDREN, 0, a).unwrap();
    tree.map_put(a, PROPS, "text", json!("hi")).unwrap();
    tree.list_insert(a, CLASSES, 0, json!("bold")).unwrap();
    tree.collect_changes();

    let full = tree.collect_full_state();
    assert!(matches!(full.first(), Some(NodeChange::Attach { node }) if *node == ROOT_ID));
    let before = tree.view().compute_hash().unwrap();
    tree.collect_changes();
    assert_eq!(tree.view().compute_hash().unwrap(), before);
}
