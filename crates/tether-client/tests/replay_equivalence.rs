// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]

use std::time::Instant;

use proptest::prelude::*;
use serde_json::json;
use tether_app_core::settings::ClientSettings;
use tether_client::{ApplyError, MessageHandler, MirrorTree};
use tether_proto::{decode_response, ServerMessage};
use tether_tree::{
    FeatureDescriptor, FeatureId, FeatureRegistry, FeatureValue, NodeChange, NodeId, NodeType,
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

/// Flushes `tree` through the text encoding, as a real host would.
fn ship(tree: &mut StateTree, sync_id: u64) -> Vec<NodeChange> {
    let text = ServerMessage::delta(sync_id, tree.collect_changes()).encode_wrapped();
    let mut decoded = decode_response(&text).unwrap();
    decoded.remove(0).changes
}

fn synced() -> (StateTree, MirrorTree) {
    let mut tree = StateTree::new(element());
    let mut mirror = MirrorTree::new();
    mirror.apply(&ship(&mut tree, 0)).unwrap();
    (tree, mirror)
}

#[test]
fn mirror_matches_tree_after_every_flush() {
    let (mut tree, mut mirror) = synced();
    let ty = element();
    let a = tree.create_node(&ty);
    let b = tree.create_node(&ty);
    tree.map_put(a, PROPS, "text", json!("first")).unwrap();
    tree.list_insert_nodes(ROOT_ID, CHILDREN, 0, &[a, b]).unwrap();
    tree.list_insert(b, CLASSES, 0, json!("wide")).unwrap();
    mirror.apply(&ship(&mut tree, 1)).unwrap();
    assert_eq!(mirror.view(), tree.view());

    tree.detach(a).unwrap();
    tree.map_put_node(ROOT_ID, PROPS, "header", b).unwrap();
    mirror.apply(&ship(&mut tree, 2)).unwrap();
    assert_eq!(mirror.view(), tree.view());
    assert!(mirror.node(a).is_none());

    tree.list_insert_node(ROOT_ID, CHILDREN, 0, a).unwrap();
    mirror.apply(&ship(&mut tree, 3)).unwrap();
    assert_eq!(mirror.view(), tree.view());
    assert_eq!(
        mirror.get(a, PROPS, "text"),
        Some(&FeatureValue::Value(json!("first")))
    );
    assert_eq!(mirror.view().compute_hash().unwrap(), tree.view().compute_hash().unwrap());
}

#[test]
fn resync_is_idempotent() {
    let (mut tree, mut mirror) = synced();
    let child = tree.create_node(&element());
    tree.map_put(child, PROPS, "x", json!(1)).unwrap();
    tree.list_insert_node(ROOT_ID, CHILDREN, 0, child).unwrap();
    mirror.apply(&ship(&mut tree, 1)).unwrap();

    let snapshot = tree.collect_full_state();
    mirror.replace_with_snapshot(&snapshot).unwrap();
    let once = mirror.view();
    mirror.replace_with_snapshot(&snapshot).unwrap();
    assert_eq!(mirror.view(), once);
    assert_eq!(once, tree.view());
}

#[test]
fn last_write_wins_across_a_flush() {
    let (mut tree, mut mirror) = synced();
    tree.map_put(ROOT_ID, PROPS, "x", json!("a")).unwrap();
    tree.map_put(ROOT_ID, PROPS, "x", json!("b")).unwrap();
    let changes = ship(&mut tree, 1);
    assert_eq!(changes.len(), 1);
    mirror.apply(&changes).unwrap();
    assert_eq!(
        mirror.get(ROOT_ID, PROPS, "x"),
        Some(&FeatureValue::Value(json!("b")))
    );
}

#[test]
fn remove_then_insert_at_front_keeps_list_order() {
    let (mut tree, mut mirror) = synced();
    tree.list_insert(ROOT_ID, CLASSES, 0, json!("A")).unwrap();
    tree.list_insert(ROOT_ID, CLASSES, 1, json!("B")).unwrap();
    mirror.apply(&ship(&mut tree, 1)).unwrap();

    tree.list_remove(ROOT_ID, CLASSES, 0).unwrap();
    tree.list_insert(ROOT_ID, CLASSES, 0, json!("C")).unwrap();
    mirror.apply(&ship(&mut tree, 2)).unwrap();
    assert_eq!(
        mirror.list(ROOT_ID, CLASSES).unwrap(),
        &[
            FeatureValue::Value(json!("C")),
            FeatureValue::Value(json!("B"))
        ][..]
    );
}

#[test]
fn forward_reference_in_one_batch_resolves() {
    let mut mirror = MirrorTree::new();
    let batch = vec![
        NodeChange::Attach { node: 1 },
        NodeChange::Put {
            node: 1,
            feature: PROPS,
            key: "slot".into(),
            value: FeatureValue::Node(5),
        },
        NodeChange::Attach { node: 5 },
    ];
    mirror.apply(&batch).unwrap();
    assert_eq!(mirror.node(5).and_then(|n| n.parent), Some(1));
}

#[test]
fn dangling_reference_is_rejected_and_handler_resyncs() {
    let now = Instant::now();
    let mut handler = MessageHandler::new(ClientSettings::default());
    let start = ServerMessage::snapshot(0, vec![NodeChange::Attach { node: 1 }]);
    handler.handle_text(&start.encode_wrapped(), now);

    let bad = vec![NodeChange::Put {
        node: 1,
        feature: PROPS,
        key: "slot".into(),
        value: FeatureValue::Node(8),
    }];
    assert_eq!(
        MirrorTree::new().apply(&[vec![NodeChange::Attach { node: 1 }], bad.clone()].concat()),
        Err(ApplyError::DanglingReference(8))
    );
    let report = handler.handle_text(&ServerMessage::delta(1, bad).encode_wrapped(), now);
    assert!(report.resync.is_some());

    let msg = handler.build_message().unwrap();
    assert!(msg.resynchronize);
}

#[derive(Debug, Clone)]
enum Op {
    Put(u8, i64),
    Remove(u8),
    AddChild(usize),
    DropChild(usize),
    Class(usize, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, any::<i64>()).prop_map(|(k, v)| Op::Put(k, v)),
        (0u8..4).prop_map(Op::Remove),
        (0usize..6).prop_map(Op::AddChild),
        (0usize..6).prop_map(Op::DropChild),
        (0usize..6, any::<u8>()).prop_map(|(i, v)| Op::Class(i, v)),
    ]
}

fn apply_op(tree: &mut StateTree, ty: &NodeType, op: &Op) {
    match op {
        Op::Put(k, v) => tree.map_put(ROOT_ID, PROPS, format!("k{k}"), json!(v)).unwrap(),
        Op::Remove(k) => {
            tree.map_remove(ROOT_ID, PROPS, &format!("k{k}")).unwrap();
        }
        Op::AddChild(i) => {
            let len = tree.list_len(ROOT_ID, CHILDREN).unwrap();
            let child: NodeId = tree.create_node(ty);
            tree.map_put(child, PROPS, "n", json!(child)).unwrap();
            tree.list_insert_node(ROOT_ID, CHILDREN, (*i).min(len), child).unwrap();
        }
        Op::DropChild(i) => {
            let len = tree.list_len(ROOT_ID, CHILDREN).unwrap();
            if len > 0 {
                tree.list_remove(ROOT_ID, CHILDREN, *i % len).unwrap();
            }
        }
        Op::Class(i, v) => {
            let len = tree.list_len(ROOT_ID, CLASSES).unwrap();
            tree.list_insert(ROOT_ID, CLASSES, (*i).min(len), json!(v)).unwrap();
        }
    }
}

proptest! {
    #[test]
    fn random_edits_round_trip(
        cycles in proptest::collection::vec(proptest::collection::vec(op_strategy(), 0..12), 1..5),
    ) {
        let ty = element();
        let (mut tree, mut mirror) = synced();
        for (i, ops) in cycles.iter().enumerate() {
            for op in ops {
                apply_op(&mut tree, &ty, op);
            }
            mirror.apply(&ship(&mut tree, i as u64 + 1)).unwrap();
            prop_assert_eq!(mirror.view(), tree.view());
        }
    }
}
