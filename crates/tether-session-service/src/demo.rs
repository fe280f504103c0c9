// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Applications served by the hub, plus a small demo.

use serde_json::json;
use tether_tree::{
    FeatureDescriptor, FeatureId, FeatureRegistry, NodeType, StateTree, TreeError, ROOT_ID,
};

/// Builds a session's tree and advances it on push ticks.
pub trait App: Send + Sync {
    /// Tree for a new session.
    fn build(&self) -> Result<StateTree, TreeError>;
    /// One push tick. Changes go out with the following flush.
    fn tick(&self, tree: &mut StateTree) -> Result<(), TreeError>;
}

/// Properties map.
pub const PROPS: FeatureId = 0;
/// Child list of the root.
pub const ITEMS: FeatureId = 1;
/// Client-writable input map.
pub const INPUT: FeatureId = 2;

/// A root with a title, a tick counter, a rotating list of items and an
/// input map the client may write to.
#[derive(Debug, Clone)]
pub struct DemoApp {
    root: NodeType,
    item: NodeType,
    items: usize,
}

impl DemoApp {
    /// Demo with `items` list entries.
    pub fn new(items: usize) -> Result<Self, TreeError> {
        let registry = FeatureRegistry::new()
            .with(FeatureDescriptor::map(PROPS, "properties"))?
            .with(FeatureDescriptor::node_list(ITEMS, "items"))?
            .with(FeatureDescriptor::map(INPUT, "input").client_writable())?;
        Ok(Self {
            root: registry.node_type("demo-root", &[PROPS, ITEMS, INPUT])?,
            item: registry.node_type("demo-item", &[PROPS])?,
            items,
        })
    }
}

impl App for DemoApp {
    fn build(&self) -> Result<StateTree, TreeError> {
        let mut tree = StateTree::new(self.root.clone());
        tree.map_put(ROOT_ID, PROPS, "title", json!("Tether demo"))?;
        tree.map_put(ROOT_ID, PROPS, "ticks", json!(0))?;
        tree.map_put(ROOT_ID, INPUT, "text", json!(""))?;
        let mut children = Vec::with_capacity(self.items);
        for i in 0..self.items {
            let item = tree.create_node(&self.item);
            tree.map_put(item, PROPS, "label", json!(format!("item {i}")))?;
            children.push(item);
        }
        tree.list_insert_nodes(ROOT_ID, ITEMS, 0, &children)?;
        Ok(tree)
    }

    fn tick(&self, tree: &mut StateTree) -> Result<(), TreeError> {
        let ticks = tree
            .map_get(ROOT_ID, PROPS, "ticks")?
            .and_then(|v| v.as_value())
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
            + 1;
        tree.map_put(ROOT_ID, PROPS, "ticks", json!(ticks))?;
        let len = tree.list_len(ROOT_ID, ITEMS)?;
        if ticks % 5 == 0 && len > 1 {
            if let Some(first) = tree.list_items(ROOT_ID, ITEMS)?[0].as_node() {
                tree.list_insert_node(ROOT_ID, ITEMS, len - 1, first)?;
            }
        }
        Ok(())
    }
}
