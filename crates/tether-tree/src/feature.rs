// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Feature descriptors and node type configuration.
//!
//! The registry is an explicit schema object built once at startup. Node types
//! are resolved against it so that every node knows up front which features it
//! may carry and what shape each one has.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::ident::FeatureId;

/// Storage shape of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureShape {
    /// Insertion-ordered string key to value map.
    Map,
    /// Ordered list of child node references.
    NodeList,
    /// Ordered list of JSON values.
    ValueList,
}

impl FeatureShape {
    /// Returns `true` for both list shapes.
    pub fn is_list(self) -> bool {
        matches!(self, Self::NodeList | Self::ValueList)
    }
}

/// Static description of one feature type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDescriptor {
    /// Wire identifier.
    pub id: FeatureId,
    /// Human readable name (unique within a registry).
    pub name: String,
    /// Storage shape.
    pub shape: FeatureShape,
    /// Whether clients may propose values for keys of this (map) feature.
    pub client_writable: bool,
}

impl FeatureDescriptor {
    /// Map feature descriptor.
    pub fn map(id: FeatureId, name: impl Into<String>) -> Self {
        Self::new(id, name, FeatureShape::Map)
    }

    /// Node list feature descriptor.
    pub fn node_list(id: FeatureId, name: impl Into<String>) -> Self {
        Self::new(id, name, FeatureShape::NodeList)
    }

    /// Value list feature descriptor.
    pub fn value_list(id: FeatureId, name: impl Into<String>) -> Self {
        Self::new(id, name, FeatureShape::ValueList)
    }

    /// Marks the feature as accepting client-proposed values.
    pub fn client_writable(mut self) -> Self {
        self.client_writable = true;
        self
    }

    fn new(id: FeatureId, name: impl Into<String>, shape: FeatureShape) -> Self {
        Self {
            id,
            name: name.into(),
            shape,
            client_writable: false,
        }
    }
}

/// Registry of all feature types known to an application.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    by_id: BTreeMap<FeatureId, FeatureDescriptor>,
    by_name: BTreeMap<String, FeatureId>,
}

impl FeatureRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor. Ids and names must be unique.
    pub fn register(&mut self, descriptor: FeatureDescriptor) -> Result<(), TreeError> {
        if self.by_id.contains_key(&descriptor.id) {
            return Err(TreeError::DuplicateFeature(format!("#{}", descriptor.id)));
        }
        if self.by_name.contains_key(&descriptor.name) {
            return Err(TreeError::DuplicateFeature(descriptor.name));
        }
        self.by_name.insert(descriptor.name.clone(), descriptor.id);
        self.by_id.insert(descriptor.id, descriptor);
        Ok(())
    }

    /// Builder-style [`FeatureRegistry::register`].
    pub fn with(mut self, descriptor: FeatureDescriptor) -> Result<Self, TreeError> {
        self.register(descriptor)?;
        Ok(self)
    }

    /// Looks up a descriptor by id.
    pub fn get(&self, id: FeatureId) -> Option<&FeatureDescriptor> {
        self.by_id.get(&id)
    }

    /// Looks up a descriptor by name.
    pub fn by_name(&self, name: &str) -> Option<&FeatureDescriptor> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Iterate over all descriptors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureDescriptor> {
        self.by_id.values()
    }

    /// Builds a node type allowing exactly `features`.
    pub fn node_type(&self, name: &str, features: &[FeatureId]) -> Result<NodeType, TreeError> {
        let mut allowed = BTreeMap::new();
        for id in features {
            let descriptor = self.get(*id).ok_or(TreeError::UnknownFeature(*id))?;
            allowed.insert(*id, descriptor.clone());
        }
        Ok(NodeType {
            name: Arc::from(name),
            features: Arc::new(allowed),
        })
    }
}

/// Set of features a node may carry. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeType {
    name: Arc<str>,
    features: Arc<BTreeMap<FeatureId, FeatureDescriptor>>,
}

impl NodeType {
    /// Type name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` when the type declares `feature`.
    pub fn allows(&self, feature: FeatureId) -> bool {
        self.features.contains_key(&feature)
    }

    /// Descriptor of a declared feature.
    pub fn descriptor(&self, feature: FeatureId) -> Option<&FeatureDescriptor> {
        self.features.get(&feature)
    }

    /// Declared features in id order.
    pub fn features(&self) -> impl Iterator<Item = &FeatureDescriptor> {
        self.features.values()
    }

    pub(crate) fn require(&self, feature: FeatureId) -> Result<&FeatureDescriptor, TreeError> {
        self.descriptor(feature)
            .ok_or_else(|| TreeError::FeatureNotConfigured {
                node_type: self.name.to_string(),
                feature,
            })
    }
}
