use std::collections::HashMap;

use conveyor_core::NodeId;

/// Resolves node names to transport addresses.
///
/// Implementations must be pure lookups; callers never cache results.
pub trait Directory {
    type Address;

    fn resolve(&self, node: &NodeId) -> Option<Self::Address>;
}

/// Directory where a node's address is its own name.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDirectory;

impl Directory for IdentityDirectory {
    type Address = String;

    fn resolve(&self, node: &NodeId) -> Option<String> {
        Some(node.as_str().to_string())
    }
}

/// Fixed name → address table.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    entries: HashMap<NodeId, String>,
}

impl StaticDirectory {
    pub fn insert(&mut self, node: NodeId, address: impl Into<String>) {
        self.entries.insert(node, address.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(NodeId, String)> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = (NodeId, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Directory for StaticDirectory {
    type Address = String;

    fn resolve(&self, node: &NodeId) -> Option<String> {
        self.entries.get(node).cloned()
    }
}

impl<D: Directory + ?Sized> Directory for &D {
    type Address = D::Address;

    fn resolve(&self, node: &NodeId) -> Option<Self::Address> {
        (**self).resolve(node)
    }
}
