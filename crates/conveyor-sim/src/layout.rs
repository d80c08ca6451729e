use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use conveyor_core::NodeStatus;
use conveyor_node::NodeConfig;

use crate::error::SimError;

/// A conveyor layout: the nodes and their downstream links.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSpec {
    #[serde(rename = "node", default)]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub neighbours: Vec<String>,
    pub transfer_ms: u64,
    #[serde(default, skip_serializing_if = "is_idle")]
    pub initial_state: NodeStatus,
}

fn is_idle(status: &NodeStatus) -> bool {
    *status == NodeStatus::Idle
}

impl NodeSpec {
    pub fn new(id: &str, neighbours: &[&str], transfer_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            neighbours: neighbours.iter().map(|n| n.to_string()).collect(),
            transfer_ms,
            initial_state: NodeStatus::Idle,
        }
    }

    pub fn with_state(mut self, state: NodeStatus) -> Self {
        self.initial_state = state;
        self
    }
}

impl LayoutSpec {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self { nodes }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SimError> {
        let layout: LayoutSpec = toml::from_str(text)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn to_toml_string(&self) -> Result<String, SimError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects duplicate ids and links to nodes outside the layout.
    pub fn validate(&self) -> Result<(), SimError> {
        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(SimError::Layout(format!("duplicate node {}", node.id)));
            }
        }
        for node in &self.nodes {
            if let Some(missing) = node.neighbours.iter().find(|n| !ids.contains(n.as_str())) {
                return Err(SimError::Layout(format!(
                    "{} links to unknown node {missing}",
                    node.id
                )));
            }
        }
        Ok(())
    }

    pub fn node_configs(&self) -> Result<Vec<NodeConfig>, SimError> {
        self.nodes
            .iter()
            .map(|n| Ok(NodeConfig::new(&n.id, &n.neighbours, n.transfer_ms)?))
            .collect()
    }
}

/// The 14-conveyor factory loop used for end-to-end runs.
///
/// CNV1..CNV12 form the main loop; CNV3 and CNV8 branch, and CNV13/CNV14
/// are bypass segments.
pub fn factory_reference_layout() -> LayoutSpec {
    LayoutSpec::new(vec![
        NodeSpec::new("CNV1", &["CNV2"], 3_500),
        NodeSpec::new("CNV2", &["CNV3"], 8_000),
        NodeSpec::new("CNV3", &["CNV4", "CNV13"], 2_000),
        NodeSpec::new("CNV4", &["CNV5"], 5_000),
        NodeSpec::new("CNV5", &["CNV6"], 4_000),
        NodeSpec::new("CNV6", &["CNV7"], 4_000),
        NodeSpec::new("CNV7", &["CNV8"], 6_000),
        NodeSpec::new("CNV8", &["CNV9", "CNV14"], 2_000),
        NodeSpec::new("CNV9", &["CNV10"], 2_000),
        NodeSpec::new("CNV10", &["CNV11"], 3_000),
        NodeSpec::new("CNV11", &["CNV12"], 4_000),
        NodeSpec::new("CNV12", &["CNV1"], 3_000),
        NodeSpec::new("CNV13", &["CNV9", "CNV14"], 5_000),
        NodeSpec::new("CNV14", &["CNV12"], 5_000),
    ])
}

#[cfg(test)]
mod tests {
    use conveyor_core::NodeStatus;

    use super::{factory_reference_layout, LayoutSpec, NodeSpec};
    use crate::error::SimError;

    #[test]
    fn reference_layout_is_valid() {
        let layout = factory_reference_layout();
        assert_eq!(layout.nodes.len(), 14);
        layout.validate().expect("reference layout should validate");
        let configs = layout.node_configs().expect("configs should build");
        assert_eq!(configs[2].neighbours.len(), 2);
    }

    #[test]
    fn toml_round_trip_keeps_states() {
        let layout = LayoutSpec::new(vec![
            NodeSpec::new("A", &["B"], 100),
            NodeSpec::new("B", &[], 100).with_state(NodeStatus::Down),
        ]);
        let text = layout.to_toml_string().expect("layout should encode");
        assert!(text.contains("[[node]]"));
        assert!(text.contains("initial_state = \"DOWN\""));
        assert_eq!(LayoutSpec::from_toml_str(&text).expect("layout should parse"), layout);
    }

    #[test]
    fn dangling_and_duplicate_nodes_are_rejected() {
        let dangling = "[[node]]\nid = \"A\"\nneighbours = [\"Q\"]\ntransfer_ms = 1\n";
        assert!(matches!(
            LayoutSpec::from_toml_str(dangling),
            Err(SimError::Layout(_))
        ));
        let duplicate = LayoutSpec::new(vec![
            NodeSpec::new("A", &[], 1),
            NodeSpec::new("A", &[], 1),
        ]);
        assert!(duplicate.validate().is_err());
    }
}
