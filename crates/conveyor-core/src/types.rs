use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConveyorError;

/// Globally unique route-discovery query identifier.
pub type QueryId = String;

/// Short name of a conveyor node within its addressing scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Builds a node id, rejecting empty or whitespace-only names.
    pub fn new(name: impl Into<String>) -> Result<Self, ConveyorError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConveyorError::InvalidNodeId);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    /// Infallible conversion for literals; empty names are caught by config validation.
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl PartialEq<str> for NodeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NodeId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Lifecycle state of a conveyor node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Empty and ready to accept a pallet.
    #[default]
    Idle,
    /// Holding a pallet.
    Busy,
    /// Out of service.
    Down,
}

impl NodeStatus {
    /// Integer code carried by `CHANGE_STATE.new_state`.
    pub fn code(self) -> i64 {
        match self {
            NodeStatus::Idle => 0,
            NodeStatus::Busy => 1,
            NodeStatus::Down => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(NodeStatus::Idle),
            1 => Some(NodeStatus::Busy),
            2 => Some(NodeStatus::Down),
            _ => None,
        }
    }

    /// Reason carried by a REFUSE issued because of this status.
    pub fn refusal_reason(self) -> Option<&'static str> {
        match self {
            NodeStatus::Idle => None,
            NodeStatus::Busy => Some("BUSY"),
            NodeStatus::Down => Some("DOWN"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Idle => "IDLE",
            NodeStatus::Busy => "BUSY",
            NodeStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
