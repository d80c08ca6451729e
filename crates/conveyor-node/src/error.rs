use thiserror::Error;

use conveyor_codec::CodecError;
use conveyor_core::{ConveyorError, NodeId};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid node config: {0}")]
    Config(#[from] ConveyorError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Fatal; the host must stop the node.
    #[error("invariant violated on {node}: {detail}")]
    InvariantViolation { node: NodeId, detail: &'static str },
}

impl NodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::InvariantViolation { .. })
    }
}
