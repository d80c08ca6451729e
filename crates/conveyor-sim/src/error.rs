use thiserror::Error;

use conveyor_codec::CodecError;
use conveyor_core::ConveyorError;
use conveyor_node::NodeError;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("invalid layout: {0}")]
    Layout(String),
    #[error("layout parse error: {0}")]
    LayoutParse(#[from] toml::de::Error),
    #[error("layout encode error: {0}")]
    LayoutEncode(#[from] toml::ser::Error),
    #[error("invalid node: {0}")]
    Conveyor(#[from] ConveyorError),
    #[error("node error: {0}")]
    Node(#[from] NodeError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Event budget exhausted before the requested time was reached.
    #[error("no quiescence after {steps} steps at t={at_ms}ms")]
    Livelock { steps: usize, at_ms: u64 },
}
