//! Core conveyor primitives shared across crates.
//!
//! Includes node identifiers, the node lifecycle status, and base errors.

pub mod error;
pub mod types;

pub use error::ConveyorError;
pub use types::{NodeId, NodeStatus, QueryId};
