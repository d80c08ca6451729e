//! Deterministic virtual-clock simulation of a conveyor layout.

pub mod error;
pub mod layout;
pub mod network;

pub use error::SimError;
pub use layout::{factory_reference_layout, LayoutSpec, NodeSpec};
pub use network::{Simulation, OPERATOR};
