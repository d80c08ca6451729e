//! Conveyor node agent: lifecycle, pallet hand-off, and route discovery.
//!
//! Each node is a single-owner state machine. Hosts feed it inbound bytes and
//! timer wake-ups; it answers with outbound envelopes and observable events.

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod node;
pub mod runtime;
pub mod service;
pub mod state;
pub mod timers;
pub mod transfer;
pub mod watchdog;

pub use config::{NodeConfig, NodeTimings, StallReroutePolicy};
pub use error::NodeError;
pub use events::NodeEvent;
pub use node::{ConveyorNode, Step};
