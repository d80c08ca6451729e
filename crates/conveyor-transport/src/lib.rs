//! Transport and name-resolution seams for conveyor nodes.
//!
//! Nodes talk to each other only through a byte-oriented [`adapter::TransportAdapter`]
//! and resolve neighbour names through an injected [`directory::Directory`].

pub mod adapter;
pub mod directory;
