//! Synchronous host glue: moves bytes between a transport adapter and a
//! node, resolving receivers through a directory.

use std::fmt;

use tracing::warn;

use conveyor_codec::{encode_envelope, Envelope};
use conveyor_transport::adapter::TransportAdapter;
use conveyor_transport::directory::Directory;

use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Inbound byte payloads handed to the node.
    pub inbound_messages: usize,
    /// Inbound payloads dropped as malformed.
    pub malformed_messages: usize,
    /// Timer wake-ups that produced output.
    pub timer_steps: usize,
    /// Envelopes handed to the transport successfully.
    pub sent_messages: usize,
    /// Envelopes whose receiver the directory could not resolve.
    pub unresolved_receivers: usize,
    /// Envelopes the transport refused to send.
    pub send_failures: usize,
}

/// Hands one inbound payload to the node.
pub fn deliver_inbound(
    node: &mut ConveyorNode,
    from: &str,
    bytes: &[u8],
    now_ms: u64,
    stats: &mut RuntimeStats,
) -> Result<Step, NodeError> {
    stats.inbound_messages += 1;
    let step = node.handle_bytes(from, bytes, now_ms)?;
    stats.malformed_messages += step
        .events
        .iter()
        .filter(|e| matches!(e, NodeEvent::MalformedDropped { .. }))
        .count();
    Ok(step)
}

/// Encodes and sends every outbound envelope. Unresolvable receivers and
/// send errors are counted and logged, never fatal.
pub fn flush_outbound<A, D>(
    node: &ConveyorNode,
    outbound: &[Envelope],
    adapter: &mut A,
    directory: &D,
    stats: &mut RuntimeStats,
) -> Result<(), NodeError>
where
    A: TransportAdapter,
    A::Error: fmt::Display,
    D: Directory<Address = A::Peer>,
{
    for envelope in outbound {
        let Some(address) = directory.resolve(&envelope.receiver) else {
            stats.unresolved_receivers += 1;
            warn!(node = %node.id(), receiver = %envelope.receiver, "receiver not in directory");
            continue;
        };
        let bytes = encode_envelope(envelope)?;
        match adapter.send(&address, &bytes) {
            Ok(()) => stats.sent_messages += 1,
            Err(err) => {
                stats.send_failures += 1;
                warn!(node = %node.id(), receiver = %envelope.receiver, error = %err, "send failed");
            }
        }
    }
    Ok(())
}

/// Receives at most one inbound payload, handles it, and flushes the
/// resulting envelopes. Returns `None` when nothing was waiting.
pub fn pump_once<A, D>(
    node: &mut ConveyorNode,
    adapter: &mut A,
    directory: &D,
    now_ms: u64,
    stats: &mut RuntimeStats,
) -> Result<Option<Step>, NodeError>
where
    A: TransportAdapter,
    A::Peer: fmt::Display,
    A::Error: fmt::Display,
    D: Directory<Address = A::Peer>,
{
    let Some((peer, bytes)) = adapter.recv() else {
        return Ok(None);
    };
    let step = deliver_inbound(node, &peer.to_string(), &bytes, now_ms, stats)?;
    flush_outbound(node, &step.outbound, adapter, directory, stats)?;
    Ok(Some(step))
}

/// Fires due timers and flushes their output.
pub fn tick<A, D>(
    node: &mut ConveyorNode,
    adapter: &mut A,
    directory: &D,
    now_ms: u64,
    stats: &mut RuntimeStats,
) -> Result<Step, NodeError>
where
    A: TransportAdapter,
    A::Error: fmt::Display,
    D: Directory<Address = A::Peer>,
{
    let step = node.fire_due(now_ms)?;
    if !step.is_empty() {
        stats.timer_steps += 1;
    }
    flush_outbound(node, &step.outbound, adapter, directory, stats)?;
    Ok(step)
}
