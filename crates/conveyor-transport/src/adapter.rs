use std::collections::VecDeque;
use std::future::Future;
use std::hash::Hash;

/// Coarse per-adapter transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_queued: u64,
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub last_error: Option<String>,
}

/// Byte-oriented transport contract used by the conveyor node runtime.
pub trait TransportAdapter {
    /// Opaque peer address used for replies/routing.
    type Peer: Clone + Eq + Hash;
    /// Transport-specific send error.
    type Error;

    /// Attempts best-effort delivery of a byte payload to a peer.
    fn send(&mut self, peer: &Self::Peer, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Returns the next inbound payload and its sending peer, without blocking.
    fn recv(&mut self) -> Option<(Self::Peer, Vec<u8>)>;

    /// Best-effort transport health counters.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// Transport that can also be awaited for inbound traffic.
pub trait AsyncTransportAdapter: TransportAdapter {
    /// Waits for the next inbound payload; `None` once the transport is closed.
    fn next_inbound(&mut self) -> impl Future<Output = Option<(Self::Peer, Vec<u8>)>> + Send;
}

/// In-memory adapter for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAdapter {
    inbound: VecDeque<(String, Vec<u8>)>,
    outbound: Vec<(String, Vec<u8>)>,
    drop_outbound: bool,
    send_ok: u64,
    send_err: u64,
    recv_ok: u64,
}

impl InMemoryAdapter {
    /// Queues bytes as inbound traffic from `peer`.
    pub fn enqueue_inbound(&mut self, peer: impl Into<String>, bytes: Vec<u8>) {
        self.inbound.push_back((peer.into(), bytes));
    }

    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&mut self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.outbound)
    }

    /// If enabled, outbound sends are dropped (loss simulation).
    pub fn set_drop_outbound(&mut self, drop_outbound: bool) {
        self.drop_outbound = drop_outbound;
    }
}

impl TransportAdapter for InMemoryAdapter {
    type Peer = String;
    type Error = &'static str;

    fn send(&mut self, peer: &Self::Peer, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.drop_outbound {
            self.send_err += 1;
            return Ok(());
        }
        self.outbound.push((peer.clone(), bytes.to_vec()));
        self.send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<(Self::Peer, Vec<u8>)> {
        let msg = self.inbound.pop_front();
        if msg.is_some() {
            self.recv_ok += 1;
        }
        msg
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_queued: self.outbound.len() as u64,
            outbound_send_ok: self.send_ok,
            outbound_send_err: self.send_err,
            inbound_received: self.recv_ok,
            last_error: None,
        }
    }
}
