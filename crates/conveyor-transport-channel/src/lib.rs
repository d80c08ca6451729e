//! In-process transport over tokio unbounded channels.
//!
//! A [`ChannelHub`] is a shared registry of mailboxes keyed by address. Each
//! node connects once and gets a [`ChannelAdapter`] that sends into other
//! mailboxes and receives from its own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use conveyor_transport::adapter::{
    AsyncTransportAdapter, TransportAdapter, TransportHealthSnapshot,
};

type Mailbox = mpsc::UnboundedSender<(String, Vec<u8>)>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no mailbox registered for {0}")]
    UnknownAddress(String),
    #[error("mailbox for {0} is closed")]
    Closed(String),
}

/// Shared address → mailbox registry.
#[derive(Debug, Clone, Default)]
pub struct ChannelHub {
    mailboxes: Arc<Mutex<HashMap<String, Mailbox>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `address` and returns its adapter. Connecting the same
    /// address again replaces the earlier mailbox.
    pub fn connect(&self, address: impl Into<String>) -> ChannelAdapter {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if self.lock().insert(address.clone(), tx).is_some() {
            debug!(address = address.as_str(), "mailbox replaced");
        }
        ChannelAdapter {
            address,
            hub: self.clone(),
            inbox: rx,
            health: TransportHealthSnapshot::default(),
        }
    }

    /// Removes the mailbox of `address`; later sends to it fail.
    pub fn disconnect(&self, address: &str) -> bool {
        self.lock().remove(address).is_some()
    }

    /// Delivers bytes to `to` as if sent by `from`. Used by operators and
    /// tests that are not themselves connected.
    pub fn inject(&self, from: &str, to: &str, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let guard = self.lock();
        let mailbox = guard
            .get(to)
            .ok_or_else(|| ChannelError::UnknownAddress(to.to_string()))?;
        mailbox
            .send((from.to_string(), bytes))
            .map_err(|_| ChannelError::Closed(to.to_string()))
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

/// One node's endpoint on a [`ChannelHub`].
#[derive(Debug)]
pub struct ChannelAdapter {
    address: String,
    hub: ChannelHub,
    inbox: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    health: TransportHealthSnapshot,
}

impl ChannelAdapter {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn note_received(&mut self, msg: &Option<(String, Vec<u8>)>) {
        if msg.is_some() {
            self.health.inbound_received += 1;
        }
    }
}

impl TransportAdapter for ChannelAdapter {
    type Peer = String;
    type Error = ChannelError;

    fn send(&mut self, peer: &String, bytes: &[u8]) -> Result<(), ChannelError> {
        match self.hub.inject(&self.address, peer, bytes.to_vec()) {
            Ok(()) => {
                self.health.outbound_send_ok += 1;
                Ok(())
            }
            Err(err) => {
                self.health.outbound_send_err += 1;
                self.health.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        let msg = self.inbox.try_recv().ok();
        self.note_received(&msg);
        msg
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        self.health.clone()
    }
}

impl AsyncTransportAdapter for ChannelAdapter {
    fn next_inbound(&mut self) -> impl Future<Output = Option<(String, Vec<u8>)>> + Send {
        async move {
            let msg = self.inbox.recv().await;
            self.note_received(&msg);
            msg
        }
    }
}
