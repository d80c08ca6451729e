//! Async host: one tokio task per node, sole owner of the node's state.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info};

use conveyor_core::NodeId;
use conveyor_transport::adapter::AsyncTransportAdapter;
use conveyor_transport::directory::Directory;

use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};
use crate::runtime::{deliver_inbound, flush_outbound, tick, RuntimeStats};

/// Observed node event: node, milliseconds since the service epoch, event.
pub type EventRecord = (NodeId, u64, NodeEvent);

enum Wake<P> {
    Shutdown,
    Inbound(P, Vec<u8>),
    Timer,
}

pub struct NodeService<A, D> {
    node: ConveyorNode,
    adapter: A,
    directory: D,
    epoch: Instant,
    stats: RuntimeStats,
    event_tap: Option<mpsc::UnboundedSender<EventRecord>>,
}

impl<A, D> NodeService<A, D>
where
    A: AsyncTransportAdapter,
    A::Peer: fmt::Display,
    A::Error: fmt::Display,
    D: Directory<Address = A::Peer>,
{
    pub fn new(node: ConveyorNode, adapter: A, directory: D) -> Self {
        Self {
            node,
            adapter,
            directory,
            epoch: Instant::now(),
            stats: RuntimeStats::default(),
            event_tap: None,
        }
    }

    /// Shares a clock origin with other services so timestamps line up.
    pub fn with_epoch(mut self, epoch: Instant) -> Self {
        self.epoch = epoch;
        self
    }

    /// Copies every emitted event to `tap`.
    pub fn with_event_tap(mut self, tap: mpsc::UnboundedSender<EventRecord>) -> Self {
        self.event_tap = Some(tap);
        self
    }

    pub fn node(&self) -> &ConveyorNode {
        &self.node
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs the node until `shutdown` turns true, its sender is dropped, or
    /// the transport closes. An invariant violation stops the loop with an
    /// error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<RuntimeStats, NodeError> {
        let node_id = self.node.id().clone();
        let step = self.node.start(self.now_ms());
        self.publish(&step);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = self.node.next_deadline().map(|ms| self.epoch + Duration::from_millis(ms));
            let wake = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) if !*shutdown.borrow() => continue,
                    _ => Wake::Shutdown,
                },
                inbound = self.adapter.next_inbound() => match inbound {
                    Some((peer, bytes)) => Wake::Inbound(peer, bytes),
                    None => Wake::Shutdown,
                },
                _ = sleep_until(deadline) => Wake::Timer,
            };

            let result = match wake {
                Wake::Shutdown => break,
                Wake::Inbound(peer, bytes) => {
                    let now_ms = self.now_ms();
                    deliver_inbound(&mut self.node, &peer.to_string(), &bytes, now_ms, &mut self.stats)
                        .and_then(|step| {
                            flush_outbound(
                                &self.node,
                                &step.outbound,
                                &mut self.adapter,
                                &self.directory,
                                &mut self.stats,
                            )?;
                            Ok(step)
                        })
                }
                Wake::Timer => {
                    let now_ms = self.now_ms();
                    tick(&mut self.node, &mut self.adapter, &self.directory, now_ms, &mut self.stats)
                }
            };
            match result {
                Ok(step) => self.publish(&step),
                Err(err) => {
                    error!(node = %node_id, error = %err, "node stopped");
                    return Err(err);
                }
            }
        }

        info!(node = %node_id, stats = ?self.stats, "node service stopped");
        Ok(self.stats)
    }

    fn publish(&self, step: &Step) {
        let Some(tap) = &self.event_tap else {
            return;
        };
        let at_ms = self.now_ms();
        for event in &step.events {
            let _ = tap.send((self.node.id().clone(), at_ms, event.clone()));
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
