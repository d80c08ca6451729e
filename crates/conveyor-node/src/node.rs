use std::num::NonZeroUsize;

use rand::rngs::StdRng;
use rand::SeedableRng;

use conveyor_codec::{decode_envelope, CodecError, Envelope, Payload, Performative};
use conveyor_core::{ConveyorError, NodeId, NodeStatus};

use crate::config::{NodeConfig, NodeTimings};
use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::state::{LocalState, PalletInFlight, QueryEntry};
use crate::timers::{TimerKind, TimerQueue};

/// Output of one handled message or timer: envelopes to send and the events
/// that were logged while handling it.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Step {
    pub outbound: Vec<Envelope>,
    pub events: Vec<NodeEvent>,
}

impl Step {
    /// Logs `event` for `node` and records it.
    pub fn emit(&mut self, node: &NodeId, event: NodeEvent) {
        event.log(node);
        self.events.push(event);
    }

    pub fn send(&mut self, envelope: Envelope) {
        self.outbound.push(envelope);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}

/// A single conveyor agent.
///
/// The node never reads a clock or touches a socket. Hosts pass monotonic
/// milliseconds into every call, deliver inbound bytes with
/// [`ConveyorNode::handle_bytes`], fire timers with
/// [`ConveyorNode::fire_due`], and transmit the returned envelopes.
#[derive(Debug)]
pub struct ConveyorNode {
    pub(crate) config: NodeConfig,
    pub(crate) timings: NodeTimings,
    pub(crate) state: LocalState,
    pub(crate) timers: TimerQueue,
    pub(crate) rng: StdRng,
}

impl ConveyorNode {
    pub fn new(config: NodeConfig, timings: NodeTimings) -> Result<Self, NodeError> {
        config.validate()?;
        timings.validate()?;
        let capacity = NonZeroUsize::new(timings.max_tracked_queries)
            .ok_or(ConveyorError::InvalidInput("max_tracked_queries must be positive"))?;
        Ok(Self {
            config,
            timings,
            state: LocalState::new(capacity),
            timers: TimerQueue::default(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Replaces the query-id random source with a seeded one.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn timings(&self) -> &NodeTimings {
        &self.timings
    }

    pub fn status(&self) -> NodeStatus {
        self.state.status
    }

    pub fn pallet(&self) -> Option<&PalletInFlight> {
        self.state.pallet.as_ref()
    }

    pub fn query(&self, query_id: &str) -> Option<&QueryEntry> {
        self.state.queries.peek(query_id)
    }

    pub fn tracked_queries(&self) -> usize {
        self.state.queries.len()
    }

    pub fn active_loaders(&self) -> usize {
        self.state.loaders.len()
    }

    /// Earliest pending timer deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Whether hand-offs or holds are still outstanding; the watchdog does
    /// not count.
    pub fn has_pending_work(&self) -> bool {
        !self.state.loaders.is_empty() || self.timers.pending_work() > 0
    }

    /// Arms the watchdog and announces the node.
    pub fn start(&mut self, now_ms: u64) -> Step {
        let mut step = Step::default();
        if self.timings.watchdog_enabled {
            self.timers.schedule(
                now_ms.saturating_add(self.timings.watchdog_period_ms),
                TimerKind::Watchdog,
            );
        }
        step.emit(
            &self.config.node_id,
            NodeEvent::Started {
                neighbours: self.config.neighbours.len(),
                transfer_ms: self.config.transfer_ms,
            },
        );
        step
    }

    /// Decodes and handles one inbound message. Undecodable input is logged
    /// and dropped.
    pub fn handle_bytes(&mut self, from: &str, bytes: &[u8], now_ms: u64) -> Result<Step, NodeError> {
        match decode_envelope(bytes) {
            Ok(envelope) => self.handle_envelope(envelope, now_ms),
            Err(err) => {
                let mut step = Step::default();
                self.drop_malformed(from, &err, &mut step);
                Ok(step)
            }
        }
    }

    /// Handles an already-decoded envelope.
    pub fn handle_envelope(&mut self, envelope: Envelope, now_ms: u64) -> Result<Step, NodeError> {
        let mut step = Step::default();
        self.dispatch(envelope, now_ms, &mut step)?;
        self.check_invariants(&mut step)?;
        Ok(step)
    }

    /// Fires every timer due at or before `now_ms`, in deadline order.
    pub fn fire_due(&mut self, now_ms: u64) -> Result<Step, NodeError> {
        let mut step = Step::default();
        while let Some((_, kind)) = self.timers.pop_due(now_ms) {
            self.on_timer(kind, now_ms, &mut step)?;
            self.check_invariants(&mut step)?;
        }
        Ok(step)
    }

    fn on_timer(&mut self, kind: TimerKind, now_ms: u64, step: &mut Step) -> Result<(), NodeError> {
        match kind {
            TimerKind::HoldComplete {
                pallet,
                next_path,
                elapsed_ms,
            } => self.on_hold_complete(pallet, next_path, elapsed_ms, now_ms, step),
            TimerKind::LoaderRetry { conversation_id } => {
                self.on_loader_retry(&conversation_id, now_ms, step)
            }
            TimerKind::ReplyTimeout {
                conversation_id,
                attempt,
            } => self.on_reply_timeout(&conversation_id, attempt, now_ms, step),
            TimerKind::Watchdog => self.on_watchdog(now_ms, step),
        }
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.state.next_seq += 1;
        self.state.next_seq
    }

    /// Builds an envelope from this node to `to`.
    pub(crate) fn envelope(
        &self,
        performative: Performative,
        to: &NodeId,
        payload: impl Into<Payload>,
    ) -> Result<Envelope, CodecError> {
        Envelope::with_payload(
            performative,
            self.config.node_id.clone(),
            to.clone(),
            &payload.into(),
        )
    }

    pub(crate) fn emit(&self, step: &mut Step, event: NodeEvent) {
        step.emit(&self.config.node_id, event);
    }

    pub(crate) fn drop_malformed(&self, from: &str, err: &dyn std::fmt::Display, step: &mut Step) {
        self.emit(
            step,
            NodeEvent::MalformedDropped {
                from: from.to_string(),
                error: err.to_string(),
            },
        );
    }
}
