use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, error};

use conveyor_codec::{
    decode_envelope, encode_envelope, ChangeState, Envelope, MessageType, Performative,
    TransferPallet,
};
use conveyor_core::{NodeId, NodeStatus};
use conveyor_node::runtime::{flush_outbound, pump_once, tick, RuntimeStats};
use conveyor_node::{ConveyorNode, NodeEvent, NodeTimings, Step};
use conveyor_transport::adapter::InMemoryAdapter;
use conveyor_transport::directory::IdentityDirectory;

use crate::error::SimError;
use crate::layout::LayoutSpec;

/// Address of the simulated operator; replies sent to it are kept in
/// [`Simulation::operator_inbox`].
pub const OPERATOR: &str = "operator";

const DEFAULT_MAX_STEPS: usize = 1_000_000;

struct SimNode {
    node: ConveyorNode,
    adapter: InMemoryAdapter,
    stats: RuntimeStats,
}

struct InFlight {
    deliver_at: u64,
    from: String,
    to: String,
    bytes: Vec<u8>,
}

/// Runs a set of nodes against one virtual clock.
///
/// Every message takes the same latency, so delivery is FIFO across the
/// whole network. At equal instants messages are delivered before timers
/// fire, and timers fire in node-id order.
pub struct Simulation {
    now_ms: u64,
    latency_ms: u64,
    max_steps: usize,
    nodes: BTreeMap<NodeId, SimNode>,
    in_flight: VecDeque<InFlight>,
    operator_inbox: Vec<Envelope>,
    events: Vec<(u64, NodeId, NodeEvent)>,
    received: HashMap<(NodeId, MessageType), usize>,
    halted: BTreeMap<NodeId, String>,
    undeliverable: usize,
    next_operator_seq: u64,
}

impl Simulation {
    /// Builds and starts every node of `layout` at t=0, applying initial
    /// states directly.
    pub fn new(layout: &LayoutSpec, timings: NodeTimings) -> Result<Self, SimError> {
        layout.validate()?;
        let mut nodes = Vec::with_capacity(layout.nodes.len());
        for (index, config) in layout.node_configs()?.into_iter().enumerate() {
            let node = ConveyorNode::new(config, timings.clone())?.with_seed(index as u64 + 1);
            nodes.push(node);
        }
        let mut sim = Self::from_nodes(nodes);
        for spec in &layout.nodes {
            if spec.initial_state != NodeStatus::Idle {
                sim.force_state(&spec.id, spec.initial_state)?;
            }
        }
        Ok(sim)
    }

    /// Starts already-built nodes at t=0.
    pub fn from_nodes(nodes: impl IntoIterator<Item = ConveyorNode>) -> Self {
        let mut sim = Self {
            now_ms: 0,
            latency_ms: 0,
            max_steps: DEFAULT_MAX_STEPS,
            nodes: BTreeMap::new(),
            in_flight: VecDeque::new(),
            operator_inbox: Vec::new(),
            events: Vec::new(),
            received: HashMap::new(),
            halted: BTreeMap::new(),
            undeliverable: 0,
            next_operator_seq: 0,
        };
        for mut node in nodes {
            let step = node.start(0);
            let id = node.id().clone();
            sim.record(&id, step.events);
            sim.nodes.insert(
                id,
                SimNode {
                    node,
                    adapter: InMemoryAdapter::default(),
                    stats: RuntimeStats::default(),
                },
            );
        }
        sim
    }

    /// Sets a constant per-message latency.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Bounds the number of deliveries and timer firings per run call.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn now(&self) -> u64 {
        self.now_ms
    }

    pub fn node(&self, id: &str) -> Option<&ConveyorNode> {
        self.nodes.get(id).map(|n| &n.node)
    }

    pub fn stats(&self, id: &str) -> Option<RuntimeStats> {
        self.nodes.get(id).map(|n| n.stats)
    }

    pub fn events(&self) -> &[(u64, NodeId, NodeEvent)] {
        &self.events
    }

    /// Events of one node with their timestamps.
    pub fn events_for<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (u64, &'a NodeEvent)> + 'a {
        self.events
            .iter()
            .filter(move |(_, node, _)| node == id)
            .map(|(at, _, event)| (*at, event))
    }

    pub fn operator_inbox(&self) -> &[Envelope] {
        &self.operator_inbox
    }

    /// Messages of `msg_type` delivered to `id` so far.
    pub fn received(&self, id: &str, msg_type: MessageType) -> usize {
        self.received
            .get(&(NodeId::from(id), msg_type))
            .copied()
            .unwrap_or(0)
    }

    pub fn halted(&self, id: &str) -> Option<&str> {
        self.halted.get(id).map(String::as_str)
    }

    pub fn undeliverable(&self) -> usize {
        self.undeliverable
    }

    /// No message in flight and no hold or hand-off outstanding anywhere.
    pub fn quiescent(&self) -> bool {
        self.in_flight.is_empty()
            && self
                .nodes
                .iter()
                .filter(|(id, _)| !self.halted.contains_key(*id))
                .all(|(_, n)| !n.node.has_pending_work())
    }

    /// Queues an envelope for delivery after the network latency.
    pub fn inject(&mut self, envelope: &Envelope) -> Result<(), SimError> {
        let bytes = encode_envelope(envelope)?;
        self.enqueue(envelope.sender.to_string(), envelope.receiver.to_string(), bytes);
        Ok(())
    }

    /// Queues raw bytes, e.g. a malformed message, from `from` to `to`.
    pub fn inject_bytes(&mut self, from: &str, to: &str, bytes: Vec<u8>) {
        self.enqueue(from.to_string(), to.to_string(), bytes);
    }

    /// Sends TRANSFER_PALLET for `path` from the operator to its first node.
    pub fn send_transfer(&mut self, path: &[&str], elapsed_ms: u64) -> Result<(), SimError> {
        let first = path
            .first()
            .ok_or_else(|| SimError::Layout("empty transfer path".into()))?;
        self.next_operator_seq += 1;
        let envelope = Envelope::with_payload(
            Performative::Request,
            NodeId::new(OPERATOR)?,
            NodeId::new(*first)?,
            &TransferPallet {
                target_path: path.iter().map(|p| NodeId::new(*p)).collect::<Result<_, _>>()?,
                elapsed_ms,
            }
            .into(),
        )?
        .with_conversation(format!("operator-{}", self.next_operator_seq))
        .with_reply_with("req1");
        self.inject(&envelope)
    }

    /// Sends CHANGE_STATE from the operator.
    pub fn set_state(&mut self, id: &str, state: NodeStatus) -> Result<(), SimError> {
        let envelope = Envelope::with_payload(
            Performative::Request,
            NodeId::new(OPERATOR)?,
            NodeId::new(id)?,
            &ChangeState { new_state: state }.into(),
        )?;
        self.inject(&envelope)
    }

    /// Applies CHANGE_STATE immediately, bypassing the network.
    pub fn force_state(&mut self, id: &str, state: NodeStatus) -> Result<(), SimError> {
        let envelope = Envelope::with_payload(
            Performative::Request,
            NodeId::new(OPERATOR)?,
            NodeId::new(id)?,
            &ChangeState { new_state: state }.into(),
        )?;
        let now_ms = self.now_ms;
        let sim_node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownNode(id.to_string()))?;
        let step = sim_node.node.handle_envelope(envelope, now_ms)?;
        let node_id = sim_node.node.id().clone();
        self.record(&node_id, step.events);
        Ok(())
    }

    /// Drops every message `id` sends while `lossy` is set.
    pub fn set_outbound_loss(&mut self, id: &str, lossy: bool) -> Result<(), SimError> {
        let sim_node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownNode(id.to_string()))?;
        sim_node.adapter.set_drop_outbound(lossy);
        Ok(())
    }

    /// Starts a route query at `origin` for `dest`, as a refused hand-off
    /// would. A route found for it is reloaded through the origin's loader.
    pub fn start_query(&mut self, origin: &str, dest: &str) -> Result<(), SimError> {
        let dest = NodeId::new(dest)?;
        let sim_node = self
            .nodes
            .get_mut(origin)
            .ok_or_else(|| SimError::UnknownNode(origin.to_string()))?;
        let mut step = Step::default();
        sim_node.node.start_query(dest, &mut step)?;
        flush_outbound(
            &sim_node.node,
            &step.outbound,
            &mut sim_node.adapter,
            &IdentityDirectory,
            &mut sim_node.stats,
        )?;
        let id = sim_node.node.id().clone();
        self.collect_outbound(&id);
        self.record(&id, step.events);
        Ok(())
    }

    pub fn run_for(&mut self, duration_ms: u64) -> Result<(), SimError> {
        self.run_until(self.now_ms.saturating_add(duration_ms))
    }

    /// Processes every delivery and timer up to and including `until_ms`,
    /// then advances the clock to it.
    pub fn run_until(&mut self, until_ms: u64) -> Result<(), SimError> {
        let mut steps = 0;
        loop {
            let next_message = self.in_flight.front().map(|m| m.deliver_at);
            let next_timer = self
                .nodes
                .iter()
                .filter(|(id, _)| !self.halted.contains_key(*id))
                .filter_map(|(id, n)| n.node.next_deadline().map(|at| (at, id.clone())))
                .min();

            let deliver_first = match (next_message, &next_timer) {
                (Some(msg_at), Some((timer_at, _))) => msg_at <= *timer_at,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let at = if deliver_first {
                next_message.unwrap_or(until_ms)
            } else {
                next_timer.as_ref().map_or(until_ms, |(at, _)| *at)
            };
            if at > until_ms {
                break;
            }
            steps += 1;
            if steps > self.max_steps {
                return Err(SimError::Livelock {
                    steps,
                    at_ms: self.now_ms,
                });
            }
            self.now_ms = self.now_ms.max(at);

            if deliver_first {
                if let Some(message) = self.in_flight.pop_front() {
                    self.deliver(message);
                }
            } else if let Some((_, id)) = next_timer {
                self.fire(&id);
            }
        }
        self.now_ms = self.now_ms.max(until_ms);
        Ok(())
    }

    fn enqueue(&mut self, from: String, to: String, bytes: Vec<u8>) {
        self.in_flight.push_back(InFlight {
            deliver_at: self.now_ms.saturating_add(self.latency_ms),
            from,
            to,
            bytes,
        });
    }

    fn deliver(&mut self, message: InFlight) {
        let InFlight { from, to, bytes, .. } = message;
        if to == OPERATOR {
            match decode_envelope(&bytes) {
                Ok(envelope) => self.operator_inbox.push(envelope),
                Err(err) => debug!(error = %err, "undecodable message to operator"),
            }
            return;
        }
        if self.halted.contains_key(to.as_str()) {
            self.undeliverable += 1;
            return;
        }
        let now_ms = self.now_ms;
        let Some(sim_node) = self.nodes.get_mut(to.as_str()) else {
            self.undeliverable += 1;
            debug!(to = to.as_str(), "message to unknown node dropped");
            return;
        };
        if let Some(msg_type) = decode_envelope(&bytes)
            .ok()
            .and_then(|e| e.payload().ok())
            .map(|p| p.message_type())
        {
            *self
                .received
                .entry((sim_node.node.id().clone(), msg_type))
                .or_insert(0) += 1;
        }
        sim_node.adapter.enqueue_inbound(from, bytes);
        let result = pump_once(
            &mut sim_node.node,
            &mut sim_node.adapter,
            &IdentityDirectory,
            now_ms,
            &mut sim_node.stats,
        );
        let id = sim_node.node.id().clone();
        match result {
            Ok(step) => {
                let events = step.map(|s| s.events).unwrap_or_default();
                self.collect_outbound(&id);
                self.record(&id, events);
            }
            Err(err) => self.halt(id, err.to_string()),
        }
    }

    fn fire(&mut self, id: &NodeId) {
        let now_ms = self.now_ms;
        let Some(sim_node) = self.nodes.get_mut(id) else {
            return;
        };
        let result = tick(
            &mut sim_node.node,
            &mut sim_node.adapter,
            &IdentityDirectory,
            now_ms,
            &mut sim_node.stats,
        );
        match result {
            Ok(step) => {
                self.collect_outbound(id);
                self.record(id, step.events);
            }
            Err(err) => self.halt(id.clone(), err.to_string()),
        }
    }

    fn collect_outbound(&mut self, id: &NodeId) {
        let Some(sim_node) = self.nodes.get_mut(id) else {
            return;
        };
        for (to, bytes) in sim_node.adapter.take_outbound() {
            self.in_flight.push_back(InFlight {
                deliver_at: self.now_ms.saturating_add(self.latency_ms),
                from: id.to_string(),
                to,
                bytes,
            });
        }
    }

    fn record(&mut self, id: &NodeId, events: Vec<NodeEvent>) {
        let now_ms = self.now_ms;
        self.events
            .extend(events.into_iter().map(|event| (now_ms, id.clone(), event)));
    }

    fn halt(&mut self, id: NodeId, reason: String) {
        error!(node = %id, reason = reason.as_str(), "node halted");
        self.halted.insert(id, reason);
    }
}
