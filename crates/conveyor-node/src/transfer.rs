//! Transfer engine: pallet acceptance, hold, and hold completion.

use conveyor_codec::{Envelope, Performative, ReplyBody, TransferPallet};
use conveyor_core::{NodeId, NodeStatus};

use crate::config::NodeConfig;
use crate::discovery::REROUTE_CONVERSATION_PREFIX;
use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};
use crate::state::PalletInFlight;
use crate::timers::TimerKind;

pub const REFUSE_WRONG_FIRST_HOP: &str = "wrong first hop";
pub const REFUSE_BAD_NEXT_HOP: &str = "bad next hop";

/// Checks whether a node in `status` may accept a pallet on `target_path`.
/// The error is the REFUSE reason.
pub fn acceptance(
    config: &NodeConfig,
    status: NodeStatus,
    target_path: &[NodeId],
) -> Result<(), &'static str> {
    if let Some(reason) = status.refusal_reason() {
        return Err(reason);
    }
    if target_path.first() != Some(&config.node_id) {
        return Err(REFUSE_WRONG_FIRST_HOP);
    }
    match target_path.get(1) {
        Some(next) if !config.is_neighbour(next) => Err(REFUSE_BAD_NEXT_HOP),
        _ => Ok(()),
    }
}

impl ConveyorNode {
    pub(crate) fn on_transfer_request(
        &mut self,
        envelope: &Envelope,
        request: TransferPallet,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        if let Err(reason) = acceptance(&self.config, self.state.status, &request.target_path) {
            step.send(envelope.reply(Performative::Refuse, ReplyBody::reason(reason))?);
            let reroute = envelope
                .conversation_id
                .as_deref()
                .and_then(|c| c.strip_prefix(REROUTE_CONVERSATION_PREFIX))
                .filter(|_| envelope.sender == self.config.node_id);
            let event = match reroute {
                Some(query_id) => NodeEvent::RerouteRefused {
                    query_id: query_id.to_string(),
                    reason: reason.to_string(),
                },
                None => NodeEvent::TransferRefused {
                    from: envelope.sender.clone(),
                    reason: reason.to_string(),
                },
            };
            self.emit(step, event);
            return Ok(());
        }
        if self.state.pallet.is_some() {
            return Err(self.violation(step, "transfer accepted while a pallet is held"));
        }

        step.send(envelope.reply(Performative::Agree, ReplyBody::default())?);
        let TransferPallet {
            target_path,
            elapsed_ms,
        } = request;
        self.emit(
            step,
            NodeEvent::Loaded {
                from: envelope.sender.clone(),
                target_path: target_path.clone(),
                elapsed_ms,
            },
        );

        let total_ms = elapsed_ms.saturating_add(self.config.transfer_ms);
        if target_path.len() == 1 {
            self.emit(step, NodeEvent::Arrived { total_ms });
            return Ok(());
        }

        let seq = self.next_seq();
        let destination = target_path[target_path.len() - 1].clone();
        self.state.status = NodeStatus::Busy;
        self.state.pallet = Some(PalletInFlight {
            seq,
            destination,
            busy_since_ms: now_ms,
            elapsed_ms,
            last_reroute_ms: None,
        });
        self.timers.schedule(
            now_ms.saturating_add(self.config.transfer_ms),
            TimerKind::HoldComplete {
                pallet: seq,
                next_path: target_path[1..].to_vec(),
                elapsed_ms: total_ms,
            },
        );
        Ok(())
    }

    /// Ends a hold. The node returns to IDLE only if it is still BUSY with
    /// the same pallet; the hand-off is attempted regardless of state.
    pub(crate) fn on_hold_complete(
        &mut self,
        pallet: u64,
        next_path: Vec<NodeId>,
        elapsed_ms: u64,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        if self.state.abandoned_holds.remove(&pallet) {
            self.emit(step, NodeEvent::HoldAbandoned { pallet });
            return Ok(());
        }
        if self.state.holds_pallet(pallet) {
            self.state.take_pallet();
            if self.state.status == NodeStatus::Busy {
                self.state.status = NodeStatus::Idle;
            }
        }
        let Some(next) = next_path.first().cloned() else {
            return Ok(());
        };
        self.emit(
            step,
            NodeEvent::Unloading {
                next,
                elapsed_ms,
            },
        );
        self.start_handoff(
            TransferPallet {
                target_path: next_path,
                elapsed_ms,
            },
            now_ms,
            step,
        )
    }
}
