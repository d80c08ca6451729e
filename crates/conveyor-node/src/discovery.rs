//! Route discovery: shortest-hop flooding search with per-query best-cost
//! suppression, reply back-tracking along predecessors, and ABORT cleanup.

use rand::Rng;

use conveyor_codec::{FindPathAbort, FindPathReply, FindPathReq, Performative, TransferPallet};
use conveyor_core::{NodeId, NodeStatus, QueryId};

use crate::config::StallReroutePolicy;
use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};
use crate::state::{Predecessor, QueryEntry};

/// Conversation id prefix of the transfer a node sends itself once a route
/// is found; the remainder is the query id.
pub const REROUTE_CONVERSATION_PREFIX: &str = "reroute-";

impl ConveyorNode {
    /// Starts a query for `dest` by sending FIND_PATH_REQ to this node.
    pub fn start_query(&mut self, dest: NodeId, step: &mut Step) -> Result<QueryId, NodeError> {
        let seq = self.next_seq();
        let nonce: u64 = self.rng.gen();
        let query_id = format!(
            "{}-{}-{}",
            self.config.node_id,
            seq,
            hex::encode(nonce.to_be_bytes())
        );
        self.emit(
            step,
            NodeEvent::QueryStarted {
                query_id: query_id.clone(),
                dest: dest.clone(),
            },
        );
        let me = self.config.node_id.clone();
        step.send(self.envelope(
            Performative::Request,
            &me,
            FindPathReq {
                query_id: query_id.clone(),
                dest,
                cost: 0,
                path: Vec::new(),
            },
        )?);
        Ok(query_id)
    }

    pub(crate) fn on_find_path_req(
        &mut self,
        sender: &NodeId,
        request: FindPathReq,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let FindPathReq {
            query_id,
            dest,
            cost,
            mut path,
        } = request;

        if self.state.queries.is_retired(&query_id) {
            self.emit(step, NodeEvent::LateQuery { query_id });
            return Ok(());
        }
        if let Some(entry) = self.state.queries.peek(&query_id) {
            if entry.best_cost <= cost {
                let best_cost = entry.best_cost;
                self.emit(
                    step,
                    NodeEvent::QueryDropped {
                        query_id,
                        cost,
                        best_cost,
                    },
                );
                return Ok(());
            }
        }

        let origin = *sender == self.config.node_id;
        let predecessor = if origin {
            Predecessor::Origin
        } else {
            Predecessor::Node(sender.clone())
        };
        let evicted = self.state.queries.record(
            query_id.clone(),
            QueryEntry {
                best_cost: cost,
                predecessor,
            },
        );
        if let Some(evicted) = evicted {
            self.emit(step, NodeEvent::QueryEvicted { query_id: evicted });
        }

        // A BUSY origin still searches for its stalled pallet; every other
        // non-idle node is not an eligible hop.
        let status = self.state.status;
        let searching_origin = origin && status == NodeStatus::Busy;
        if status != NodeStatus::Idle && !searching_origin {
            self.emit(step, NodeEvent::QueryAbsorbed { query_id, status });
            return Ok(());
        }

        let me = self.config.node_id.clone();
        path.push(me.clone());
        let cost = cost.saturating_add(1);

        if me == dest {
            step.send(self.envelope(
                Performative::Inform,
                sender,
                FindPathReply {
                    query_id: query_id.clone(),
                    cost,
                    path,
                },
            )?);
            self.emit(step, NodeEvent::DestinationReached { query_id, cost });
            return Ok(());
        }

        let targets: Vec<NodeId> = self
            .config
            .neighbours
            .iter()
            .filter(|n| *n != sender)
            .cloned()
            .collect();
        for neighbour in &targets {
            step.send(self.envelope(
                Performative::Request,
                neighbour,
                FindPathReq {
                    query_id: query_id.clone(),
                    dest: dest.clone(),
                    cost,
                    path: path.clone(),
                },
            )?);
        }
        self.emit(
            step,
            NodeEvent::QueryForwarded {
                query_id,
                cost,
                fanout: targets.len(),
            },
        );
        Ok(())
    }

    pub(crate) fn on_find_path_reply(
        &mut self,
        reply: FindPathReply,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let predecessor = self
            .state
            .queries
            .peek(&reply.query_id)
            .map(|entry| entry.predecessor.clone());
        match predecessor {
            None => {
                self.emit(
                    step,
                    NodeEvent::StaleReply {
                        query_id: reply.query_id,
                    },
                );
                Ok(())
            }
            Some(Predecessor::Node(to)) => {
                let query_id = reply.query_id.clone();
                step.send(self.envelope(Performative::Inform, &to, reply)?);
                self.emit(step, NodeEvent::ReplyForwarded { query_id, to });
                Ok(())
            }
            Some(Predecessor::Origin) => self.complete_route(reply, now_ms, step),
        }
    }

    /// Origin side of a successful query: reload along the found path and
    /// flood ABORT so other nodes forget the query.
    ///
    /// A watchdog query reroutes only the pallet it was started for, and
    /// only while that pallet is still held. Any other query reloads through
    /// a loader, so a BUSY origin retries the reload later.
    fn complete_route(
        &mut self,
        reply: FindPathReply,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let FindPathReply {
            query_id,
            cost,
            path,
        } = reply;
        self.state.queries.retire(&query_id);
        let stalled = self.state.reroutes.remove(&query_id);

        self.emit(
            step,
            NodeEvent::RouteFound {
                query_id: query_id.clone(),
                path: path.clone(),
                cost,
            },
        );
        let request = TransferPallet {
            target_path: path,
            elapsed_ms: 0,
        };
        match stalled {
            None => self.start_handoff(request, now_ms, step)?,
            Some(pallet) if self.state.holds_pallet(pallet) => {
                self.reroute_stalled(&query_id, request, step)?
            }
            Some(pallet) => self.emit(
                step,
                NodeEvent::RerouteDropped {
                    query_id: query_id.clone(),
                    pallet,
                },
            ),
        }

        for neighbour in &self.config.neighbours {
            step.send(self.envelope(
                Performative::Inform,
                neighbour,
                FindPathAbort {
                    query_id: query_id.clone(),
                },
            )?);
        }
        Ok(())
    }

    /// Self-sends the found path for the stalled pallet, releasing the
    /// pallet first when the policy allows it.
    fn reroute_stalled(
        &mut self,
        query_id: &str,
        request: TransferPallet,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        if self.state.status == NodeStatus::Busy
            && self.timings.stall_reroute == StallReroutePolicy::ReleaseAndReload
        {
            if let Some(pallet) = self.state.take_pallet() {
                self.state.abandoned_holds.insert(pallet.seq);
                self.state.status = NodeStatus::Idle;
                self.emit(step, NodeEvent::PalletReleased { pallet: pallet.seq });
            }
        }
        let me = self.config.node_id.clone();
        step.send(
            self.envelope(Performative::Request, &me, request)?
                .with_conversation(format!("{REROUTE_CONVERSATION_PREFIX}{query_id}")),
        );
        Ok(())
    }

    /// Forgets a query and passes the ABORT on. A second ABORT for the same
    /// query finds no entry and is a no-op.
    pub(crate) fn on_abort(
        &mut self,
        sender: &NodeId,
        abort: FindPathAbort,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        if self.state.queries.retire(&abort.query_id).is_none() {
            return Ok(());
        }
        let mut fanout = 0;
        for neighbour in self.config.neighbours.iter().filter(|n| *n != sender) {
            step.send(self.envelope(
                Performative::Inform,
                neighbour,
                FindPathAbort {
                    query_id: abort.query_id.clone(),
                },
            )?);
            fanout += 1;
        }
        self.emit(
            step,
            NodeEvent::QueryAborted {
                query_id: abort.query_id,
                fanout,
            },
        );
        Ok(())
    }
}
