use tracing::{debug, error, info, warn};

use conveyor_core::{NodeId, NodeStatus, QueryId};

/// Observable node event; each one is logged as a single structured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Started {
        neighbours: usize,
        transfer_ms: u64,
    },
    /// Transfer accepted; the node is now BUSY.
    Loaded {
        from: NodeId,
        target_path: Vec<NodeId>,
        elapsed_ms: u64,
    },
    TransferRefused {
        from: NodeId,
        reason: String,
    },
    /// Pallet reached the last node of its path.
    Arrived {
        total_ms: u64,
    },
    /// Hold finished; hand-off to `next` begins.
    Unloading {
        next: NodeId,
        elapsed_ms: u64,
    },
    HoldAbandoned {
        pallet: u64,
    },
    HandedOff {
        to: NodeId,
        attempts: u32,
    },
    HandoffDeferred {
        to: NodeId,
        reason: String,
        attempts: u32,
    },
    HandoffTimedOut {
        to: NodeId,
        attempts: u32,
    },
    /// Next hop refused with DOWN; the loader gives up and reroutes.
    NextHopDown {
        to: NodeId,
        destination: NodeId,
    },
    RetryCapReached {
        to: NodeId,
        attempts: u32,
    },
    StateChanged {
        from: NodeStatus,
        to: NodeStatus,
        cleared_pallet: bool,
    },
    QueryStarted {
        query_id: QueryId,
        dest: NodeId,
    },
    QueryDropped {
        query_id: QueryId,
        cost: u64,
        best_cost: u64,
    },
    /// Request for a query this node already saw finish.
    LateQuery {
        query_id: QueryId,
    },
    /// Recorded but not propagated because this node is not IDLE.
    QueryAbsorbed {
        query_id: QueryId,
        status: NodeStatus,
    },
    QueryForwarded {
        query_id: QueryId,
        cost: u64,
        fanout: usize,
    },
    DestinationReached {
        query_id: QueryId,
        cost: u64,
    },
    ReplyForwarded {
        query_id: QueryId,
        to: NodeId,
    },
    RouteFound {
        query_id: QueryId,
        path: Vec<NodeId>,
        cost: u64,
    },
    StaleReply {
        query_id: QueryId,
    },
    QueryAborted {
        query_id: QueryId,
        fanout: usize,
    },
    QueryEvicted {
        query_id: QueryId,
    },
    StallDetected {
        busy_for_ms: u64,
        destination: NodeId,
    },
    PalletReleased {
        pallet: u64,
    },
    /// A watchdog route arrived after its pallet left this node.
    RerouteDropped {
        query_id: QueryId,
        pallet: u64,
    },
    /// A self-sent rerouted transfer was refused by this node.
    RerouteRefused {
        query_id: QueryId,
        reason: String,
    },
    UnmatchedReply {
        from: NodeId,
        conversation_id: Option<String>,
    },
    MalformedDropped {
        from: String,
        error: String,
    },
    InvariantViolated {
        detail: &'static str,
    },
}

impl NodeEvent {
    /// Short upper-case label used as the `event` field of log records.
    pub fn label(&self) -> &'static str {
        match self {
            NodeEvent::Started { .. } => "STARTED",
            NodeEvent::Loaded { .. } => "LOAD",
            NodeEvent::TransferRefused { .. } => "REFUSE",
            NodeEvent::Arrived { .. } => "DESTINATION",
            NodeEvent::Unloading { .. } => "UNLOAD",
            NodeEvent::HoldAbandoned { .. } => "HOLD_ABANDONED",
            NodeEvent::HandedOff { .. } => "HANDED_OFF",
            NodeEvent::HandoffDeferred { .. } => "HANDOFF_DEFERRED",
            NodeEvent::HandoffTimedOut { .. } => "HANDOFF_TIMEOUT",
            NodeEvent::NextHopDown { .. } => "NEXT_HOP_DOWN",
            NodeEvent::RetryCapReached { .. } => "RETRY_CAP",
            NodeEvent::StateChanged { .. } => "STATE",
            NodeEvent::QueryStarted { .. } => "QUERY_START",
            NodeEvent::QueryDropped { .. } => "QUERY_DROP",
            NodeEvent::LateQuery { .. } => "QUERY_LATE",
            NodeEvent::QueryAbsorbed { .. } => "QUERY_ABSORB",
            NodeEvent::QueryForwarded { .. } => "QUERY_FORWARD",
            NodeEvent::DestinationReached { .. } => "QUERY_AT_DEST",
            NodeEvent::ReplyForwarded { .. } => "REPLY_FORWARD",
            NodeEvent::RouteFound { .. } => "ROUTE_FOUND",
            NodeEvent::StaleReply { .. } => "STALE_REPLY",
            NodeEvent::QueryAborted { .. } => "QUERY_ABORT",
            NodeEvent::QueryEvicted { .. } => "QUERY_EVICT",
            NodeEvent::StallDetected { .. } => "STALL",
            NodeEvent::PalletReleased { .. } => "PALLET_RELEASED",
            NodeEvent::RerouteDropped { .. } => "REROUTE_DROPPED",
            NodeEvent::RerouteRefused { .. } => "REROUTE_REFUSED",
            NodeEvent::UnmatchedReply { .. } => "UNMATCHED_REPLY",
            NodeEvent::MalformedDropped { .. } => "MALFORMED",
            NodeEvent::InvariantViolated { .. } => "INVARIANT",
        }
    }

    /// Emits this event as one `tracing` record for `node`.
    pub fn log(&self, node: &NodeId) {
        let event = self.label();
        match self {
            NodeEvent::Started {
                neighbours,
                transfer_ms,
            } => info!(%node, event, neighbours, transfer_ms, "conveyor started"),
            NodeEvent::Loaded {
                from,
                target_path,
                elapsed_ms,
            } => info!(%node, event, %from, ?target_path, elapsed_ms, "pallet loaded"),
            NodeEvent::TransferRefused { from, reason } => {
                info!(%node, event, %from, reason = reason.as_str(), "transfer refused")
            }
            NodeEvent::Arrived { total_ms } => {
                info!(%node, event, total_ms, "pallet reached destination")
            }
            NodeEvent::Unloading { next, elapsed_ms } => {
                info!(%node, event, %next, elapsed_ms, "unloading")
            }
            NodeEvent::HoldAbandoned { pallet } => {
                info!(%node, event, pallet, "abandoned hold completed without hand-off")
            }
            NodeEvent::HandedOff { to, attempts } => {
                info!(%node, event, %to, attempts, "hand-off accepted")
            }
            NodeEvent::HandoffDeferred {
                to,
                reason,
                attempts,
            } => info!(%node, event, %to, reason = reason.as_str(), attempts, "hand-off deferred"),
            NodeEvent::HandoffTimedOut { to, attempts } => {
                warn!(%node, event, %to, attempts, "hand-off reply timed out")
            }
            NodeEvent::NextHopDown { to, destination } => {
                warn!(%node, event, %to, %destination, "next hop is down; rerouting")
            }
            NodeEvent::RetryCapReached { to, attempts } => {
                warn!(%node, event, %to, attempts, "hand-off retry cap reached; rerouting")
            }
            NodeEvent::StateChanged {
                from,
                to,
                cleared_pallet,
            } => info!(%node, event, %from, %to, cleared_pallet, "state changed"),
            NodeEvent::QueryStarted { query_id, dest } => {
                info!(%node, event, query_id = query_id.as_str(), %dest, "route query started")
            }
            NodeEvent::QueryDropped {
                query_id,
                cost,
                best_cost,
            } => debug!(%node, event, query_id = query_id.as_str(), cost, best_cost, "query arrival not better"),
            NodeEvent::LateQuery { query_id } => {
                debug!(%node, event, query_id = query_id.as_str(), "request for finished query dropped")
            }
            NodeEvent::QueryAbsorbed { query_id, status } => {
                debug!(%node, event, query_id = query_id.as_str(), %status, "query absorbed")
            }
            NodeEvent::QueryForwarded {
                query_id,
                cost,
                fanout,
            } => debug!(%node, event, query_id = query_id.as_str(), cost, fanout, "query forwarded"),
            NodeEvent::DestinationReached { query_id, cost } => {
                info!(%node, event, query_id = query_id.as_str(), cost, "query reached destination")
            }
            NodeEvent::ReplyForwarded { query_id, to } => {
                debug!(%node, event, query_id = query_id.as_str(), %to, "route reply forwarded")
            }
            NodeEvent::RouteFound {
                query_id,
                path,
                cost,
            } => info!(%node, event, query_id = query_id.as_str(), ?path, cost, "route found"),
            NodeEvent::StaleReply { query_id } => {
                debug!(%node, event, query_id = query_id.as_str(), "reply for unknown query dropped")
            }
            NodeEvent::QueryAborted { query_id, fanout } => {
                debug!(%node, event, query_id = query_id.as_str(), fanout, "query state cleared")
            }
            NodeEvent::QueryEvicted { query_id } => {
                warn!(%node, event, query_id = query_id.as_str(), "query state evicted")
            }
            NodeEvent::StallDetected {
                busy_for_ms,
                destination,
            } => warn!(%node, event, busy_for_ms, %destination, "node stalled"),
            NodeEvent::PalletReleased { pallet } => {
                warn!(%node, event, pallet, "stuck pallet released for reroute")
            }
            NodeEvent::RerouteDropped { query_id, pallet } => info!(
                %node,
                event,
                query_id = query_id.as_str(),
                pallet,
                "route found after pallet left; not reloaded"
            ),
            NodeEvent::RerouteRefused { query_id, reason } => warn!(
                %node,
                event,
                query_id = query_id.as_str(),
                reason = reason.as_str(),
                "rerouted transfer refused by this node"
            ),
            NodeEvent::UnmatchedReply {
                from,
                conversation_id,
            } => debug!(%node, event, %from, ?conversation_id, "reply without a matching loader"),
            NodeEvent::MalformedDropped { from, error } => warn!(
                %node,
                event,
                from = from.as_str(),
                error = error.as_str(),
                "malformed message dropped"
            ),
            NodeEvent::InvariantViolated { detail } => {
                error!(%node, event, detail, "invariant violated; stopping node")
            }
        }
    }
}
