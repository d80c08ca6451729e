use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;

use conveyor_codec::TransferPallet;
use conveyor_core::{NodeId, NodeStatus, QueryId};

/// Bookkeeping for the pallet currently held by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PalletInFlight {
    /// Node-local sequence number of this pallet; ties hold timers to it.
    pub seq: u64,
    /// Last element of the path being executed.
    pub destination: NodeId,
    pub busy_since_ms: u64,
    /// Hold time accumulated on earlier hops.
    pub elapsed_ms: u64,
    /// Last time the watchdog launched a reroute query for this pallet.
    pub last_reroute_ms: Option<u64>,
}

/// Where a query reached this node from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predecessor {
    /// This node started the query.
    Origin,
    /// Neighbour that delivered the best-cost arrival.
    Node(NodeId),
}

/// Best cost and predecessor for one query, kept together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntry {
    pub best_cost: u64,
    pub predecessor: Predecessor,
}

/// Soft per-query routing state, bounded by least-recent use.
///
/// Finished queries leave a tombstone so that flood copies still in transit
/// cannot recreate their state.
#[derive(Debug)]
pub struct QueryTable {
    entries: LruCache<QueryId, QueryEntry>,
    retired: LruCache<QueryId, ()>,
}

impl QueryTable {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            retired: LruCache::new(capacity),
        }
    }

    pub fn peek(&self, query_id: &str) -> Option<&QueryEntry> {
        self.entries.peek(query_id)
    }

    /// Records an entry, returning the id of a query evicted to make room.
    pub fn record(&mut self, query_id: QueryId, entry: QueryEntry) -> Option<QueryId> {
        match self.entries.push(query_id.clone(), entry) {
            Some((evicted, _)) if evicted != query_id => Some(evicted),
            _ => None,
        }
    }

    /// Drops the entry of a finished query and remembers it as retired.
    pub fn retire(&mut self, query_id: &str) -> Option<QueryEntry> {
        self.retired.put(query_id.to_string(), ());
        self.entries.pop(query_id)
    }

    pub fn is_retired(&self, query_id: &str) -> bool {
        self.retired.contains(query_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One outstanding hand-off to a downstream neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffLoader {
    pub conversation_id: String,
    pub receiver: NodeId,
    pub request: TransferPallet,
    pub destination: NodeId,
    /// Requests sent so far.
    pub attempts: u32,
    /// Attempt whose reply is outstanding; `None` while waiting to retry.
    pub awaiting: Option<u32>,
    pub started_ms: u64,
}

/// Mutable node-local state owned by the node's event loop.
#[derive(Debug)]
pub struct LocalState {
    pub status: NodeStatus,
    pub pallet: Option<PalletInFlight>,
    pub queries: QueryTable,
    /// Outstanding hand-offs keyed by conversation id.
    pub loaders: HashMap<String, HandoffLoader>,
    /// Pallet holds whose completion must not hand off.
    pub abandoned_holds: HashSet<u64>,
    /// Watchdog queries started at this node, with the pallet each serves.
    pub reroutes: HashMap<QueryId, u64>,
    pub next_seq: u64,
}

impl LocalState {
    pub fn new(max_tracked_queries: NonZeroUsize) -> Self {
        Self {
            status: NodeStatus::Idle,
            pallet: None,
            queries: QueryTable::new(max_tracked_queries),
            loaders: HashMap::new(),
            abandoned_holds: HashSet::new(),
            reroutes: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn holds_pallet(&self, seq: u64) -> bool {
        self.pallet.as_ref().is_some_and(|p| p.seq == seq)
    }

    /// Drops the held pallet along with the watchdog queries launched for it.
    pub fn take_pallet(&mut self) -> Option<PalletInFlight> {
        let pallet = self.pallet.take()?;
        self.reroutes.retain(|_, seq| *seq != pallet.seq);
        Some(pallet)
    }
}
