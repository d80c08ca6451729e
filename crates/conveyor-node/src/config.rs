use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use conveyor_core::{ConveyorError, NodeId};

/// Immutable per-node layout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Downstream nodes reachable in one hop, in preference order.
    pub neighbours: Vec<NodeId>,
    /// Nominal hold time while a pallet sits on this node.
    pub transfer_ms: u64,
}

impl NodeConfig {
    pub fn new<I, S>(node_id: &str, neighbours: I, transfer_ms: u64) -> Result<Self, ConveyorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let config = Self {
            node_id: NodeId::new(node_id)?,
            neighbours: neighbours
                .into_iter()
                .map(|n| NodeId::new(n.as_ref()))
                .collect::<Result<_, _>>()?,
            transfer_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConveyorError> {
        if self.node_id.as_str().trim().is_empty() {
            return Err(ConveyorError::InvalidNodeId);
        }
        let mut seen = HashSet::with_capacity(self.neighbours.len());
        for neighbour in &self.neighbours {
            if neighbour.as_str().trim().is_empty() {
                return Err(ConveyorError::InvalidNodeId);
            }
            if *neighbour == self.node_id {
                return Err(ConveyorError::InvalidInput("node cannot be its own neighbour"));
            }
            if !seen.insert(neighbour) {
                return Err(ConveyorError::InvalidInput("duplicate neighbour"));
            }
        }
        Ok(())
    }

    pub fn is_neighbour(&self, node: &NodeId) -> bool {
        self.neighbours.contains(node)
    }
}

/// What a stalled node does with a route found by its watchdog query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallReroutePolicy {
    /// Self-send the new path while still BUSY; the request is refused and
    /// the refusal is reported as a `RerouteRefused` event.
    #[default]
    SelfRequest,
    /// Abandon the stuck pallet's hold, return to IDLE, then self-send the
    /// new path so it is accepted.
    ReleaseAndReload,
}

/// Protocol timing knobs shared by every node of a layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTimings {
    /// Fixed wait before resending a refused hand-off request.
    pub load_retry_ms: u64,
    /// Wait for any reply to a hand-off request before treating it as lost.
    pub reply_timeout_ms: u64,
    /// BUSY duration after which the watchdog starts a reroute query.
    pub busy_timeout_ms: u64,
    /// Watchdog period.
    pub watchdog_period_ms: u64,
    pub watchdog_enabled: bool,
    /// Retries allowed per hand-off before escalating to route discovery.
    /// `None` retries forever.
    pub load_max_retries: Option<u32>,
    /// Upper bound on remembered route-discovery queries.
    pub max_tracked_queries: usize,
    pub stall_reroute: StallReroutePolicy,
}

impl Default for NodeTimings {
    fn default() -> Self {
        Self {
            load_retry_ms: 4_000,
            reply_timeout_ms: 10_000,
            busy_timeout_ms: 8_000,
            watchdog_period_ms: 1_000,
            watchdog_enabled: true,
            load_max_retries: None,
            max_tracked_queries: 4_096,
            stall_reroute: StallReroutePolicy::SelfRequest,
        }
    }
}

impl NodeTimings {
    pub fn builder() -> NodeTimingsBuilder {
        NodeTimingsBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConveyorError> {
        if self.load_retry_ms == 0 {
            return Err(ConveyorError::InvalidInput("load_retry_ms must be positive"));
        }
        if self.reply_timeout_ms == 0 {
            return Err(ConveyorError::InvalidInput("reply_timeout_ms must be positive"));
        }
        if self.watchdog_period_ms == 0 {
            return Err(ConveyorError::InvalidInput("watchdog_period_ms must be positive"));
        }
        if self.max_tracked_queries == 0 {
            return Err(ConveyorError::InvalidInput("max_tracked_queries must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NodeTimingsBuilder {
    inner: NodeTimings,
}

impl NodeTimingsBuilder {
    pub fn load_retry_ms(mut self, value: u64) -> Self {
        self.inner.load_retry_ms = value;
        self
    }

    pub fn reply_timeout_ms(mut self, value: u64) -> Self {
        self.inner.reply_timeout_ms = value;
        self
    }

    pub fn busy_timeout_ms(mut self, value: u64) -> Self {
        self.inner.busy_timeout_ms = value;
        self
    }

    pub fn watchdog_period_ms(mut self, value: u64) -> Self {
        self.inner.watchdog_period_ms = value;
        self
    }

    pub fn watchdog_enabled(mut self, value: bool) -> Self {
        self.inner.watchdog_enabled = value;
        self
    }

    pub fn load_max_retries(mut self, value: Option<u32>) -> Self {
        self.inner.load_max_retries = value;
        self
    }

    pub fn max_tracked_queries(mut self, value: usize) -> Self {
        self.inner.max_tracked_queries = value;
        self
    }

    pub fn stall_reroute(mut self, value: StallReroutePolicy) -> Self {
        self.inner.stall_reroute = value;
        self
    }

    pub fn build(self) -> NodeTimings {
        self.inner
    }
}
