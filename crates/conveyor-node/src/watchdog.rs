use conveyor_core::NodeStatus;

use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};
use crate::timers::TimerKind;

/// Whether a pallet held for `busy_for_ms` warrants a new reroute query.
/// Queries are relaunched at most once per `busy_timeout_ms`.
pub fn is_stalled(
    busy_for_ms: u64,
    last_reroute_ms: Option<u64>,
    now_ms: u64,
    busy_timeout_ms: u64,
) -> bool {
    if busy_for_ms <= busy_timeout_ms {
        return false;
    }
    match last_reroute_ms {
        None => true,
        Some(last) => now_ms.saturating_sub(last) >= busy_timeout_ms,
    }
}

impl ConveyorNode {
    pub(crate) fn on_watchdog(&mut self, now_ms: u64, step: &mut Step) -> Result<(), NodeError> {
        if !self.timings.watchdog_enabled {
            return Ok(());
        }
        self.timers.schedule(
            now_ms.saturating_add(self.timings.watchdog_period_ms),
            TimerKind::Watchdog,
        );
        if self.state.status != NodeStatus::Busy {
            return Ok(());
        }
        let Some(pallet) = self.state.pallet.as_mut() else {
            return Ok(());
        };
        let busy_for_ms = now_ms.saturating_sub(pallet.busy_since_ms);
        if !is_stalled(
            busy_for_ms,
            pallet.last_reroute_ms,
            now_ms,
            self.timings.busy_timeout_ms,
        ) {
            return Ok(());
        }
        pallet.last_reroute_ms = Some(now_ms);
        let seq = pallet.seq;
        let destination = pallet.destination.clone();
        self.emit(
            step,
            NodeEvent::StallDetected {
                busy_for_ms,
                destination: destination.clone(),
            },
        );
        let query_id = self.start_query(destination, step)?;
        self.state.reroutes.insert(query_id, seq);
        Ok(())
    }
}
