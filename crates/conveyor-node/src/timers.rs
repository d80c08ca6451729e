use std::collections::BTreeMap;

use conveyor_core::NodeId;

/// Scheduled wake-up kinds handled by the node event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Pallet hold finished; hand off along `next_path`.
    HoldComplete {
        pallet: u64,
        next_path: Vec<NodeId>,
        elapsed_ms: u64,
    },
    /// Resend the hand-off request of a loader.
    LoaderRetry { conversation_id: String },
    /// No reply arrived for `attempt` of a loader.
    ReplyTimeout {
        conversation_id: String,
        attempt: u32,
    },
    /// Periodic stall check.
    Watchdog,
}

/// Monotonic-millisecond timer queue; equal deadlines fire in schedule order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(u64, u64), TimerKind>,
    seq: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, deadline_ms: u64, kind: TimerKind) {
        self.seq += 1;
        self.entries.insert((deadline_ms, self.seq), kind);
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.first_key_value().map(|((deadline, _), _)| *deadline)
    }

    /// Pops the earliest timer whose deadline is at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<(u64, TimerKind)> {
        if self.next_deadline()? > now_ms {
            return None;
        }
        self.entries
            .pop_first()
            .map(|((deadline, _), kind)| (deadline, kind))
    }

    /// Timers other than the periodic watchdog.
    pub fn pending_work(&self) -> usize {
        self.entries
            .values()
            .filter(|kind| !matches!(kind, TimerKind::Watchdog))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::{TimerKind, TimerQueue};

    #[test]
    fn nothing_fires_before_deadline() {
        let mut timers = TimerQueue::default();
        timers.schedule(100, TimerKind::Watchdog);
        assert_eq!(timers.next_deadline(), Some(100));
        assert!(timers.pop_due(99).is_none());
        assert_eq!(timers.pop_due(100), Some((100, TimerKind::Watchdog)));
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let mut timers = TimerQueue::default();
        timers.schedule(
            50,
            TimerKind::LoaderRetry {
                conversation_id: "first".into(),
            },
        );
        timers.schedule(10, TimerKind::Watchdog);
        timers.schedule(
            50,
            TimerKind::LoaderRetry {
                conversation_id: "second".into(),
            },
        );

        assert_eq!(timers.pop_due(60), Some((10, TimerKind::Watchdog)));
        assert!(matches!(
            timers.pop_due(60),
            Some((50, TimerKind::LoaderRetry { conversation_id })) if conversation_id == "first"
        ));
        assert!(matches!(
            timers.pop_due(60),
            Some((50, TimerKind::LoaderRetry { conversation_id })) if conversation_id == "second"
        ));
        assert!(timers.pop_due(u64::MAX).is_none());
    }

    #[test]
    fn watchdog_is_not_pending_work() {
        let mut timers = TimerQueue::default();
        timers.schedule(10, TimerKind::Watchdog);
        assert_eq!(timers.pending_work(), 0);
        timers.schedule(
            20,
            TimerKind::ReplyTimeout {
                conversation_id: "c".into(),
                attempt: 1,
            },
        );
        assert_eq!(timers.pending_work(), 1);
    }
}
