//! Single-owner deadline queue.
//!
//! All sequence delays (trigger settle, cycle restart, response timeouts) are
//! entries here rather than independent timers. The owner pops expired entries
//! on its own task, so a deadline can never race a stop request.

use std::collections::BTreeMap;
use tokio::time::Instant;

/// What a deadline is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The outstanding serial command has not completed in time.
    CommandTimeout,
    /// Settle time before the vision trigger has elapsed.
    TriggerSettle,
    /// No vision reply arrived in time.
    TriggerReplyTimeout,
    /// Pause between cycles has elapsed.
    CycleRestart,
}

/// Handle for cancelling one scheduled deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// Monotonic deadline queue ordered by expiry, then scheduling order.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    entries: BTreeMap<(Instant, TimerToken), TimerKind>,
    next_token: u64,
}

impl DeadlineQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` to expire at `at`.
    pub fn schedule(&mut self, at: Instant, kind: TimerKind) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        self.entries.insert((at, token), kind);
        token
    }

    /// Cancel one deadline. Returns whether it was still pending.
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, t), _| *t != token);
        self.entries.len() != before
    }

    /// Cancel every pending deadline of `kind`.
    pub fn cancel_kind(&mut self, kind: TimerKind) {
        self.entries.retain(|_, k| *k != kind);
    }

    /// Cancel everything.
    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest deadline if it has expired by `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerToken, TimerKind)> {
        let (&(at, token), &kind) = self.entries.iter().next()?;
        if at > now {
            return None;
        }
        self.entries.remove(&(at, token));
        Some((token, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule(now + Duration::from_secs(3), TimerKind::TriggerSettle);
        queue.schedule(now + Duration::from_millis(100), TimerKind::CycleRestart);

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(100)));
        assert!(queue.pop_expired(now).is_none());

        let later = now + Duration::from_secs(5);
        assert_eq!(queue.pop_expired(later).map(|(_, k)| k), Some(TimerKind::CycleRestart));
        assert_eq!(queue.pop_expired(later).map(|(_, k)| k), Some(TimerKind::TriggerSettle));
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn equal_deadlines_keep_scheduling_order() {
        let at = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule(at, TimerKind::CommandTimeout);
        queue.schedule(at, TimerKind::CycleRestart);
        assert_eq!(queue.pop_expired(at).map(|(_, k)| k), Some(TimerKind::CommandTimeout));
        assert_eq!(queue.pop_expired(at).map(|(_, k)| k), Some(TimerKind::CycleRestart));
    }

    #[test]
    fn cancellation() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::new();
        let settle = queue.schedule(now, TimerKind::TriggerSettle);
        queue.schedule(now, TimerKind::CommandTimeout);
        queue.schedule(now, TimerKind::CommandTimeout);

        assert!(queue.cancel(settle));
        assert!(!queue.cancel(settle));
        assert_eq!(queue.next_deadline(), Some(now));
        queue.cancel_kind(TimerKind::CommandTimeout);
        assert_eq!(queue.next_deadline(), None);

        queue.schedule(now, TimerKind::CycleRestart);
        queue.cancel_all();
        assert_eq!(queue.next_deadline(), None);
    }
}
