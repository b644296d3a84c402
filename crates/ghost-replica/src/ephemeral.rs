//! Bounded ephemeral event log.
//!
//! Transient peer signals (heartbeats, residue exchange, announcements) are
//! appended here and consumed once on arrival. The log is never part of the
//! replicated content. When a push takes it past its cap, the oldest half is
//! dropped in a single operation, so the log never holds more than `cap`
//! entries once `push` returns.

use std::collections::VecDeque;

/// Default capacity of the ephemeral log.
pub const DEFAULT_EPHEMERAL_CAP: usize = 100;

/// Append-only, hard-capped event log.
#[derive(Debug, Clone)]
pub struct EphemeralLog<T> {
    cap: usize,
    events: VecDeque<T>,
    pruned_total: u64,
}

impl<T> EphemeralLog<T> {
    /// Create a log with the given cap (at least 1).
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            events: VecDeque::with_capacity(cap + 1),
            pruned_total: 0,
        }
    }

    /// Append an event. Returns how many old events were pruned.
    pub fn push(&mut self, event: T) -> usize {
        self.events.push_back(event);
        if self.events.len() > self.cap {
            let prune = self.events.len() / 2;
            self.events.drain(..prune);
            self.pruned_total += prune as u64;
            prune
        } else {
            0
        }
    }

    /// The configured cap.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Current length.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events pruned over the lifetime of the log.
    pub fn pruned_total(&self) -> u64 {
        self.pruned_total
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.events.iter()
    }

    /// The newest `n` events, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl<T> Default for EphemeralLog<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EPHEMERAL_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prunes_oldest_half_when_cap_exceeded() {
        let mut log = EphemeralLog::new(100);
        for i in 0..100 {
            assert_eq!(log.push(i), 0);
        }
        assert_eq!(log.len(), 100);

        // 101st event overflows: 50 oldest go at once.
        assert_eq!(log.push(100), 50);
        assert_eq!(log.len(), 51);
        assert_eq!(log.iter().next(), Some(&50));
        assert_eq!(log.iter().last(), Some(&100));
        assert_eq!(log.pruned_total(), 50);
    }

    #[test]
    fn recent_returns_tail() {
        let mut log = EphemeralLog::new(10);
        for i in 0..5 {
            log.push(i);
        }
        let tail: Vec<_> = log.recent(2).copied().collect();
        assert_eq!(tail, vec![3, 4]);
        let all: Vec<_> = log.recent(50).copied().collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn zero_cap_is_clamped() {
        let mut log = EphemeralLog::new(0);
        log.push("a");
        log.push("b");
        assert!(log.len() <= 1);
    }

    proptest! {
        #[test]
        fn never_exceeds_cap(cap in 1usize..200, pushes in 0usize..1000) {
            let mut log = EphemeralLog::new(cap);
            for i in 0..pushes {
                log.push(i);
                prop_assert!(log.len() <= cap);
            }
        }

        #[test]
        fn keeps_newest_event(cap in 1usize..50, pushes in 1usize..300) {
            let mut log = EphemeralLog::new(cap);
            for i in 0..pushes {
                log.push(i);
            }
            prop_assert_eq!(log.iter().last().copied(), Some(pushes - 1));
        }
    }
}
