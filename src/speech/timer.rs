//! Timer Queue
//!
//! A single cooperative queue for all controller timers (watchdogs and the
//! muted-restart steps). Every entry carries the generation it was scheduled
//! under; entries from a superseded generation are dropped at fire time, so
//! a stale callback can never act on a newer state.

use tokio::time::Instant;

/// Scheduled timers for one controller instance.
pub struct TimerQueue<K> {
    entries: Vec<Entry<K>>,
}

struct Entry<K> {
    at: Instant,
    generation: u64,
    kind: K,
}

impl<K: Copy + PartialEq> TimerQueue<K> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Schedule `kind` at `at`; replaces an earlier pending entry of the
    /// same kind (timers are reset, not stacked).
    pub fn schedule(&mut self, kind: K, at: Instant, generation: u64) {
        self.entries.retain(|e| e.kind != kind);
        self.entries.push(Entry { at, generation, kind });
    }

    /// Cancel any pending entry of `kind`.
    pub fn cancel(&mut self, kind: K) {
        self.entries.retain(|e| e.kind != kind);
    }

    pub fn is_scheduled(&self, kind: K) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.at).min()
    }

    /// Remove and return due timers in firing order, silently dropping
    /// entries scheduled under an older generation.
    pub fn pop_due(&mut self, now: Instant, current_generation: u64) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = Vec::new();
        self.entries.retain(|e| {
            if e.at > now {
                return true;
            }
            if e.generation == current_generation {
                due.push((e.at, e.kind));
            }
            false
        });
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Copy + PartialEq> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        A,
        B,
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(Kind::B, now + Duration::from_millis(20), 1);
        q.schedule(Kind::A, now + Duration::from_millis(10), 1);

        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(10)));
        let due = q.pop_due(now + Duration::from_millis(25), 1);
        assert_eq!(due, vec![Kind::A, Kind::B]);
        assert!(q.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_dropped() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(Kind::A, now + Duration::from_millis(10), 1);

        // Generation moved on before the timer fired.
        let due = q.pop_due(now + Duration::from_millis(15), 2);
        assert!(due.is_empty());
        assert!(q.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_entry() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(Kind::A, now + Duration::from_millis(10), 1);
        q.schedule(Kind::A, now + Duration::from_millis(30), 1);

        assert!(q.pop_due(now + Duration::from_millis(15), 1).is_empty());
        let due = q.pop_due(now + Duration::from_millis(35), 1);
        assert_eq!(due, vec![Kind::A]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_removes_entry() {
        let now = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(Kind::A, now + Duration::from_millis(10), 1);
        q.cancel(Kind::A);
        assert!(!q.is_scheduled(Kind::A));
        assert!(q.pop_due(now + Duration::from_millis(15), 1).is_empty());
    }
}
