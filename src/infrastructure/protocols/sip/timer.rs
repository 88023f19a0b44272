//! Timer arena
//!
//! One ordered set of deadlines shared by every owner. Each scheduled timer
//! gets an id which is the only handle needed to cancel it. A single task
//! sleeps until the earliest deadline and drains whatever is due.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

struct Slots<T> {
    // Ordered by deadline, ties broken by id so that no entry shadows another
    by_deadline: BTreeMap<(Instant, TimerId), T>,
    by_id: HashMap<TimerId, Instant>,
}

pub struct TimerArena<T> {
    slots: Mutex<Slots<T>>,
    next_id: AtomicU64,
    changed: Notify,
}

impl<T> Default for TimerArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                by_deadline: BTreeMap::new(),
                by_id: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schedule(&self, delay: Duration, value: T) -> TimerId {
        self.schedule_at(Instant::now() + delay, value)
    }

    pub fn schedule_at(&self, deadline: Instant, value: T) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut slots = self.slots();
            slots.by_deadline.insert((deadline, id), value);
            slots.by_id.insert(id, deadline);
        }
        self.changed.notify_one();
        id
    }

    /// Remove a pending timer. Cancelling a fired or unknown id is a no-op.
    pub fn cancel(&self, id: TimerId) -> Option<T> {
        let mut slots = self.slots();
        let deadline = slots.by_id.remove(&id)?;
        slots.by_deadline.remove(&(deadline, id))
    }

    /// Take every timer due at `now`, earliest first
    pub fn poll(&self, now: Instant) -> Vec<(TimerId, T)> {
        let mut slots = self.slots();
        let mut due = Vec::new();
        while let Some(entry) = slots.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), value) = entry.remove_entry();
            slots.by_id.remove(&id);
            due.push((id, value));
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots().by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.slots().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next `schedule`, or immediately if one happened
    /// since the last wait
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Sleep until something is due, then return it
    pub async fn next_due(&self) -> Vec<(TimerId, T)> {
        loop {
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.changed() => continue,
                    }
                }
                None => {
                    self.changed().await;
                    continue;
                }
            }
            let due = self.poll(Instant::now());
            if !due.is_empty() {
                return due;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_order_and_ties() {
        let arena = TimerArena::new();
        let now = Instant::now();
        let a = arena.schedule_at(now + Duration::from_millis(10), "a");
        let b = arena.schedule_at(now + Duration::from_millis(10), "b");
        arena.schedule_at(now + Duration::from_millis(5), "c");
        arena.schedule_at(now + Duration::from_millis(50), "d");
        assert!(a < b);
        assert_eq!(arena.len(), 4);

        let due: Vec<_> = arena
            .poll(now + Duration::from_millis(10))
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(due, vec!["c", "a", "b"]);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let arena = TimerArena::new();
        let id = arena.schedule(Duration::from_millis(10), 1u32);
        assert_eq!(arena.cancel(id), Some(1));
        assert_eq!(arena.cancel(id), None);
        assert!(arena.is_empty());
        assert!(arena.poll(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_due_waits_for_deadline() {
        let arena = TimerArena::new();
        let start = Instant::now();
        arena.schedule(Duration::from_millis(500), "t1");
        let due = arena.next_due().await;
        assert_eq!(due.len(), 1);
        assert!(Instant::now() - start >= Duration::from_millis(500));
    }
}
