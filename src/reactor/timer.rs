use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Identity of a registered timer, used to cancel or re-arm it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline) && self.id == other.id
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of timers keyed by expiry.
///
/// Each live timer has one queued heap entry. Cancelled timers leave their
/// entry behind until it reaches the top. Pushing a deadline later only
/// updates `live`; the queued entry is re-pushed when it surfaces early.
/// Pulling it earlier queues a fresh entry and strands the old one, which is
/// why the heap is rebuilt once stale entries outnumber live ones.
pub struct TimerHeap<T> {
    heap: BinaryHeap<TimerEntry>,
    live: HashMap<TimerId, Pending<T>>,
    next_id: u64,
}

struct Pending<T> {
    deadline: Instant,
    /// Deadline of the entry currently queued for this timer.
    queued: Instant,
    callback: T,
}

/// Stale entries tolerated before the heap is rebuilt.
const COMPACT_SLACK: usize = 64;

impl<T: Clone> TimerHeap<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, callback: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.live.insert(
            id,
            Pending {
                deadline,
                queued: deadline,
                callback,
            },
        );
        self.heap.push(TimerEntry { deadline, id });
        self.compact();
        id
    }

    /// Removes the timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let removed = self.live.remove(&id).is_some();
        if removed {
            self.compact();
        }
        removed
    }

    /// Moves the timer to a new deadline, keeping its callback.
    pub fn reschedule(&mut self, id: TimerId, deadline: Instant) -> bool {
        let Some(pending) = self.live.get_mut(&id) else {
            return false;
        };
        pending.deadline = deadline;
        if deadline < pending.queued {
            pending.queued = deadline;
            self.heap.push(TimerEntry { deadline, id });
            self.compact();
        }
        true
    }

    /// Earliest live deadline, if any timer is pending.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            let (id, at) = (top.id, top.deadline);
            match self.live.get_mut(&id) {
                Some(pending) if pending.queued == at => {
                    if pending.deadline == at {
                        return Some(at);
                    }
                    // Deferred since it was queued.
                    pending.queued = pending.deadline;
                    let deadline = pending.deadline;
                    self.heap.pop();
                    self.heap.push(TimerEntry { deadline, id });
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Removes and returns the callbacks of every timer due at or before `now`,
    /// in expiry order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(top) = self.heap.pop() {
                if let Some(pending) = self.live.remove(&top.id) {
                    fired.push(pending.callback);
                }
            }
        }
        fired
    }

    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + COMPACT_SLACK {
            return;
        }
        self.heap = self
            .live
            .iter_mut()
            .map(|(id, pending)| {
                pending.queued = pending.deadline;
                TimerEntry {
                    deadline: pending.deadline,
                    id: *id,
                }
            })
            .collect();
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<T: Clone> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        timers.insert(now + Duration::from_millis(30), "c");
        timers.insert(now + Duration::from_millis(10), "a");
        timers.insert(now + Duration::from_millis(20), "b");

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert_eq!(timers.pop_expired(now + Duration::from_millis(25)), vec!["a", "b"]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        let id = timers.insert(now, 1);

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.pop_expired(now).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn reschedule_moves_deadline() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        let id = timers.insert(now + Duration::from_millis(5), "late");

        assert!(timers.reschedule(id, now + Duration::from_secs(60)));
        assert!(timers.pop_expired(now + Duration::from_millis(10)).is_empty());
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(60)));
        assert_eq!(timers.pop_expired(now + Duration::from_secs(61)), vec!["late"]);
        assert!(!timers.reschedule(id, now));
    }

    #[test]
    fn deferring_a_timer_does_not_queue_entries() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        timers.insert(now + Duration::from_secs(60), "other");
        let id = timers.insert(now + Duration::from_secs(1), "session");

        for i in 0..10_000u64 {
            assert!(timers.reschedule(id, now + Duration::from_secs(2) + Duration::from_millis(i)));
        }
        assert_eq!(timers.heap.len(), 2);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(11_999)));
        assert_eq!(timers.heap.len(), 2);
        assert!(timers.pop_expired(now + Duration::from_secs(5)).is_empty());
        assert_eq!(timers.pop_expired(now + Duration::from_secs(13)), vec!["session"]);
    }

    #[test]
    fn pulling_timers_earlier_stays_bounded() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        let id = timers.insert(now + Duration::from_secs(100_000), "early");

        for i in (0..10_000u64).rev() {
            timers.reschedule(id, now + Duration::from_secs(i));
        }
        assert!(timers.heap.len() <= 1 + COMPACT_SLACK + 2);
        assert_eq!(timers.next_deadline(), Some(now));
        assert_eq!(timers.pop_expired(now), vec!["early"]);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn cancelled_entries_are_reclaimed() {
        let now = Instant::now();
        let mut timers = TimerHeap::new();
        let keep = timers.insert(now + Duration::from_secs(1), 0);
        for i in 0..10_000 {
            let id = timers.insert(now + Duration::from_secs(60), i);
            timers.cancel(id);
        }
        assert!(timers.heap.len() <= 2 * timers.len() + COMPACT_SLACK + 1);
        assert!(timers.cancel(keep));
        assert!(timers.is_empty());
    }
}
