//! A per-worker notion of time, and the timer wheel every layer that owns a deadline schedules
//! against.

use std::collections::BTreeMap;

/// One tick of whatever clock the owning worker advances. The stack itself never interprets this
/// beyond comparing it; callers decide what a tick means (a fixed number of CPU cycles, a
/// millisecond, one call to [`crate::stack::Stack::run_once`], ...).
pub type Tick = u64;

/// Identifies a scheduled timer. Equal to the cycle it expires on, so two timers never collide:
/// [`TimerWheel::schedule`] advances to the next free cycle rather than overwriting one already
/// taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(Tick);

/// An expiration-ordered map from cycle to payload, shared by every layer that needs "do this at
/// or after some future tick" without hand-rolling its own scan over a table of deadlines.
///
/// A tick doesn't invoke anything itself; [`TimerWheel::tick`] drains and returns everything due
/// so far, and the caller acts on each one with whatever `&mut` context the wheel itself doesn't
/// have (a connection table, an outbound queue, ...). That also means a caller is free to call
/// [`TimerWheel::schedule`] or [`TimerWheel::remove`] again while handling one expired entry,
/// since by the time it sees the list the wheel itself is no longer borrowed.
pub struct TimerWheel<T> {
    entries: BTreeMap<Tick, T>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        TimerWheel { entries: BTreeMap::new() }
    }

    /// Schedule `payload` to expire at `now + delay`. If that cycle is already taken, the timer
    /// is pushed to the next free one instead, so every `TimerId` this returns is unique.
    pub fn schedule(&mut self, now: Tick, delay: Tick, payload: T) -> TimerId {
        let mut at = now.saturating_add(delay);
        while self.entries.contains_key(&at) {
            at += 1;
        }
        self.entries.insert(at, payload);
        TimerId(at)
    }

    /// Atomically move a timer to a new delay from `now`, as if by `remove` then `schedule`.
    /// Returns `None` if `id` was not (or no longer) scheduled.
    pub fn reschedule(&mut self, id: TimerId, now: Tick, delay: Tick) -> Option<TimerId> {
        let payload = self.entries.remove(&id.0)?;
        Some(self.schedule(now, delay, payload))
    }

    /// Cancel a scheduled timer. Returns whether it was still pending.
    pub fn remove(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    /// Pop every timer whose expiration is `<= now`, oldest first.
    pub fn tick(&mut self, now: Tick) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some((&at, _)) = self.entries.iter().next() {
            if at > now {
                break;
            }
            let payload = self.entries.remove(&at).expect("just peeked this key");
            due.push((TimerId(at), payload));
        }
        due
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        TimerWheel::new()
    }
}
