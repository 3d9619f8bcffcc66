//! Alarm scheduler (spec §3 Alarm, §4.1 Event loop).
//!
//! One `Timer` is owned by each worker's event loop. `Set` returns an opaque
//! id; the callback reports back either a new fire time or the sentinel
//! "stop". Firing is driven by racing `tokio::time::sleep_until` against
//! socket readiness in the worker's `select!` (see `worker::Worker::run`).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    pub struct AlarmId;
}

/// What an alarm callback asks the scheduler to do next.
pub enum AlarmAction {
    /// Fire again at this absolute time.
    Reschedule(Instant),
    /// Remove the alarm; further `Cancel` calls on its id are no-ops.
    Stop,
}

type Callback = Box<dyn FnMut() -> AlarmAction + Send>;

struct Entry {
    fire_at: Instant,
    callback: Callback,
}

/// Binary-heap backed alarm scheduler. Stale heap entries (from a
/// reschedule or cancellation) are discarded lazily when popped, since
/// `BinaryHeap` has no decrease-key operation.
#[derive(Default)]
pub struct Timer {
    alarms: SlotMap<AlarmId, Entry>,
    heap: BinaryHeap<Reverse<(Instant, AlarmId)>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to first fire at `fire_at`.
    pub fn set(&mut self, fire_at: Instant, callback: Callback) -> AlarmId {
        let id = self.alarms.insert(Entry { fire_at, callback });
        self.heap.push(Reverse((fire_at, id)));
        id
    }

    /// Convenience: schedule relative to now.
    pub fn set_after(&mut self, delay: Duration, callback: Callback) -> AlarmId {
        self.set(Instant::now() + delay, callback)
    }

    /// Removes an alarm. Safe to call on an id that already fired its last
    /// (`Stop`) tick or was already cancelled.
    pub fn cancel(&mut self, id: AlarmId) {
        self.alarms.remove(id);
    }

    /// Absolute time of the next due alarm, if any is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Runs every alarm whose fire time has passed as of `now`, rescheduling
    /// or dropping each according to its callback's return value. Returns
    /// the number of callbacks invoked.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.alarms.get_mut(id) else {
                continue; // cancelled
            };
            if entry.fire_at != at {
                continue; // stale heap entry from an earlier schedule
            }

            fired += 1;
            match (entry.callback)() {
                AlarmAction::Reschedule(next) => {
                    entry.fire_at = next;
                    self.heap.push(Reverse((next, id)));
                }
                AlarmAction::Stop => {
                    self.alarms.remove(id);
                }
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_due_alarms_and_skips_future_ones() {
        let mut timer = Timer::new();
        let now = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        timer.set(now, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
            AlarmAction::Stop
        }));
        timer.set(now + Duration::from_secs(3600), Box::new(|| AlarmAction::Stop));

        let count = timer.run_due(now);
        assert_eq!(count, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.len(), 1);
    }

    #[test]
    fn reschedule_keeps_alarm_alive() {
        let mut timer = Timer::new();
        let now = Instant::now();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let start = now;
        timer.set(now, Box::new(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                AlarmAction::Reschedule(start)
            } else {
                AlarmAction::Stop
            }
        }));

        timer.run_due(now);
        timer.run_due(now);
        timer.run_due(now);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timer.is_empty());
    }

    #[test]
    fn cancel_prevents_future_firing() {
        let mut timer = Timer::new();
        let now = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = timer.set(now, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
            AlarmAction::Stop
        }));
        timer.cancel(id);
        timer.run_due(now);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_deadline_reports_earliest() {
        let mut timer = Timer::new();
        let now = Instant::now();
        timer.set(now + Duration::from_secs(5), Box::new(|| AlarmAction::Stop));
        timer.set(now + Duration::from_secs(1), Box::new(|| AlarmAction::Stop));
        assert_eq!(timer.next_deadline(), Some(now + Duration::from_secs(1)));
    }
}
