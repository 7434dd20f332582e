use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::TimerId;

/// Repeating timers never fire more often than this, so a zero interval
/// cannot starve I/O.
const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) enum TimerTask {
    Once(Box<dyn FnOnce()>),
    Every {
        interval: Duration,
        callback: Rc<dyn Fn(TimerId)>,
    },
}

/// A timer popped from the queue, ready to run.
pub(crate) enum DueTimer {
    Once(TimerId, Box<dyn FnOnce()>),
    Every(TimerId, Rc<dyn Fn(TimerId)>),
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    id: TimerId,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for Scheduled {
    /// Reversed so that `BinaryHeap` pops the earliest deadline first; ties
    /// fall back to scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of deadlines plus the live task table.
///
/// Cancelling only removes the task; its heap slot is discarded lazily when
/// it reaches the top.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Scheduled>,
    tasks: HashMap<TimerId, TimerTask>,
    next_id: u64,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn add_once(&mut self, after: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        self.add(after, TimerTask::Once(callback))
    }

    pub(crate) fn add_repeating(
        &mut self,
        interval: Duration,
        callback: Rc<dyn Fn(TimerId)>,
    ) -> TimerId {
        let interval = interval.max(MIN_REPEAT_INTERVAL);
        self.add(interval, TimerTask::Every { interval, callback })
    }

    fn add(&mut self, after: Duration, task: TimerTask) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = TimerId(self.next_id);
        self.tasks.insert(id, task);
        self.schedule(id, Instant::now() + after);
        id
    }

    fn schedule(&mut self, id: TimerId, deadline: Instant) {
        self.seq += 1;
        self.heap.push(Scheduled {
            deadline,
            seq: self.seq,
            id,
        });
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.tasks.remove(&id).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
        self.heap.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|s| s.deadline)
    }

    /// Pops one timer whose deadline is at or before `now`. Repeating timers
    /// are rescheduled before being handed out, so their callback may cancel
    /// them.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<DueTimer> {
        self.discard_cancelled();
        if self.heap.peek()?.deadline > now {
            return None;
        }
        let top = self.heap.pop()?;
        match self.tasks.remove(&top.id)? {
            TimerTask::Once(callback) => Some(DueTimer::Once(top.id, callback)),
            TimerTask::Every { interval, callback } => {
                let due = DueTimer::Every(top.id, callback.clone());
                self.tasks
                    .insert(top.id, TimerTask::Every { interval, callback });
                self.schedule(top.id, now + interval);
                Some(due)
            }
        }
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.tasks.contains_key(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }
}
