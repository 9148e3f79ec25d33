//! One-shot timers ordered by deadline.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::reactor::LoopHandle;

/// Identifier of a pending timer. Kept across rearms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What a timer callback wants done with its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Drop the timer.
    Done,
    /// Fire again after the duration, under the same id.
    Rearm(Duration),
}

/// Callback invoked on the loop thread when a timer expires.
pub type TimerCallback = Box<dyn FnMut(&LoopHandle, TimerId) -> TimerAction + Send>;

/// A deadline of `None` never expires: the delay overflowed the clock.
struct Pending {
    deadline: Option<Instant>,
    callback: TimerCallback,
}

pub(crate) struct Timers {
    queue: BTreeSet<(Instant, TimerId)>,
    pending: HashMap<TimerId, Pending>,
    next_id: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            queue: BTreeSet::new(),
            pending: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Option<Instant>, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.schedule(id, deadline, callback);
        id
    }

    /// Put a fired timer back under its id.
    pub(crate) fn schedule(
        &mut self,
        id: TimerId,
        deadline: Option<Instant>,
        callback: TimerCallback,
    ) {
        if let Some(deadline) = deadline {
            self.queue.insert((deadline, id));
        }
        self.pending.insert(id, Pending { deadline, callback });
    }

    /// Returns false if the timer is not pending (already fired, cancelled,
    /// or currently running).
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                if let Some(deadline) = pending.deadline {
                    self.queue.remove(&(deadline, id));
                }
                true
            }
            None => false,
        }
    }

    /// `Duration::MAX` for a timer that never expires.
    pub(crate) fn remaining(&self, id: TimerId, now: Instant) -> Option<Duration> {
        self.pending.get(&id).map(|pending| match pending.deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => Duration::MAX,
        })
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|&(deadline, _)| deadline)
    }

    /// Ids of every timer due at `now`, earliest first.
    pub(crate) fn due(&self, now: Instant) -> Vec<TimerId> {
        self.queue
            .iter()
            .take_while(|&&(deadline, _)| deadline <= now)
            .map(|&(_, id)| id)
            .collect()
    }

    /// Remove a timer for firing if it is still pending and due.
    pub(crate) fn take_due(&mut self, id: TimerId, now: Instant) -> Option<TimerCallback> {
        let deadline = self.pending.get(&id)?.deadline?;
        if deadline > now {
            return None;
        }
        self.queue.remove(&(deadline, id));
        self.pending.remove(&id).map(|pending| pending.callback)
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.queue.clear();
        self.pending.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// The instant `delay` after `now`, or `None` past the end of the clock.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Option<Instant> {
    now.checked_add(delay)
}
