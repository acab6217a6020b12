//! Preemption and alarm timers.
//!
//! The preemption timer runs on the shared reactor and periodically raises a
//! flag asking the interpreter to yield the running lightweight thread. This
//! is language-level time slicing; it has nothing to do with how the host
//! schedules engine threads.
//!
//! Alarms are one-shot, language-level wakeups ("resume after N ms"). They
//! live on the engine thread in a min-heap; the run loop uses the earliest
//! deadline as its wait timeout and posts expired alarms into the engine's
//! own funnel so they are ordered with every other event.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::funnel::{EventFunnel, VmEvent};

/// Shared view of the preemption request flag, checked by the interpreter.
#[derive(Debug, Clone, Default)]
pub struct PreemptionSignal(Arc<AtomicBool>);

impl PreemptionSignal {
    /// Returns `true` if the running lightweight thread should yield.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn request(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    /// Clear the flag, returning whether it was set.
    pub(crate) fn clear(&self) -> bool {
        self.0.swap(false, AtomicOrdering::AcqRel)
    }
}

/// Periodic timer driving the preemption signal.
#[derive(Debug)]
pub struct PreemptionTimer {
    period: Duration,
    signal: PreemptionSignal,
    task: Option<JoinHandle<()>>,
}

impl PreemptionTimer {
    /// Create a stopped timer.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            signal: PreemptionSignal::default(),
            task: None,
        }
    }

    /// Returns the signal the interpreter should poll.
    #[must_use]
    pub fn signal(&self) -> PreemptionSignal {
        self.signal.clone()
    }

    /// Start ticking on `reactor`. Starting a running timer does nothing.
    pub fn start(&mut self, reactor: &Handle) {
        if self.task.is_some() {
            return;
        }
        let period = self.period;
        let signal = self.signal.clone();
        self.task = Some(reactor.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                signal.request();
            }
        }));
    }

    /// Begin a new slice: clear any pending request. Returns whether the
    /// previous slice was cut short by the timer.
    pub fn rearm(&self) -> bool {
        self.signal.clear()
    }

    /// Stop ticking and clear the signal.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.signal.clear();
    }

    /// Returns `true` while the timer is ticking.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for PreemptionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Identifier of a scheduled alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmId(u64);

struct AlarmEntry {
    deadline: Instant,
    id: AlarmId,
    wake: VmEvent,
}

impl Eq for AlarmEntry {}

impl PartialEq for AlarmEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Ord for AlarmEntry {
    // Reversed: BinaryHeap is a max-heap, the earliest alarm must be on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for AlarmEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The engine's pending alarms.
#[derive(Default)]
pub struct AlarmQueue {
    heap: BinaryHeap<AlarmEntry>,
    next_id: u64,
}

impl std::fmt::Debug for AlarmQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmQueue")
            .field("pending", &self.heap.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl AlarmQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `wake` to run at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, wake: VmEvent) -> AlarmId {
        let id = AlarmId(self.next_id);
        self.next_id += 1;
        self.heap.push(AlarmEntry { deadline, id, wake });
        id
    }

    /// Cancel a pending alarm. Returns `false` if it already fired or was
    /// never scheduled.
    pub fn cancel(&mut self, id: AlarmId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.id != id);
        self.heap.len() != before
    }

    /// The earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Post every alarm due at `now` into `funnel`, earliest first. Returns
    /// the number of alarms fired.
    pub fn fire_expired(&mut self, now: Instant, funnel: &EventFunnel) -> usize {
        let mut fired = 0;
        while self
            .heap
            .peek()
            .is_some_and(|entry| entry.deadline <= now)
        {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if funnel.post_boxed(entry.wake).is_err() {
                debug!(alarm = ?entry.id, "funnel closed, dropping alarm");
            }
            fired += 1;
        }
        fired
    }

    /// Drop every pending alarm. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.heap.len();
        self.heap.clear();
        count
    }

    /// Number of pending alarms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no alarm is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
