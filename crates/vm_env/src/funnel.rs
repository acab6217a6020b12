//! Cross-thread event funnel.
//!
//! The funnel is the only way a thread other than the engine's own can
//! affect the engine's store. Producers [`post`](EventFunnel::post) closures
//! from any thread; the engine thread applies them one at a time, in enqueue
//! order, between scheduling slices.
//!
//! Every entry gets a sequence number under the same lock that pushes it onto
//! the channel, so sequence order and delivery order always agree.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::trace;

use crate::context::VmContext;
use crate::error::VmError;

/// A deferred closure applied on the engine thread.
pub type VmEvent = Box<dyn FnOnce(&mut VmContext) + Send + 'static>;

struct FunnelEntry {
    seq: u64,
    event: VmEvent,
}

struct FunnelState {
    /// `None` once the funnel is closed.
    sender: Option<Sender<FunnelEntry>>,
    next_seq: u64,
}

/// The producer side of an engine's event funnel. Cheap to clone and safe to
/// use from any thread.
#[derive(Clone)]
pub struct EventFunnel {
    state: Arc<Mutex<FunnelState>>,
}

impl std::fmt::Debug for EventFunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventFunnel")
            .field("open", &state.sender.is_some())
            .field("next_seq", &state.next_seq)
            .finish()
    }
}

/// The consumer side of an engine's event funnel, owned by the engine
/// thread.
pub struct FunnelReceiver {
    receiver: Receiver<FunnelEntry>,
    last_seq: Option<u64>,
    applied: u64,
}

/// Create a connected funnel pair.
#[must_use]
pub fn event_funnel() -> (EventFunnel, FunnelReceiver) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let funnel = EventFunnel {
        state: Arc::new(Mutex::new(FunnelState {
            sender: Some(sender),
            next_seq: 0,
        })),
    };
    let inbox = FunnelReceiver {
        receiver,
        last_seq: None,
        applied: 0,
    };
    (funnel, inbox)
}

impl EventFunnel {
    /// Enqueue a closure for the engine thread and wake the engine if it is
    /// waiting. Returns the entry's sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::FunnelClosed`] once the engine has stopped
    /// accepting events. The closure is dropped without running.
    pub fn post<F>(&self, event: F) -> Result<u64, VmError>
    where
        F: FnOnce(&mut VmContext) + Send + 'static,
    {
        self.post_boxed(Box::new(event))
    }

    /// Enqueue an already boxed closure. See [`EventFunnel::post`].
    ///
    /// # Errors
    ///
    /// Returns [`VmError::FunnelClosed`] once the funnel is closed.
    pub fn post_boxed(&self, event: VmEvent) -> Result<u64, VmError> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        let sender = state.sender.as_ref().ok_or(VmError::FunnelClosed)?;
        sender
            .send(FunnelEntry { seq, event })
            .map_err(|_| VmError::FunnelClosed)?;
        state.next_seq += 1;
        Ok(seq)
    }

    /// Post a no-op, only to wake the engine.
    pub fn wake(&self) {
        let _ = self.post(|_| {});
    }

    /// Stop accepting events. Entries already posted stay queued.
    pub fn close(&self) {
        self.state.lock().sender = None;
    }

    /// Returns `true` while events are accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().sender.is_some()
    }
}

impl FunnelReceiver {
    fn apply(&mut self, entry: FunnelEntry, ctx: &mut VmContext) {
        debug_assert!(
            self.last_seq.is_none_or(|last| entry.seq > last),
            "funnel entries out of order"
        );
        trace!(engine_id = %ctx.id(), seq = entry.seq, "applying funnel entry");
        self.last_seq = Some(entry.seq);
        self.applied += 1;
        (entry.event)(ctx);
    }

    /// Apply every entry currently queued, in order. Returns the number of
    /// entries applied.
    pub fn drain(&mut self, ctx: &mut VmContext) -> usize {
        let mut count = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(entry) => {
                    self.apply(entry, ctx);
                    count += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return count,
            }
        }
    }

    /// Block until an entry arrives or `deadline` passes (forever when
    /// `None`), then drain. Returns the number of entries applied.
    pub fn wait(&mut self, ctx: &mut VmContext, deadline: Option<Instant>) -> usize {
        let first = match deadline {
            Some(deadline) => match self.receiver.recv_deadline(deadline) {
                Ok(entry) => Some(entry),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => self.receiver.recv().ok(),
        };
        match first {
            Some(entry) => {
                self.apply(entry, ctx);
                1 + self.drain(ctx)
            }
            None => 0,
        }
    }

    /// Returns `true` if no entry is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Total number of entries applied so far.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_post_assigns_increasing_sequence() {
        let (funnel, _inbox) = event_funnel();
        assert_eq!(funnel.post(|_| {}).unwrap(), 0);
        assert_eq!(funnel.post(|_| {}).unwrap(), 1);
        assert_eq!(funnel.clone().post(|_| {}).unwrap(), 2);
    }

    #[test]
    fn test_post_after_close_fails() {
        let (funnel, inbox) = event_funnel();
        funnel.post(|_| {}).unwrap();
        funnel.close();
        assert!(!funnel.is_open());
        assert!(matches!(funnel.post(|_| {}), Err(VmError::FunnelClosed)));
        // The entry posted before closing is still queued.
        assert!(!inbox.is_empty());
    }

    #[test]
    fn test_post_after_receiver_dropped_fails() {
        let (funnel, inbox) = event_funnel();
        drop(inbox);
        assert!(matches!(funnel.post(|_| {}), Err(VmError::FunnelClosed)));
    }

    #[test]
    fn test_cross_thread_posts_keep_sequence_order() {
        let (funnel, inbox) = event_funnel();
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let funnel = funnel.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        funnel.post(|_| {}).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let seqs: Vec<u64> = inbox.receiver.try_iter().map(|entry| entry.seq).collect();
        assert_eq!(seqs, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocked_receiver_wakes_on_post() {
        let (funnel, inbox) = event_funnel();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            funnel.wake();
        });
        let entry = inbox
            .receiver
            .recv_deadline(Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert_eq!(entry.seq, 0);
        producer.join().unwrap();
    }
}
