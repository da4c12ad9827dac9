//! One-shot promise backing sync-over-async requests.

use std::time::{Duration, Instant};

use courier_wire::Payload;
use parking_lot::{Condvar, Mutex};

/// How a sync request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    /// The provider answered (possibly with no payload).
    Response(Option<Payload>),
    /// The waiter was unblocked because the service became unavailable or
    /// the requester is going away.
    Aborted,
}

/// One-shot reply slot. The first `complete` wins; the waiter blocks up to a
/// deadline. No requester table lock is ever held across the wait.
pub(crate) struct SyncReply {
    slot: Mutex<Option<SyncOutcome>>,
    done: Condvar,
}

impl SyncReply {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Fill the slot and wake the waiter. Later completions are ignored.
    pub(crate) fn complete(&self, outcome: SyncOutcome) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            drop(slot);
            self.done.notify_all();
        }
    }

    /// Wait for completion. `None` means the deadline passed first.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<SyncOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return Some(outcome);
            }
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}
