//! FIFO admission tickets
//!
//! Every caller of [`Bucket::transaction`](crate::bucket::Bucket::transaction)
//! draws a ticket before it may compete for the bucket. Only the oldest live
//! ticket is allowed to proceed, so concurrent callers for the same bucket
//! are served in arrival order.
//!
//! A [`Ticket`] removes itself from the queue when dropped, whether the
//! transaction finished or was cancelled halfway through waiting, and wakes
//! the remaining waiters so the next in line is never left hanging.

use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{futures::Notified, Notify};

/// Per-bucket queue of live ticket numbers.
#[derive(Debug, Default)]
pub struct TicketQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    next: u64,
    live: BTreeSet<u64>,
}

impl TicketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws the next ticket and places it at the back of the queue.
    pub fn draw(&self) -> Ticket<'_> {
        let mut state = self.state();
        let number = state.next;
        state.next += 1;
        state.live.insert(number);
        Ticket {
            number,
            queue: self,
        }
    }

    /// Number of tickets currently waiting or being served.
    pub fn len(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().live.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Only single inserts/removes happen under the lock, so a poisoned
        // lock still guards a consistent value.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A place in a [`TicketQueue`]. Leaves the queue on drop.
#[derive(Debug)]
pub struct Ticket<'a> {
    number: u64,
    queue: &'a TicketQueue,
}

impl<'a> Ticket<'a> {
    /// The ticket's sequence number; lower numbers arrived earlier.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Whether this is the oldest live ticket.
    pub fn is_head(&self) -> bool {
        self.queue.state().live.first() == Some(&self.number)
    }

    /// Resolves on the next change to the queue.
    ///
    /// Call [`Notified::enable`] (or poll once) before checking
    /// [`is_head`](Self::is_head) so a change in between is not missed.
    pub fn changed(&self) -> Notified<'a> {
        self.queue.changed.notified()
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.queue.state().live.remove(&self.number);
        self.queue.changed.notify_waiters();
    }
}
