//! The producer side of the queue.
//!
//! The producer never waits for a particular slot to drain. If the slot for
//! its next sequence number is still occupied it leaves a gap mark there,
//! gives that sequence number up, and moves on to the next one. At most one
//! attempt per lap is wasted this way, and the item being enqueued is never
//! lost: only the sequence number is skipped.

use crate::backoff::BackoffState;
use crate::error::QueueError;
use crate::layout::EMPTY;
use crate::queue::Shared;
use crate::ring::seq_to_index;
use ffq_events::Sentinel;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where an item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Sequence number the item was deposited under.
    pub seq: i64,
    /// Cell holding it.
    pub index: usize,
    /// Sequence numbers abandoned before this one found a free cell.
    pub skipped: u32,
}

/// The single writer of a queue. Dropping it releases the producer role.
pub struct Producer<T: Copy> {
    shared: Arc<Shared<T>>,
    /// Local copy of the shared `tail`; only this producer ever advances it.
    tail: i64,
    backoff: BackoffState,
    gaps: u64,
}

impl<T: Copy> Producer<T> {
    pub(crate) fn attach(shared: Arc<Shared<T>>) -> Result<Self, QueueError> {
        shared.region.attach_producer()?;
        let tail = match shared.shared() {
            Ok(s) => s.status().tail,
            Err(e) => {
                shared.region.detach_producer();
                return Err(e);
            }
        };
        tracing::debug!(tail, "producer attached");
        let backoff = shared.options.backoff.start();
        Ok(Self {
            shared,
            tail,
            backoff,
            gaps: 0,
        })
    }

    /// Deposits `item` under the next sequence number whose cell is free.
    ///
    /// Returns only once the item is in the queue, or when the region lock
    /// cannot be taken.
    pub fn enqueue(&mut self, item: T) -> Result<Enqueued, QueueError> {
        self.put(item, None)
    }

    /// [`enqueue`](Self::enqueue) that gives up with
    /// [`QueueError::Cancelled`] once `cancel` is set, so a producer facing a
    /// full queue with no live consumers can stop.
    pub fn enqueue_until(&mut self, item: T, cancel: &AtomicBool) -> Result<Enqueued, QueueError> {
        self.put(item, Some(cancel))
    }

    fn put(&mut self, item: T, cancel: Option<&AtomicBool>) -> Result<Enqueued, QueueError> {
        let capacity = self.shared.region.capacity();
        let mut skipped = 0u32;
        loop {
            let t = self.tail;
            let idx = seq_to_index(t, capacity);
            let ticket = self.shared.bell.ticket();

            let deposited = {
                let mut s = self.shared.exclusive()?;
                let deposited = if s.tag(idx) == EMPTY {
                    s.deposit(idx, t, item);
                    true
                } else {
                    s.mark_gap(idx, t);
                    false
                };
                s.set_tail(t + 1);
                s.flush();
                deposited
            };
            self.tail = t + 1;

            if deposited {
                self.backoff.reset();
                self.shared.bell.ring();
                tracing::trace!(seq = t, idx, skipped, "deposited");
                return Ok(Enqueued {
                    seq: t,
                    index: idx,
                    skipped,
                });
            }

            skipped += 1;
            self.gaps += 1;
            tracing::trace!(seq = t, idx, "slot occupied, left gap mark");
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                tracing::debug!(tail = self.tail, skipped, "enqueue cancelled");
                return Err(QueueError::Cancelled);
            }
            self.backoff.wait(&self.shared.bell, ticket);
        }
    }

    /// Announces end of stream: one sentinel per consumer.
    pub fn close(&mut self, consumers: usize) -> Result<(), QueueError>
    where
        T: Sentinel,
    {
        self.close_inner(consumers, None)
    }

    /// [`close`](Self::close) with the cancellation of
    /// [`enqueue_until`](Self::enqueue_until).
    pub fn close_until(&mut self, consumers: usize, cancel: &AtomicBool) -> Result<(), QueueError>
    where
        T: Sentinel,
    {
        self.close_inner(consumers, Some(cancel))
    }

    fn close_inner(&mut self, consumers: usize, cancel: Option<&AtomicBool>) -> Result<(), QueueError>
    where
        T: Sentinel,
    {
        if consumers == 0 {
            return Err(QueueError::NoConsumers);
        }
        for _ in 0..consumers {
            self.put(T::sentinel(), cancel)?;
        }
        tracing::debug!(consumers, tail = self.tail, "end of stream enqueued");
        Ok(())
    }

    /// Next sequence number this producer will try.
    pub fn tail(&self) -> i64 {
        self.tail
    }

    /// Gap marks left by this producer handle.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

impl<T: Copy> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.region.detach_producer();
        tracing::debug!(tail = self.tail, gaps = self.gaps, "producer detached");
    }
}
