//! The consumer side of the queue.
//!
//! Consumers coordinate through `head` alone. Each dequeue claims a sequence
//! number with fetch-and-add, so no two consumers ever wait for the same
//! item, then polls the cell that sequence number maps to:
//!
//! - tag equals the claim: the item is ours; empty the cell and count it.
//! - gap mark at or above the claim: the producer gave this sequence number
//!   up; claim a fresh one right away.
//! - otherwise the producer has not got there yet; back off and look again.
//!
//! A gap mark only ever reaches `seq` once the producer has passed `seq` at
//! that cell, and the claimant of `seq` is the only one who can empty a cell
//! tagged `seq`, so checking the tag first means a gap mark left on a later
//! lap never hides an item that is actually there.

use crate::error::QueueError;
use crate::queue::Shared;
use crate::ring::seq_to_index;
use ffq_events::Sentinel;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One successful dequeue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delivery<T> {
    /// Sequence number this consumer claimed and received.
    pub seq: i64,
    pub index: usize,
    pub item: T,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Dequeues that returned an item, sentinels included.
    pub matched: u64,
    pub sentinels: u64,
    /// Claims abandoned because the producer had skipped them.
    pub reclaims: u64,
    pub timeouts: u64,
}

impl ConsumerStats {
    /// Real items received, not counting end-of-stream markers.
    pub fn items(&self) -> u64 {
        self.matched - self.sentinels
    }
}

pub struct Consumer<T: Copy> {
    shared: Arc<Shared<T>>,
    id: usize,
    capacity: usize,
    /// Claim left over from a dequeue that timed out.
    pending: Option<i64>,
    finished: bool,
    stats: ConsumerStats,
}

impl<T: Copy> Consumer<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, id: usize) -> Self {
        let capacity = shared.region.capacity();
        Self {
            shared,
            id,
            capacity,
            pending: None,
            finished: false,
            stats: ConsumerStats::default(),
        }
    }

    /// Takes the next item addressed to this consumer.
    ///
    /// With a retry ceiling configured, gives up with
    /// [`QueueError::Timeout`] after that many waits on one sequence number.
    /// The claim is kept, and the next call picks it up again.
    pub fn dequeue(&mut self) -> Result<Delivery<T>, QueueError> {
        self.take(None)
    }

    /// [`dequeue`](Self::dequeue) that also gives up with
    /// [`QueueError::Cancelled`] once `cancel` is set. The claim is kept.
    pub fn dequeue_until(&mut self, cancel: &AtomicBool) -> Result<Delivery<T>, QueueError> {
        self.take(Some(cancel))
    }

    fn take(&mut self, cancel: Option<&AtomicBool>) -> Result<Delivery<T>, QueueError> {
        let capacity = if self.shared.options.strategy.caches_layout() {
            self.capacity
        } else {
            self.shared.shared()?.capacity()
        };
        let mut seq = match self.pending.take() {
            Some(seq) => seq,
            None => self.shared.claim()?,
        };
        let mut idx = seq_to_index(seq, capacity);
        let mut backoff = self.shared.options.backoff.start();
        let mut retries = 0u32;

        loop {
            let ticket = self.shared.bell.ticket();
            let view = self.shared.shared()?.view(idx, seq);

            if let Some(item) = view.item {
                {
                    let mut s = self.shared.exclusive()?;
                    s.release(idx);
                    s.flush();
                }
                self.shared.bell.ring();
                self.stats.matched += 1;
                tracing::trace!(consumer = self.id, seq, idx, "dequeued");
                return Ok(Delivery {
                    seq,
                    index: idx,
                    item,
                });
            }

            if view.gap >= seq {
                tracing::trace!(consumer = self.id, seq, idx, gap = view.gap, "claim skipped by producer");
                self.stats.reclaims += 1;
                seq = self.shared.claim()?;
                idx = seq_to_index(seq, capacity);
                backoff.reset();
                retries = 0;
                continue;
            }

            if let Some(max) = self.shared.options.max_retries {
                if retries >= max {
                    self.pending = Some(seq);
                    self.stats.timeouts += 1;
                    tracing::warn!(consumer = self.id, seq, retries, "dequeue timed out");
                    return Err(QueueError::Timeout {
                        consumer: self.id,
                        seq,
                        retries,
                    });
                }
            }
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                self.pending = Some(seq);
                tracing::debug!(consumer = self.id, seq, "dequeue cancelled");
                return Err(QueueError::Cancelled);
            }
            retries += 1;
            tracing::trace!(consumer = self.id, seq, idx, tag = view.tag, retries, "item not there yet");
            backoff.wait(&self.shared.bell, ticket);
        }
    }

    /// Like [`dequeue`](Self::dequeue), but treats the sentinel as end of
    /// stream: returns `Ok(None)` once it arrives and on every call after.
    pub fn recv(&mut self) -> Result<Option<T>, QueueError>
    where
        T: Sentinel,
    {
        self.recv_inner(None)
    }

    /// [`recv`](Self::recv) with the cancellation of
    /// [`dequeue_until`](Self::dequeue_until).
    pub fn recv_until(&mut self, cancel: &AtomicBool) -> Result<Option<T>, QueueError>
    where
        T: Sentinel,
    {
        self.recv_inner(Some(cancel))
    }

    fn recv_inner(&mut self, cancel: Option<&AtomicBool>) -> Result<Option<T>, QueueError>
    where
        T: Sentinel,
    {
        if self.finished {
            return Ok(None);
        }
        let delivery = self.take(cancel)?;
        if delivery.item.is_sentinel() {
            self.finished = true;
            self.stats.sentinels += 1;
            tracing::debug!(consumer = self.id, seq = delivery.seq, "end of stream");
            return Ok(None);
        }
        Ok(Some(delivery.item))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this consumer has received its sentinel.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sequence number held over from a timed-out dequeue.
    pub fn pending(&self) -> Option<i64> {
        self.pending
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use crate::{Backoff, FfQueue, QueueConfig, QueueError, SyncOptions, SyncStrategy};
    use ffq_events::{DataItem, Sentinel};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn opts(strategy: SyncStrategy) -> SyncOptions {
        SyncOptions::new(strategy).with_backoff(Backoff::Fixed(Duration::from_micros(50)))
    }

    #[test]
    fn delivers_in_claim_order_and_counts_completion() {
        for strategy in [SyncStrategy::Baseline, SyncStrategy::Batched] {
            let q = FfQueue::<u32>::anonymous(&QueueConfig::new(4).with_options(opts(strategy)))
                .unwrap();
            let mut p = q.producer().unwrap();
            for v in 1..=3 {
                p.enqueue(v).unwrap();
            }
            let mut c = q.consumer(7);
            for (seq, v) in (1..=3).enumerate() {
                let d = c.dequeue().unwrap();
                assert_eq!((d.seq, d.item), (seq as i64, v));
            }
            assert_eq!(q.completed_count().unwrap(), 3);
            assert_eq!(q.head().unwrap(), 3);
            assert_eq!(c.stats().matched, 3);
        }
    }

    #[test]
    fn gap_mark_sends_consumer_to_a_fresh_claim() {
        let q = FfQueue::<u32>::anonymous(&QueueConfig::new(1).with_options(opts(SyncStrategy::Batched)))
            .unwrap();
        let mut p = q.producer().unwrap();
        let mut slow = q.consumer(0);
        let mut fast = q.consumer(1);

        p.enqueue(10).unwrap(); // seq 0 in the only cell

        // seq 1 finds the cell occupied, leaves a gap mark, and seq 2 lands
        // once `slow` empties the cell.
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                assert_eq!(slow.dequeue().unwrap().item, 10);
            });
            let e = p.enqueue(20).unwrap();
            assert_eq!(e.skipped as i64, e.seq - 1);
        });

        // `fast` first claims seq 1, which was abandoned, and must move on.
        let d = fast.dequeue().unwrap();
        assert_eq!(d.item, 20);
        assert!(d.seq >= 2);
        assert!(fast.stats().reclaims >= 1);
    }

    #[test]
    fn bounded_retries_time_out_and_keep_the_claim() {
        let o = opts(SyncStrategy::Batched).with_max_retries(Some(5));
        let q = FfQueue::<u32>::anonymous(&QueueConfig::new(2).with_options(o)).unwrap();
        let mut c = q.consumer(3);

        let err = c.dequeue().unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            QueueError::Timeout {
                consumer: 3,
                seq: 0,
                retries: 5
            }
        ));
        assert_eq!(c.pending(), Some(0));

        // Retrying does not burn another sequence number.
        q.producer().unwrap().enqueue(5).unwrap();
        let d = c.dequeue().unwrap();
        assert_eq!((d.seq, d.item), (0, 5));
        assert_eq!(q.head().unwrap(), 1);
        assert_eq!(c.stats().timeouts, 1);
    }

    #[test]
    fn cancel_ends_an_unbounded_wait_and_keeps_the_claim() {
        let o = opts(SyncStrategy::Baseline).with_max_retries(None);
        let q = FfQueue::<DataItem>::anonymous(&QueueConfig::new(2).with_options(o)).unwrap();
        let cancel = AtomicBool::new(false);
        let mut c = q.consumer(0);

        let began = Instant::now();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                cancel.store(true, Ordering::Release);
            });
            assert!(matches!(c.recv_until(&cancel), Err(QueueError::Cancelled)));
        });
        assert!(began.elapsed() < Duration::from_secs(5));
        assert!(!QueueError::Cancelled.is_recoverable());
        assert_eq!(c.pending(), Some(0));

        cancel.store(false, Ordering::Release);
        q.producer().unwrap().enqueue(DataItem::new(9, 0.0, 0, "t")).unwrap();
        let d = c.dequeue_until(&cancel).unwrap();
        assert_eq!((d.seq, d.item.id), (0, 9));
    }

    #[test]
    fn recv_stops_at_sentinel() {
        let q = FfQueue::<DataItem>::anonymous(&QueueConfig::new(4)).unwrap();
        let mut p = q.producer().unwrap();
        p.enqueue(DataItem::new(1, 1.0, 0, "t")).unwrap();
        p.close(1).unwrap();

        let mut c = q.consumer(0);
        assert_eq!(c.recv().unwrap().map(|d| d.id), Some(1));
        assert_eq!(c.recv().unwrap(), None);
        assert!(c.is_finished());
        assert_eq!(c.recv().unwrap(), None);

        let stats = c.stats();
        assert_eq!((stats.matched, stats.sentinels, stats.items()), (2, 1, 1));
        assert_eq!(q.completed_count().unwrap(), 2);
        assert!(!DataItem::new(2, 0.0, 0, "t").is_sentinel());
    }
}
