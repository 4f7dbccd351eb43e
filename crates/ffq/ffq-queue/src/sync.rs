//! Critical sections over the whole queue region.
//!
//! The region carries a single reader/writer lock word in its header, so one
//! lock guards every field: an exclusive section on one cell also blocks
//! readers of unrelated cells and of the cursors. Because the word lives in
//! the mapping itself, the same lock works for threads and for processes that
//! mapped the same file.
//!
//! # Lock word
//!
//! ```text
//!  bit 63        bit 62              bits 0..62
//! ┌────────┬────────────────┬─────────────────────┐
//! │ WRITER │ WRITER_WAITING │ reader count        │
//! └────────┴────────────────┴─────────────────────┘
//! ```
//!
//! A waiting writer sets `WRITER_WAITING`, which stops new readers from
//! entering, and takes the lock once the reader count drains to zero.
//!
//! # Flush
//!
//! Writes made inside an exclusive section are followed by an explicit
//! [`flush`] before the section is released. With [`SyncStrategy::Baseline`]
//! every write is flushed on its own; with [`SyncStrategy::Batched`] the
//! section's writes are flushed once, on `flush()` or at the latest on drop.
//!
//! [`SyncStrategy::Baseline`]: crate::SyncStrategy::Baseline
//! [`SyncStrategy::Batched`]: crate::SyncStrategy::Batched

use crate::error::QueueError;
use crate::layout::{EMPTY, QueueStatus};
use crate::region::Region;
use crossbeam_utils::Backoff as Spin;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::{Duration, Instant};

const WRITER: u64 = 1 << 63;
const WRITER_WAITING: u64 = 1 << 62;
const READERS: u64 = WRITER_WAITING - 1;

/// Makes every write issued so far visible to all other participants.
#[inline(always)]
pub(crate) fn flush() {
    fence(Ordering::SeqCst);
}

fn acquire_exclusive(word: &AtomicU64, timeout: Duration) -> Result<(), QueueError> {
    let spin = Spin::new();
    let mut deadline = None;
    loop {
        let s = word.load(Ordering::Relaxed);
        if s & (WRITER | READERS) == 0 {
            if word
                .compare_exchange_weak(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        } else if s & WRITER_WAITING == 0 {
            word.fetch_or(WRITER_WAITING, Ordering::Relaxed);
        }
        if let Err(e) = wait_for_lock(&spin, &mut deadline, timeout) {
            // Writers still waiting raise the bit again on their next pass.
            word.fetch_and(!WRITER_WAITING, Ordering::Relaxed);
            return Err(e);
        }
    }
}

fn acquire_shared(word: &AtomicU64, timeout: Duration) -> Result<(), QueueError> {
    let spin = Spin::new();
    let mut deadline = None;
    loop {
        let s = word.load(Ordering::Relaxed);
        if s & (WRITER | WRITER_WAITING) == 0
            && s & READERS < READERS
            && word
                .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return Ok(());
        }
        wait_for_lock(&spin, &mut deadline, timeout)?;
    }
}

/// Spins, then yields; the clock is only consulted once spinning is over.
#[inline]
fn wait_for_lock(
    spin: &Spin,
    deadline: &mut Option<Instant>,
    timeout: Duration,
) -> Result<(), QueueError> {
    if spin.is_completed() {
        let now = Instant::now();
        let deadline = *deadline.get_or_insert(now + timeout);
        if now >= deadline {
            tracing::error!(?timeout, "region lock unavailable");
            return Err(QueueError::LockUnavailable(timeout));
        }
    }
    spin.snooze();
    Ok(())
}

/// What a consumer learns from one look at its cell.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CellView<T> {
    pub tag: i64,
    pub gap: i64,
    /// The payload, present only when `tag` equals the sequence number asked for.
    pub item: Option<T>,
}

/// Concurrent read access to the region.
pub(crate) struct SharedSection<'a, T: Copy> {
    region: &'a Region<T>,
}

impl<'a, T: Copy> SharedSection<'a, T> {
    pub(crate) fn enter(region: &'a Region<T>, timeout: Duration) -> Result<Self, QueueError> {
        acquire_shared(&region.header().lock, timeout)?;
        Ok(Self { region })
    }

    /// Reads tag, gap mark and, if it is the one asked for, the payload of cell `idx`.
    pub(crate) fn view(&self, idx: usize, seq: i64) -> CellView<T> {
        let cell = self.region.cell(idx);
        let tag = cell.sequence_tag.load(Ordering::Relaxed);
        let gap = cell.gap_mark.load(Ordering::Relaxed);
        let item = if tag == seq && tag != EMPTY {
            // SAFETY: a non-empty tag is only ever published after the payload
            // it advertises, and the producer does not touch an occupied cell.
            Some(unsafe { (*cell.payload.get()).assume_init() })
        } else {
            None
        };
        CellView { tag, gap, item }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.region.header().capacity as usize
    }

    pub(crate) fn status(&self) -> QueueStatus {
        let h = self.region.header();
        QueueStatus {
            head: h.head.load(Ordering::Relaxed),
            tail: h.tail.load(Ordering::Relaxed),
            completed: h.completed.load(Ordering::Relaxed),
            gaps: h.gaps.load(Ordering::Relaxed),
        }
    }
}

impl<T: Copy> Drop for SharedSection<'_, T> {
    fn drop(&mut self) {
        self.region.header().lock.fetch_sub(1, Ordering::Release);
    }
}

/// Sole access to the region.
pub(crate) struct ExclusiveSection<'a, T: Copy> {
    region: &'a Region<T>,
    flush_each_write: bool,
    dirty: bool,
}

impl<'a, T: Copy> ExclusiveSection<'a, T> {
    pub(crate) fn enter(
        region: &'a Region<T>,
        timeout: Duration,
        flush_each_write: bool,
    ) -> Result<Self, QueueError> {
        acquire_exclusive(&region.header().lock, timeout)?;
        Ok(Self {
            region,
            flush_each_write,
            dirty: false,
        })
    }

    #[inline(always)]
    fn wrote(&mut self) {
        if self.flush_each_write {
            flush();
        } else {
            self.dirty = true;
        }
    }

    pub(crate) fn flush(&mut self) {
        flush();
        self.dirty = false;
    }

    pub(crate) fn tag(&self, idx: usize) -> i64 {
        self.region.cell(idx).sequence_tag.load(Ordering::Relaxed)
    }

    /// Writes the payload, makes it visible, and only then advertises it
    /// under `seq`. The payload flush happens regardless of strategy.
    pub(crate) fn deposit(&mut self, idx: usize, seq: i64, item: T) {
        let cell = self.region.cell(idx);
        debug_assert_eq!(cell.sequence_tag.load(Ordering::Relaxed), EMPTY);
        // SAFETY: we hold the exclusive section and the cell is empty, so no
        // one else reads or writes this payload.
        unsafe { cell.payload.get().write(MaybeUninit::new(item)) };
        flush();
        cell.sequence_tag.store(seq, Ordering::Relaxed);
        self.wrote();
    }

    /// Records that `seq` was abandoned at cell `idx`.
    pub(crate) fn mark_gap(&mut self, idx: usize, seq: i64) {
        let previous = self.region.cell(idx).gap_mark.fetch_max(seq, Ordering::Relaxed);
        debug_assert!(previous <= seq, "gap marks only grow");
        self.region.header().gaps.fetch_add(1, Ordering::Relaxed);
        self.wrote();
    }

    pub(crate) fn set_tail(&mut self, tail: i64) {
        self.region.header().tail.store(tail, Ordering::Relaxed);
        self.wrote();
    }

    /// Empties cell `idx` and counts one completed dequeue.
    pub(crate) fn release(&mut self, idx: usize) {
        self.region
            .cell(idx)
            .sequence_tag
            .store(EMPTY, Ordering::Relaxed);
        self.wrote();
        self.region.header().completed.fetch_add(1, Ordering::Relaxed);
        self.wrote();
    }

    /// Returns the current head and advances it by one.
    pub(crate) fn fetch_add_head(&mut self) -> i64 {
        let r = self.region.header().head.fetch_add(1, Ordering::Relaxed);
        self.wrote();
        r
    }
}

impl<T: Copy> Drop for ExclusiveSection<'_, T> {
    fn drop(&mut self) {
        if self.dirty {
            flush();
        }
        self.region
            .header()
            .lock
            .fetch_and(!WRITER, Ordering::Release);
    }
}
