//! Queue configuration and sequence-to-slot arithmetic.

use crate::backoff::Backoff;
use crate::error::QueueError;
use std::time::Duration;

/// How the protocol drives the region lock.
///
/// Both strategies run the same state machine; they differ in how often they
/// flush and whether derived layout values are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// Flush after every individual write and re-read the capacity from the
    /// header on every dequeue.
    Baseline,
    /// One flush per critical section, capacity cached at attach time.
    #[default]
    Batched,
}

impl SyncStrategy {
    #[inline(always)]
    pub fn flush_each_write(self) -> bool {
        matches!(self, SyncStrategy::Baseline)
    }

    #[inline(always)]
    pub fn caches_layout(self) -> bool {
        matches!(self, SyncStrategy::Batched)
    }

    /// Retry ceiling used when none is configured.
    pub fn default_max_retries(self) -> Option<u32> {
        match self {
            SyncStrategy::Baseline => None,
            SyncStrategy::Batched => Some(1000),
        }
    }
}

/// Per-participant knobs. Every handle onto a region carries its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub strategy: SyncStrategy,
    /// Delay policy between unsuccessful attempts.
    pub backoff: Backoff,
    /// Dequeue gives up after this many waits on one sequence number.
    /// `None` waits forever.
    pub max_retries: Option<u32>,
    /// Longest a participant waits for the region lock before the queue is
    /// declared unusable.
    pub lock_timeout: Duration,
}

impl SyncOptions {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(strategy: SyncStrategy) -> Self {
        Self {
            strategy,
            backoff: Backoff::for_strategy(strategy),
            max_retries: strategy.default_max_retries(),
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(SyncStrategy::default())
    }
}

/// What the initializer needs to lay out a new region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of cells. Any value >= 1.
    pub capacity: usize,
    pub options: SyncOptions,
}

impl QueueConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.capacity < 1 {
            return Err(QueueError::InvalidCapacity(self.capacity));
        }
        Ok(())
    }
}

/// Maps a sequence number onto its cell.
///
/// Capacities need not be powers of two, so this is a plain modulo.
///
/// ```
/// use ffq_queue::seq_to_index;
/// assert_eq!(seq_to_index(0, 4), 0);
/// assert_eq!(seq_to_index(5, 4), 1);
/// assert_eq!(seq_to_index(7, 3), 1);
/// ```
#[inline(always)]
pub fn seq_to_index(seq: i64, capacity: usize) -> usize {
    debug_assert!(seq >= 0, "sequence numbers are never negative");
    (seq as u64 % capacity as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            QueueConfig::new(0).validate(),
            Err(QueueError::InvalidCapacity(0))
        ));
        assert!(QueueConfig::new(1).validate().is_ok());
    }

    #[test]
    fn strategies_pick_their_own_defaults() {
        let base = SyncOptions::new(SyncStrategy::Baseline);
        assert_eq!(base.max_retries, None);
        assert!(matches!(base.backoff, Backoff::Fixed(_)));

        let batched = SyncOptions::new(SyncStrategy::Batched);
        assert_eq!(batched.max_retries, Some(1000));
        assert!(matches!(batched.backoff, Backoff::Exponential { .. }));
    }

    #[test]
    fn index_wraps_every_capacity_sequence_numbers() {
        for cap in 1..=5usize {
            for seq in 0..20i64 {
                assert_eq!(seq_to_index(seq, cap), seq as usize % cap);
            }
        }
    }
}
