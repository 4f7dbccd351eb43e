//! Delay policy between unsuccessful protocol attempts.
//!
//! A producer that found its slot occupied, or a consumer whose item has not
//! arrived yet, waits before polling again. The wait is a timed one: the
//! region may be shared with other processes, and their progress can only be
//! discovered by polling. Within one process the wait is cut short by a
//! [`Doorbell`] that is rung whenever a cell is filled or released.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every miss.
    Fixed(Duration),
    /// Delay doubles after every miss up to `max`; back to `initial` after progress.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub const BASELINE_DELAY: Duration = Duration::from_millis(10);
    pub const INITIAL_DELAY: Duration = Duration::from_micros(100);
    pub const MAX_DELAY: Duration = Duration::from_millis(10);

    pub fn for_strategy(strategy: crate::SyncStrategy) -> Self {
        match strategy {
            crate::SyncStrategy::Baseline => Backoff::Fixed(Self::BASELINE_DELAY),
            crate::SyncStrategy::Batched => Backoff::Exponential {
                initial: Self::INITIAL_DELAY,
                max: Self::MAX_DELAY,
            },
        }
    }

    pub fn start(self) -> BackoffState {
        BackoffState {
            policy: self,
            current: self.initial(),
        }
    }

    fn initial(self) -> Duration {
        match self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { initial, .. } => initial,
        }
    }
}

/// Running delay of one participant.
#[derive(Debug, Clone, Copy)]
pub struct BackoffState {
    policy: Backoff,
    current: Duration,
}

impl BackoffState {
    #[inline]
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self) {
        if let Backoff::Exponential { max, .. } = self.policy {
            self.current = (self.current * 2).min(max);
        }
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial();
    }

    /// Waits for the current delay (or until `bell` rings past `ticket`),
    /// then grows the delay.
    pub fn wait(&mut self, bell: &Doorbell, ticket: u64) {
        bell.wait(ticket, self.current);
        self.advance();
    }
}

/// In-process wakeup for participants that are backing off.
#[derive(Debug, Default)]
pub struct Doorbell {
    rings: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ring count. Take it before inspecting the queue, then pass it
    /// to `wait` so a ring in between is not lost.
    pub fn ticket(&self) -> u64 {
        *self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ring(&self) {
        let mut rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        *rings = rings.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Returns `true` if the bell rang after `ticket` was taken.
    pub fn wait(&self, ticket: u64, timeout: Duration) -> bool {
        if timeout.is_zero() {
            std::thread::yield_now();
            return self.ticket() != ticket;
        }
        let rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        let (rings, _) = self
            .cv
            .wait_timeout_while(rings, timeout, |r| *r == ticket)
            .unwrap_or_else(PoisonError::into_inner);
        *rings != ticket
    }
}
