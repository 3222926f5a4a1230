// src/core/storage/mvcc.rs

//! The MVCC timestamp source used to order writes across leaders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the per-millisecond sequence counter.
const MVCC_SEQ_BITS: u64 = 16;

/// A strictly monotonic clock producing MVCC timestamps of the form
/// `(unix_millis << MVCC_SEQ_BITS) | sequence`.
///
/// Monotonicity is guaranteed even across wall-clock regressions: a draw that
/// would go backwards instead increments the previous value.
#[derive(Debug)]
pub struct MvccClock {
    last: AtomicU64,
}

impl MvccClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Draws the next timestamp.
    pub fn next(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            << MVCC_SEQ_BITS;

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self.last.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Advances the clock past a timestamp observed from a peer, so local
    /// writes issued after applying a remote command order after it.
    pub fn witness(&self, observed: u64) {
        self.last.fetch_max(observed, Ordering::AcqRel);
    }
}

impl Default for MvccClock {
    fn default() -> Self {
        Self::new()
    }
}
