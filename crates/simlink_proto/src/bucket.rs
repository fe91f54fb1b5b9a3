//! See [`TokenBucket`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

/// Rate limiter accumulating byte tokens at a drip rate, up to a burst cap,
/// optionally chained to a parent bucket.
///
/// A charge succeeds only if every bucket on the path to the root can supply
/// the requested tokens; on any refusal no level is modified. This lets one
/// scene-wide bucket cap a whole server while each circuit and each traffic
/// category keep their own policy underneath it.
///
/// All state lives in atomics: the drip is folded in with a compare-and-swap
/// on the last-drip timestamp, and charges/refunds are compare-and-swap
/// loops on the level. No lock is held while walking the hierarchy. Time is
/// supplied by the caller so the arithmetic stays testable.
///
/// Buckets start empty and fill at the drip rate, so a fresh bucket admits
/// traffic only as fast as its sustained rate allows. A `max_burst` of zero
/// disables the bucket: charges always succeed locally (the parent, if any,
/// is still consulted).
#[derive(Debug)]
pub struct TokenBucket {
    parent: Option<Arc<TokenBucket>>,
    /// Bytes added per second.
    drip_rate: AtomicU64,
    /// Cap on `level`, in bytes.
    max_burst: AtomicU64,
    /// Tokens currently available.
    level: AtomicU64,
    /// Nanoseconds since `epoch` of the last drip.
    last_drip: AtomicU64,
    epoch: Instant,
}

impl TokenBucket {
    /// Creates a root bucket, starting empty.
    #[must_use]
    pub fn new(drip_rate: u64, max_burst: u64, now: Instant) -> Self {
        Self {
            parent: None,
            drip_rate: AtomicU64::new(drip_rate),
            max_burst: AtomicU64::new(max_burst),
            level: AtomicU64::new(0),
            last_drip: AtomicU64::new(0),
            epoch: now,
        }
    }

    /// Creates a bucket whose charges must also clear `parent`.
    #[must_use]
    pub fn with_parent(drip_rate: u64, max_burst: u64, now: Instant, parent: Arc<TokenBucket>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(drip_rate, max_burst, now)
        }
    }

    /// Current token level.
    #[must_use]
    pub fn level(&self) -> u64 {
        self.level.load(Ordering::Relaxed)
    }

    /// Current drip rate in bytes per second.
    #[must_use]
    pub fn drip_rate(&self) -> u64 {
        self.drip_rate.load(Ordering::Relaxed)
    }

    /// Current burst cap in bytes.
    #[must_use]
    pub fn max_burst(&self) -> u64 {
        self.max_burst.load(Ordering::Relaxed)
    }

    /// Sets the drip rate; effective from the next drip.
    pub fn set_drip_rate(&self, bytes_per_sec: u64) {
        self.drip_rate.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Sets the burst cap; an over-full level is trimmed at the next drip.
    pub fn set_max_burst(&self, bytes: u64) {
        self.max_burst.store(bytes, Ordering::Relaxed);
    }

    /// Attempts to remove `n` tokens from this bucket and every ancestor.
    ///
    /// The commit is test-then-undo: tokens are reserved here first, then
    /// the parent chain is charged, and the reservation is refunded if any
    /// ancestor refuses. Concurrent callers may each see the other's
    /// reservation, but a refused charge never leaves any bucket drained.
    pub fn remove(&self, n: u64, now: Instant) -> bool {
        self.drip(now);
        if !self.reserve(n) {
            return false;
        }
        if let Some(parent) = &self.parent {
            if !parent.remove(n, now) {
                self.refund(n);
                return false;
            }
        }
        true
    }

    /// Folds elapsed wall-clock into the level.
    fn drip(&self, now: Instant) {
        let now_nanos = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        let mut last = self.last_drip.load(Ordering::Acquire);
        loop {
            if now_nanos <= last {
                return;
            }
            match self.last_drip.compare_exchange_weak(
                last,
                now_nanos,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => last = observed,
            }
        }
        let elapsed = now_nanos - last;
        let rate = self.drip_rate.load(Ordering::Relaxed);
        let burst = self.max_burst.load(Ordering::Relaxed);
        let added = (u128::from(rate) * u128::from(elapsed) / 1_000_000_000) as u64;
        let mut level = self.level.load(Ordering::Relaxed);
        loop {
            let next = level.saturating_add(added).min(burst);
            match self.level.compare_exchange_weak(
                level,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => level = observed,
            }
        }
    }

    fn reserve(&self, n: u64) -> bool {
        if self.max_burst.load(Ordering::Relaxed) == 0 {
            return true;
        }
        let mut level = self.level.load(Ordering::Relaxed);
        loop {
            let Some(next) = level.checked_sub(n) else {
                return false;
            };
            match self.level.compare_exchange_weak(
                level,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => level = observed,
            }
        }
    }

    fn refund(&self, n: u64) {
        if self.max_burst.load(Ordering::Relaxed) == 0 {
            return;
        }
        let mut level = self.level.load(Ordering::Relaxed);
        loop {
            let next = level
                .saturating_add(n)
                .min(self.max_burst.load(Ordering::Relaxed));
            match self.level.compare_exchange_weak(
                level,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => level = observed,
            }
        }
    }
}
