//! # Reference Counter
//!
//! A small atomic reservation counter shared by the manager and its chunk
//! stores. The counter starts at 1 (the creating owner's reservation) and
//! moves only through [`reserve`](ReferenceCounter::reserve),
//! [`try_reserve`](ReferenceCounter::try_reserve) and
//! [`release`](ReferenceCounter::release).
//!
//! The zero transition is reported to exactly one caller: the `release` that
//! takes the count from 1 to 0 returns `Ok(true)`, and the owner runs its
//! teardown (unmap, close) in response. Once at zero the counter is dead;
//! further `reserve` calls fail with [`MapError::AfterRelease`] and further
//! `release` calls fail with [`MapError::RefCountUnderflow`]. Both indicate a
//! bug in calling code, not a recoverable condition.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{MapError, MapResult};

/// An atomic two-state reservation counter: alive (count > 0) or dead.
#[derive(Debug)]
pub struct ReferenceCounter {
    count: AtomicU64,
}

impl ReferenceCounter {
    /// Creates a counter holding the creator's single reservation.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(1),
        }
    }

    /// Adds a reservation.
    ///
    /// Fails with [`MapError::AfterRelease`] if the count has already
    /// reached zero; a dead handle can never be revived.
    pub fn reserve(&self) -> MapResult<()> {
        if self.try_reserve() {
            Ok(())
        } else {
            Err(MapError::AfterRelease)
        }
    }

    /// Adds a reservation unless the count is already zero.
    ///
    /// This is the non-blocking liveness test the chunk cache uses to decide
    /// whether a cached store can still be handed out.
    pub fn try_reserve(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Drops a reservation.
    ///
    /// Returns `Ok(true)` for exactly the call that takes the count to zero;
    /// the owner must run its release action (unmap, close) in response.
    /// Fails with [`MapError::RefCountUnderflow`] if the count is already
    /// zero.
    ///
    /// The AcqRel exchange makes the zero transition an acquire of every
    /// prior release-ordered decrement, so teardown happens-after all writes
    /// performed through previously released reservations.
    pub fn release(&self) -> MapResult<bool> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(MapError::RefCountUnderflow);
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current == 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Current reservation count. Advisory: may be stale by the time the
    /// caller looks at it.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for ReferenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let rc = ReferenceCounter::new();
        assert_eq!(rc.count(), 1);
    }

    #[test]
    fn reserve_and_release_balance() {
        let rc = ReferenceCounter::new();
        rc.reserve().unwrap();
        assert_eq!(rc.count(), 2);
        assert!(!rc.release().unwrap());
        assert_eq!(rc.count(), 1);
    }

    #[test]
    fn zero_transition_reported_exactly_once() {
        let rc = ReferenceCounter::new();
        assert!(rc.release().unwrap());
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn release_past_zero_underflows() {
        let rc = ReferenceCounter::new();
        assert!(rc.release().unwrap());
        assert!(matches!(rc.release(), Err(MapError::RefCountUnderflow)));
    }

    #[test]
    fn reserve_after_release_fails() {
        let rc = ReferenceCounter::new();
        assert!(rc.release().unwrap());
        assert!(matches!(rc.reserve(), Err(MapError::AfterRelease)));
    }

    #[test]
    fn try_reserve_refuses_dead_counter() {
        let rc = ReferenceCounter::new();
        assert!(rc.try_reserve());
        assert_eq!(rc.count(), 2);

        assert!(!rc.release().unwrap());
        assert!(rc.release().unwrap());
        assert!(!rc.try_reserve());
    }

    #[test]
    fn concurrent_reserve_release_is_balanced() {
        use std::sync::Arc;
        use std::thread;

        let rc = Arc::new(ReferenceCounter::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let rc = Arc::clone(&rc);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        rc.reserve().unwrap();
                        assert!(!rc.release().unwrap());
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(rc.count(), 1);
    }
}
