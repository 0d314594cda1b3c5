//! Atomic helpers shared by the store, the balancer and the union-find
//! structures.
//!
//! Every read-modify-write on a shared word goes through [`update`], a
//! compare-and-swap retry loop with exponential back-off. Callers describe the
//! transition as a closure returning the new value, or `None` to abandon the
//! update without writing.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

pub use crossbeam::utils::CachePadded;

/// Assumed cache line width in bytes
pub const CACHE_LINE_SIZE: usize = 64;

/// Words that support a compare-and-swap retry loop
pub trait AtomicWord {
    type Value: Copy + Eq;

    fn load_word(&self, order: Ordering) -> Self::Value;

    fn cas_weak(
        &self,
        current: Self::Value,
        new: Self::Value,
    ) -> std::result::Result<Self::Value, Self::Value>;

    fn cas_strong(
        &self,
        current: Self::Value,
        new: Self::Value,
    ) -> std::result::Result<Self::Value, Self::Value>;
}

macro_rules! atomic_word {
    ($atomic:ty, $value:ty) => {
        impl AtomicWord for $atomic {
            type Value = $value;

            #[inline]
            fn load_word(&self, order: Ordering) -> $value {
                self.load(order)
            }

            #[inline]
            fn cas_weak(&self, current: $value, new: $value) -> std::result::Result<$value, $value> {
                self.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            }

            #[inline]
            fn cas_strong(&self, current: $value, new: $value) -> std::result::Result<$value, $value> {
                self.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            }
        }
    };
}

atomic_word!(AtomicU8, u8);
atomic_word!(AtomicU32, u32);
atomic_word!(AtomicU64, u64);
atomic_word!(AtomicUsize, usize);

/// Outcome of an [`update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update<T> {
    /// The word moved from `previous` to `new`
    Applied { previous: T, new: T },
    /// The closure declined to write; `current` is the value it saw
    Declined { current: T },
}

impl<T: Copy> Update<T> {
    pub fn applied(&self) -> bool {
        matches!(self, Update::Applied { .. })
    }

    /// Value of the word before the call took effect
    pub fn previous(&self) -> T {
        match *self {
            Update::Applied { previous, .. } => previous,
            Update::Declined { current } => current,
        }
    }
}

/// Atomically apply `f` to `word`, retrying on contention.
///
/// `f` may be called several times and must be free of side effects.
#[inline]
pub fn update<A, F>(word: &A, mut f: F) -> Update<A::Value>
where
    A: AtomicWord,
    F: FnMut(A::Value) -> Option<A::Value>,
{
    let backoff = Backoff::new();
    let mut current = word.load_word(Ordering::Acquire);
    loop {
        let new = match f(current) {
            Some(new) => new,
            None => return Update::Declined { current },
        };
        match word.cas_weak(current, new) {
            Ok(previous) => return Update::Applied { previous, new },
            Err(actual) => {
                current = actual;
                backoff.spin();
            }
        }
    }
}

/// Single strong compare-and-swap; `true` when this call installed `new`
#[inline]
pub fn cas<A: AtomicWord>(word: &A, current: A::Value, new: A::Value) -> bool {
    word.cas_strong(current, new).is_ok()
}

/// Busy-wait until `done` holds or `abort` fires. Returns the number of
/// polls spent and whether `done` was reached.
pub fn spin_until<D, S>(mut done: D, mut abort: S) -> (usize, bool)
where
    D: FnMut() -> bool,
    S: FnMut() -> bool,
{
    let backoff = Backoff::new();
    let mut polls = 0;
    loop {
        if done() {
            return (polls, true);
        }
        if abort() {
            return (polls, false);
        }
        polls += 1;
        backoff.snooze();
        if backoff.is_completed() {
            std::thread::yield_now();
        }
    }
}
