use crate::core::atomics::CachePadded;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Which side of a barrier a caller ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierRole {
    /// Last to arrive; released the others
    Leader,
    Follower,
}

/// Sense-reversing spin barrier for a fixed number of workers.
///
/// Once poisoned, every wait returns at once: a worker that died will
/// never arrive.
#[derive(Debug)]
pub struct SpinBarrier {
    workers: usize,
    count: CachePadded<AtomicUsize>,
    sense: CachePadded<AtomicUsize>,
    poisoned: CachePadded<AtomicBool>,
}

impl SpinBarrier {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            count: CachePadded::new(AtomicUsize::new(0)),
            sense: CachePadded::new(AtomicUsize::new(0)),
            poisoned: CachePadded::new(AtomicBool::new(false)),
        }
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn wait(&self) -> BarrierRole {
        let flip = self.sense.load(Ordering::Acquire);
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.workers {
            self.count.store(0, Ordering::Release);
            self.sense.store(1 - flip, Ordering::Release);
            return BarrierRole::Leader;
        }
        let backoff = Backoff::new();
        while self.sense.load(Ordering::Acquire) == flip && !self.is_poisoned() {
            backoff.snooze();
        }
        BarrierRole::Follower
    }
}

/// All-worker sum reduction.
///
/// Contributions go into `sum` before the arrival is counted, so the last
/// arrival sees every contribution of the round.
#[derive(Debug)]
pub struct Reducer {
    workers: usize,
    arrived: CachePadded<AtomicUsize>,
    sum: CachePadded<AtomicU64>,
    result: CachePadded<AtomicU64>,
    sense: CachePadded<AtomicUsize>,
    poisoned: CachePadded<AtomicBool>,
}

impl Reducer {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            arrived: CachePadded::new(AtomicUsize::new(0)),
            sum: CachePadded::new(AtomicU64::new(0)),
            result: CachePadded::new(AtomicU64::new(0)),
            sense: CachePadded::new(AtomicUsize::new(0)),
            poisoned: CachePadded::new(AtomicBool::new(false)),
        }
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Contribute `value` and wait for every worker; all callers get the
    /// wrapping sum. `None` when the reduction was poisoned.
    pub fn reduce(&self, value: u64) -> Option<u64> {
        let flip = self.sense.load(Ordering::Acquire);
        self.sum.fetch_add(value, Ordering::AcqRel);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.workers {
            let total = self.sum.swap(0, Ordering::AcqRel);
            self.result.store(total, Ordering::Release);
            self.arrived.store(0, Ordering::Release);
            self.sense.store(1 - flip, Ordering::Release);
            return Some(total);
        }
        let backoff = Backoff::new();
        while self.sense.load(Ordering::Acquire) == flip {
            if self.poisoned.load(Ordering::Acquire) {
                return None;
            }
            backoff.snooze();
        }
        Some(self.result.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_barrier_has_one_leader_per_round() {
        let barrier = Arc::new(SpinBarrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    (0..10)
                        .filter(|_| barrier.wait() == BarrierRole::Leader)
                        .count()
                })
            })
            .collect();
        let leaders: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(leaders, 10);
    }

    #[test]
    fn test_reduce_sums_every_round() {
        let reducer = Arc::new(Reducer::new(3));
        let handles: Vec<_> = (0..3u64)
            .map(|id| {
                let reducer = reducer.clone();
                thread::spawn(move || (0..5u64).map(|round| reducer.reduce(id + round)).collect::<Vec<_>>())
            })
            .collect();
        for h in handles {
            let sums = h.join().unwrap();
            assert_eq!(sums, vec![Some(3), Some(6), Some(9), Some(12), Some(15)]);
        }
    }

    #[test]
    fn test_reduce_with_sixty_four_workers() {
        let reducer = Arc::new(Reducer::new(64));
        let handles: Vec<_> = (0..64u64)
            .map(|id| {
                let reducer = reducer.clone();
                thread::spawn(move || (reducer.reduce(id), reducer.reduce(1 << 60)))
            })
            .collect();
        for h in handles {
            let (first, second) = h.join().unwrap();
            assert_eq!(first, Some(64 * 63 / 2));
            // 64 << 60 wraps to zero
            assert_eq!(second, Some(0));
        }
    }

    #[test]
    fn test_poison_releases_waiters() {
        let barrier = Arc::new(SpinBarrier::new(3));
        let reducer = Arc::new(Reducer::new(3));
        let waiter = {
            let (barrier, reducer) = (barrier.clone(), reducer.clone());
            thread::spawn(move || (barrier.wait(), reducer.reduce(7)))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        barrier.poison();
        reducer.poison();
        let (role, sum) = waiter.join().unwrap();
        assert_eq!(role, BarrierRole::Follower);
        assert_eq!(sum, None);
        assert!(barrier.is_poisoned());
    }
}
