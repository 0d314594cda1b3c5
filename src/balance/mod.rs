//! Decentralized work-stealing load balancer.
//!
//! Each worker owns a work container `Q`. When a worker runs dry it marks
//! itself idle and posts a request bit in the slot of the worker advertising
//! the highest load. Busy workers look at their request bits only when their
//! load crosses a granularity boundary, and then hand off part of their work
//! through the requester's inbox using a caller-supplied split function.
//!
//! Termination: a single counter tracks idle workers. A server takes its
//! target out of the count before filling the inbox, so the count reaching
//! the number of workers proves that no work exists anywhere.

pub mod barrier;

use crate::core::atomics::CachePadded;
use crate::core::config::{BalancerConfig, MAX_WORKERS};
use crate::core::errors::{CheckError, Result};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use tracing::{debug, trace};

pub use barrier::{BarrierRole, Reducer, SpinBarrier};

const BUSY: u8 = 0;
const IDLE: u8 = 1;
const FILLING: u8 = 2;

struct Slot<Q> {
    state: AtomicU8,
    requests: AtomicU64,
    received: AtomicUsize,
    load: AtomicUsize,
    max_load: AtomicUsize,
    handoffs: AtomicUsize,
    cursor: AtomicUsize,
    inbox: Mutex<Q>,
}

impl<Q: Default> Slot<Q> {
    fn new(id: usize) -> Self {
        Self {
            state: AtomicU8::new(BUSY),
            requests: AtomicU64::new(0),
            received: AtomicUsize::new(0),
            load: AtomicUsize::new(0),
            max_load: AtomicUsize::new(0),
            handoffs: AtomicUsize::new(0),
            cursor: AtomicUsize::new(id),
            inbox: Mutex::new(Q::default()),
        }
    }
}

pub struct LoadBalancer<Q> {
    workers: usize,
    mask: usize,
    max_handoff: usize,
    poll_spins: u32,
    stopped: CachePadded<AtomicBool>,
    all_done: CachePadded<AtomicBool>,
    idle: CachePadded<AtomicUsize>,
    slots: Box<[CachePadded<Slot<Q>>]>,
    barrier: SpinBarrier,
    reducer: Reducer,
}

impl<Q: Default + Send> LoadBalancer<Q> {
    pub fn new(workers: usize, config: &BalancerConfig) -> Result<Self> {
        if workers == 0 || workers > MAX_WORKERS {
            return Err(CheckError::configuration_field(
                format!("load balancer supports 1 to {} workers", MAX_WORKERS),
                "workers",
                workers,
            ));
        }
        if config.granularity_log2 >= 32 {
            return Err(CheckError::configuration_field(
                "granularity_log2 must be below 32",
                "balancer.granularity_log2",
                config.granularity_log2,
            ));
        }
        let granularity = 1usize << config.granularity_log2;
        Ok(Self {
            workers,
            mask: granularity - 1,
            max_handoff: config.max_handoff.max(1),
            poll_spins: config.poll_spins.max(1),
            stopped: CachePadded::new(AtomicBool::new(false)),
            all_done: CachePadded::new(AtomicBool::new(false)),
            idle: CachePadded::new(AtomicUsize::new(0)),
            slots: (0..workers).map(|id| CachePadded::new(Slot::new(id))).collect(),
            barrier: SpinBarrier::new(workers),
            reducer: Reducer::new(workers),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Force termination. Returns `true` for the one caller that stopped the run.
    pub fn stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.all_done.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Stop the run and release every barrier and reduction for good.
    /// Used when a worker died and will never arrive again.
    pub fn poison(&self) {
        self.stop();
        self.all_done.store(true, Ordering::Release);
        self.barrier.poison();
        self.reducer.poison();
    }

    pub fn is_poisoned(&self) -> bool {
        self.barrier.is_poisoned()
    }

    pub fn barrier(&self) -> BarrierRole {
        self.barrier.wait()
    }

    /// Sum over all workers; `None` once the balancer is poisoned
    pub fn reduce(&self, value: u64) -> Option<u64> {
        self.reducer.reduce(value)
    }

    /// Reset `id`'s slot for another balancing phase. Every worker must call
    /// this after a barrier that follows the previous phase.
    pub fn reinit(&self, id: usize) {
        let slot = &self.slots[id];
        slot.requests.store(0, Ordering::Release);
        slot.received.store(0, Ordering::Release);
        slot.load.store(0, Ordering::Relaxed);
        if slot.state.swap(BUSY, Ordering::AcqRel) == IDLE {
            self.idle.fetch_sub(1, Ordering::AcqRel);
        }
        *slot.inbox.lock() = Q::default();
        if !self.is_stopped() {
            self.all_done.store(false, Ordering::Release);
        }
        self.barrier.wait();
    }

    /// Report `my_load` and exchange work if due.
    ///
    /// Returns the caller's load afterwards; 0 means the phase is over,
    /// either because every worker ran out of work or the run was stopped.
    #[inline]
    pub fn balance<F>(&self, id: usize, my_load: usize, work: &mut Q, split: F) -> usize
    where
        F: Fn(&mut Q, &mut Q, usize) -> isize,
    {
        if self.is_stopped() {
            return 0;
        }
        if my_load > 0 && (my_load & self.mask) != self.mask {
            return my_load;
        }
        self.balance_internal(id, my_load, work, &split)
    }

    fn balance_internal<F>(&self, id: usize, mut my_load: usize, work: &mut Q, split: &F) -> usize
    where
        F: Fn(&mut Q, &mut Q, usize) -> isize,
    {
        let slot = &self.slots[id];
        slot.max_load.fetch_max(my_load, Ordering::Relaxed);
        let mut requested = false;
        let mut failed_polls = 0;
        loop {
            if self.all_done.load(Ordering::Acquire) {
                return 0;
            }
            slot.load.store(my_load, Ordering::Relaxed);
            if my_load == 0 {
                if slot.state.load(Ordering::Acquire) == BUSY {
                    slot.state.store(IDLE, Ordering::Release);
                    self.idle.fetch_add(1, Ordering::AcqRel);
                }
                if self.idle.load(Ordering::Acquire) == self.workers {
                    debug!(worker = id, "All workers idle");
                    self.all_done.store(true, Ordering::Release);
                    return 0;
                }
                if !requested {
                    if let Some(victim) = self.select_victim(id) {
                        self.slots[victim]
                            .requests
                            .fetch_or(1 << id, Ordering::AcqRel);
                        trace!(worker = id, victim, "Requested work");
                        requested = true;
                    }
                }
            }

            let requests = slot.requests.swap(0, Ordering::AcqRel);
            if requests != 0 && my_load > 0 {
                my_load = self.handoff(id, requests, my_load, work, split);
            }
            if my_load > 0 {
                slot.load.store(my_load, Ordering::Relaxed);
                return my_load;
            }

            let backoff = Backoff::new();
            loop {
                if slot.state.load(Ordering::Acquire) == BUSY {
                    let received = slot.received.swap(0, Ordering::AcqRel);
                    if received > 0 {
                        let mut inbox = slot.inbox.lock();
                        split(&mut inbox, work, received);
                    }
                    my_load = received;
                    requested = false;
                    break;
                }
                if self.all_done.load(Ordering::Acquire) {
                    break;
                }
                if backoff.is_completed() {
                    failed_polls += 1;
                    if failed_polls >= self.poll_spins {
                        failed_polls = 0;
                        requested = false;
                    }
                    break;
                }
                backoff.snooze();
            }
            if my_load > 0 {
                slot.load.store(my_load, Ordering::Relaxed);
                return my_load;
            }
        }
    }

    /// Serve pending requests. Only the last half of the requesters (by id)
    /// is served; the others poll again.
    fn handoff<F>(&self, id: usize, requests: u64, mut my_load: usize, work: &mut Q, split: &F) -> usize
    where
        F: Fn(&mut Q, &mut Q, usize) -> isize,
    {
        let pending = requests.count_ones() as usize;
        let requesters = (0..self.workers).filter(|oid| requests & (1 << oid) != 0);
        for (idx, oid) in requesters.enumerate() {
            if pending - idx > (self.workers >> 1).max(1) || my_load < 2 {
                continue;
            }
            let target = &self.slots[oid];
            if target
                .state
                .compare_exchange(IDLE, FILLING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            self.idle.fetch_sub(1, Ordering::AcqRel);
            let amount = (my_load >> 1).min(self.max_handoff);
            let moved = {
                let mut inbox = target.inbox.lock();
                split(work, &mut inbox, amount)
            };
            let received = if moved < 0 {
                moved.unsigned_abs()
            } else {
                let moved = moved as usize;
                my_load -= moved.min(my_load);
                moved
            };
            target.received.store(received, Ordering::Release);
            target.state.store(BUSY, Ordering::Release);
            self.slots[id].handoffs.fetch_add(1, Ordering::Relaxed);
            trace!(worker = id, target = oid, received, "Handed off work");
        }
        my_load
    }

    /// Busy worker with the highest advertised load, lowest id on ties.
    /// Falls back to a rotating cursor when nobody advertises load.
    fn select_victim(&self, id: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (oid, slot) in self.slots.iter().enumerate() {
            if oid == id || slot.state.load(Ordering::Acquire) != BUSY {
                continue;
            }
            let load = slot.load.load(Ordering::Relaxed);
            if load > 0 && best.map_or(true, |(_, l)| load > l) {
                best = Some((oid, load));
            }
        }
        if let Some((oid, _)) = best {
            return Some(oid);
        }
        if self.workers < 2 {
            return None;
        }
        let cursor = &self.slots[id].cursor;
        let start = cursor.load(Ordering::Relaxed);
        for step in 1..=self.workers {
            let oid = (start + step) % self.workers;
            if oid != id && self.slots[oid].state.load(Ordering::Acquire) == BUSY {
                cursor.store(oid, Ordering::Relaxed);
                return Some(oid);
            }
        }
        None
    }

    /// Sum over workers of the highest load each one reported
    pub fn max_load(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.max_load.load(Ordering::Relaxed))
            .sum()
    }

    pub fn handoffs(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.handoffs.load(Ordering::Relaxed))
            .sum()
    }
}

/// Move up to `handoff` items from the bottom of a DFS stack
pub fn split_stack<T>(src: &mut Vec<T>, dst: &mut Vec<T>, handoff: usize) -> isize {
    let amount = handoff.min(src.len());
    dst.extend(src.drain(..amount));
    amount as isize
}

/// Move up to `handoff` of the oldest items of a deque
pub fn split_queue<T>(src: &mut VecDeque<T>, dst: &mut VecDeque<T>, handoff: usize) -> isize {
    let amount = handoff.min(src.len());
    dst.extend(src.drain(..amount));
    amount as isize
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn config(granularity_log2: u32) -> BalancerConfig {
        BalancerConfig {
            granularity_log2,
            max_handoff: 100,
            poll_spins: 2,
        }
    }

    #[test]
    fn test_split_helpers() {
        let mut src: Vec<u32> = (0..10).collect();
        let mut dst = Vec::new();
        assert_eq!(split_stack(&mut src, &mut dst, 4), 4);
        assert_eq!(dst, vec![0, 1, 2, 3]);
        assert_eq!(src.len(), 6);

        let mut q: VecDeque<u32> = (0..5).collect();
        let mut out = VecDeque::new();
        assert_eq!(split_queue(&mut q, &mut out, 10), 5);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fast_path_between_boundaries() {
        let lb: LoadBalancer<Vec<u32>> = LoadBalancer::new(2, &config(2)).unwrap();
        let mut work = vec![1, 2, 3, 4, 5];
        assert_eq!(lb.balance(0, 5, &mut work, split_stack), 5);
    }

    #[test]
    fn test_single_worker_terminates_when_dry() {
        let lb: LoadBalancer<Vec<u32>> = LoadBalancer::new(1, &config(0)).unwrap();
        let mut work = Vec::new();
        assert_eq!(lb.balance(0, 0, &mut work, split_stack), 0);
    }

    #[test]
    fn test_stop_returns_zero_everywhere() {
        let lb: LoadBalancer<Vec<u32>> = LoadBalancer::new(3, &config(0)).unwrap();
        assert!(lb.stop());
        assert!(!lb.stop());
        for id in 0..3 {
            let mut work = vec![1, 2, 3];
            assert_eq!(lb.balance(id, 3, &mut work, split_stack), 0);
        }
    }

    #[test]
    fn test_handoff_conserves_load() {
        let lb: Arc<LoadBalancer<Vec<u32>>> = Arc::new(LoadBalancer::new(2, &config(0)).unwrap());
        let served = Arc::new(AtomicBool::new(false));

        let requester = {
            let lb = lb.clone();
            let served = served.clone();
            thread::spawn(move || {
                let mut work = Vec::new();
                let load = lb.balance(1, 0, &mut work, split_stack);
                served.store(true, Ordering::Release);
                (load, work)
            })
        };

        let mut work: Vec<u32> = (0..64).collect();
        let before = work.len();
        let mut load = before;
        while !served.load(Ordering::Acquire) {
            load = lb.balance(0, work.len(), &mut work, split_stack);
        }
        let (received, remote) = requester.join().unwrap();
        assert_eq!(received, remote.len());
        assert_eq!(before, work.len() + received);
        assert_eq!(load, work.len());
        assert_eq!(received, 32);
        assert_eq!(lb.handoffs(), 1);
    }

    #[test]
    fn test_all_workers_terminate_and_process_everything() {
        let workers = 4;
        let lb: Arc<LoadBalancer<Vec<u32>>> = Arc::new(LoadBalancer::new(workers, &config(1)).unwrap());
        let processed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let lb = lb.clone();
                let processed = processed.clone();
                thread::spawn(move || {
                    let mut work: Vec<u32> = if id == 0 { (0..5000).collect() } else { Vec::new() };
                    while lb.balance(id, work.len(), &mut work, split_stack) > 0 {
                        if work.pop().is_some() {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    assert!(work.is_empty());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(processed.load(Ordering::Relaxed), 5000);
    }

    #[test]
    fn test_reinit_allows_another_phase() {
        let workers = 2;
        let lb: Arc<LoadBalancer<Vec<u32>>> = Arc::new(LoadBalancer::new(workers, &config(0)).unwrap());
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let lb = lb.clone();
                thread::spawn(move || {
                    let mut total = 0;
                    for _phase in 0..3 {
                        let mut work: Vec<u32> = if id == 0 { (0..100).collect() } else { Vec::new() };
                        while lb.balance(id, work.len(), &mut work, split_stack) > 0 {
                            work.pop();
                            total += 1;
                        }
                        lb.barrier();
                        lb.reinit(id);
                    }
                    total
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 300);
    }
}
