//! Reachability: BFS, DFS, strict BFS and hash-partitioned BFS.
//!
//! Every expanded state runs the configured side checks (deadlock,
//! invariant, error action). Parents are recorded by whichever worker
//! inserted a state, so a violation can be traced back to the initial state.

use crate::algorithm::{Algorithm, Shared, Successor, WorkerContext};
use crate::balance::split_queue;
use crate::core::config::{AlgorithmKind, CheckConfig};
use crate::core::errors::Result;
use crate::run::Outcome;
use crate::stats::Counters;
use crate::store::Ref;
use crate::trace::Trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

const NO_PARENT: usize = usize::MAX;

/// A state waiting to be expanded, with its distance from the initial state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub r: Ref,
    pub depth: u32,
}

pub struct Reach {
    kind: AlgorithmKind,
    checks: CheckConfig,
    parents: Box<[AtomicUsize]>,
    /// Per-level inboxes of the partitioned BFS, double buffered by level parity
    inboxes: [Box<[Mutex<Vec<Item>>]>; 2],
}

pub struct ReachLocal {
    work: VecDeque<Item>,
    next: Vec<Item>,
    succs: Vec<Successor>,
    outboxes: Vec<Vec<Item>>,
}

/// Owner of a state in the partitioned BFS
fn owner(r: Ref, workers: usize) -> usize {
    let h = (r as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    ((h >> 32) % workers as u64) as usize
}

impl Reach {
    fn parent(&self, r: Ref) -> Option<Ref> {
        match self.parents[r].load(Ordering::Relaxed) {
            NO_PARENT => None,
            p => Some(p),
        }
    }

    /// References from the initial state to `r`
    fn path_to(&self, r: Ref) -> Vec<Ref> {
        let mut path = vec![r];
        let mut cur = r;
        while let Some(p) = self.parent(cur) {
            if path.len() > self.parents.len() {
                break;
            }
            path.push(p);
            cur = p;
        }
        path.reverse();
        path
    }

    fn violation(
        &self,
        ctx: &mut WorkerContext<'_, VecDeque<Item>>,
        outcome: Outcome,
        path: Vec<Ref>,
    ) -> Result<()> {
        match outcome {
            Outcome::Deadlock => ctx.counters.deadlocks += 1,
            Outcome::InvariantViolation => ctx.counters.violations += 1,
            _ => ctx.counters.errors += 1,
        }
        warn!(worker = ctx.id, ?outcome, depth = path.len(), "Violation found");
        if ctx.shared.report(ctx.id, outcome) {
            let trace = Trace::from_refs(ctx.store(), ctx.shared.oracle, &path, None)?;
            ctx.shared.attach_trace(trace)?;
        }
        Ok(())
    }

    /// Expand one state, run the checks and hand new successors to `push`
    fn explore<F: FnMut(Item)>(
        &self,
        ctx: &mut WorkerContext<'_, VecDeque<Item>>,
        succs: &mut Vec<Successor>,
        item: Item,
        mut push: F,
    ) -> Result<()> {
        if let Some(max) = self.checks.max_depth {
            if item.depth as usize >= max {
                return Ok(());
            }
        }
        ctx.counters.explored += 1;
        ctx.counters.level(item.depth as usize);
        if self.checks.invariant && !ctx.invariant_holds(item.r) {
            self.violation(ctx, Outcome::InvariantViolation, self.path_to(item.r))?;
        }

        ctx.expand(item.r, succs)?;
        ctx.counters.transitions += succs.len() as u64;
        if self.checks.deadlock && succs.is_empty() && !ctx.is_valid_end(item.r) {
            self.violation(ctx, Outcome::Deadlock, self.path_to(item.r))?;
        }
        for s in succs.iter() {
            if s.is_new {
                self.parents[s.r].store(item.r, Ordering::Relaxed);
                push(Item {
                    r: s.r,
                    depth: item.depth + 1,
                });
            }
            if self.checks.action_label.is_some() && s.label == self.checks.action_label {
                let mut path = self.path_to(item.r);
                path.push(s.r);
                self.violation(ctx, Outcome::ErrorAction, path)?;
            }
        }
        Ok(())
    }

    /// BFS and DFS: one balanced deque, FIFO or LIFO
    fn balanced(&self, ctx: &mut WorkerContext<'_, VecDeque<Item>>, local: &mut ReachLocal) -> Result<()> {
        let lifo = self.kind == AlgorithmKind::Dfs;
        let ReachLocal { work, succs, .. } = local;
        while ctx.lb().balance(ctx.id, work.len(), work, split_queue) > 0 {
            let next = if lifo { work.pop_back() } else { work.pop_front() };
            if let Some(item) = next {
                self.explore(ctx, succs, item, |i| work.push_back(i))?;
            }
        }
        Ok(())
    }

    /// Strict BFS: the current level is balanced, the next one stays local
    fn strict(&self, ctx: &mut WorkerContext<'_, VecDeque<Item>>, local: &mut ReachLocal) {
        let lb = ctx.lb();
        let mut level = 0u64;
        loop {
            let ReachLocal { work, next, succs, .. } = &mut *local;
            while lb.balance(ctx.id, work.len(), work, split_queue) > 0 {
                if let Some(item) = work.pop_front() {
                    if let Err(err) = self.explore(ctx, succs, item, |i| next.push(i)) {
                        ctx.fail(err);
                        break;
                    }
                }
            }
            let (size, stopped) = ctx.reduce(next.len());
            if stopped || size == 0 {
                break;
            }
            level += 1;
            if ctx.id == 0 {
                debug!(level, size, "Level complete");
            }
            lb.reinit(ctx.id);
            work.clear();
            work.extend(next.drain(..));
        }
        ctx.counters.rounds = level + 1;
    }

    /// Partitioned BFS: each state is expanded by its owner, levels are
    /// exchanged at the level barrier and nothing is stolen.
    fn partitioned(&self, ctx: &mut WorkerContext<'_, VecDeque<Item>>, local: &mut ReachLocal) {
        let workers = ctx.shared.workers();
        let mut parity = 0;
        let mut level = 0u64;
        loop {
            let incoming = std::mem::take(&mut *self.inboxes[parity][ctx.id].lock());
            let out = 1 - parity;
            let ReachLocal { succs, outboxes, .. } = &mut *local;
            let mut sent = 0;
            for item in incoming {
                if ctx.is_stopped() {
                    break;
                }
                let pushed = self.explore(ctx, succs, item, |i| {
                    outboxes[owner(i.r, workers)].push(i);
                });
                if let Err(err) = pushed {
                    ctx.fail(err);
                    break;
                }
            }
            for (dst, buf) in outboxes.iter_mut().enumerate() {
                if !buf.is_empty() {
                    sent += buf.len();
                    self.inboxes[out][dst].lock().append(buf);
                }
            }
            let (size, stopped) = ctx.reduce(sent);
            if stopped || size == 0 {
                break;
            }
            level += 1;
            parity = out;
        }
        ctx.counters.rounds = level + 1;
    }
}

impl Algorithm for Reach {
    type Work = VecDeque<Item>;
    type Local = ReachLocal;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        let capacity = shared.store.capacity();
        let inboxes = |n: usize| -> Box<[Mutex<Vec<Item>>]> {
            (0..n).map(|_| Mutex::new(Vec::new())).collect()
        };
        let pbfs_workers = if shared.config.algorithm == AlgorithmKind::Pbfs {
            shared.workers()
        } else {
            0
        };
        Ok(Self {
            kind: shared.config.algorithm,
            checks: shared.config.checks.clone(),
            parents: (0..capacity).map(|_| AtomicUsize::new(NO_PARENT)).collect(),
            inboxes: [inboxes(pbfs_workers), inboxes(pbfs_workers)],
        })
    }

    fn local_init(&self, ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        let mut local = ReachLocal {
            work: VecDeque::new(),
            next: Vec::new(),
            succs: Vec::new(),
            outboxes: Vec::new(),
        };
        if self.kind == AlgorithmKind::Pbfs {
            local.outboxes = vec![Vec::new(); ctx.shared.workers()];
        }
        if ctx.id == 0 {
            let (init, _) = ctx.initial()?;
            let item = Item { r: init, depth: 0 };
            if self.kind == AlgorithmKind::Pbfs {
                self.inboxes[0][owner(init, ctx.shared.workers())].lock().push(item);
            } else {
                local.work.push_back(item);
            }
        }
        Ok(local)
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        match self.kind {
            AlgorithmKind::Sbfs => self.strict(ctx, local),
            AlgorithmKind::Pbfs => self.partitioned(ctx, local),
            _ => self.balanced(ctx, local)?,
        }
        Ok(())
    }

    fn print_stats(&self, total: &Counters) {
        debug!(
            levels = total.level_max + 1,
            deadlocks = total.deadlocks,
            violations = total.violations,
            errors = total.errors,
            "Reachability done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_is_in_range() {
        for r in 0..1000 {
            assert!(owner(r, 3) < 3);
        }
        assert!((0..1000).any(|r| owner(r, 4) == 3));
    }
}
