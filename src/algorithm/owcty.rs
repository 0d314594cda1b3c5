//! One-way catch-them-young: accepting cycle detection by elimination.
//!
//! An initial reachability pass collects the accepting states. Each round
//! then counts, for every state reachable from the surviving candidates,
//! its predecessors within that set, and eliminates states without
//! predecessors in a cascading backward pass. Candidates that survive a
//! round unchanged lie on or lead to an accepting cycle.

use crate::algorithm::{Algorithm, Shared, Successor, WorkerContext};
use crate::balance::split_stack;
use crate::core::atomics::{update, Update};
use crate::core::errors::{CheckError, Result};
use crate::stats::Counters;
use crate::store::Ref;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

const COUNT: u32 = (1 << 30) - 1;
const FLIP: u32 = 1 << 30;
const ACC: u32 = 1 << 31;

/// Balanced work: states to expand and candidates still to grab
#[derive(Debug, Default)]
pub struct OwctyWork {
    stack: Vec<Ref>,
    in_stack: Vec<Ref>,
}

impl OwctyWork {
    fn load(&self) -> usize {
        self.stack.len() + self.in_stack.len()
    }
}

fn split_candidates(src: &mut OwctyWork, dst: &mut OwctyWork, handoff: usize) -> isize {
    let moved = split_stack(&mut src.stack, &mut dst.stack, handoff);
    moved + split_stack(&mut src.in_stack, &mut dst.in_stack, handoff - moved as usize)
}

fn split_eliminated(src: &mut OwctyWork, dst: &mut OwctyWork, handoff: usize) -> isize {
    split_stack(&mut src.stack, &mut dst.stack, handoff)
}

pub struct Owcty {
    /// Per state: predecessor count, round flip bit and accepting bit
    records: Box<[AtomicU32]>,
}

pub struct OwctyLocal {
    work: OwctyWork,
    out_stack: Vec<Ref>,
    succs: Vec<Successor>,
    flip: u32,
}

type Ctx<'c, 's> = &'c mut WorkerContext<'s, OwctyWork>;

impl Owcty {
    /// Claim `r` for the current round with predecessor count `count`.
    /// Fails when the round already reached it, or, with `check_zero`,
    /// when a previous round eliminated it.
    fn try_reset(&self, r: Ref, count: u32, flip: u32, check_zero: bool) -> bool {
        update(&self.records[r], |w| {
            if w & FLIP == flip || (check_zero && w & COUNT == 0) {
                None
            } else {
                Some((w & ACC) | flip | count)
            }
        })
        .applied()
    }

    fn count(&self, r: Ref) -> u32 {
        self.records[r].load(Ordering::Acquire) & COUNT
    }

    fn is_accepting(&self, r: Ref) -> bool {
        self.records[r].load(Ordering::Acquire) & ACC != 0
    }

    fn add_predecessor(&self, r: Ref) -> Result<()> {
        match update(&self.records[r], |w| (w & COUNT != COUNT).then(|| w + 1)) {
            Update::Applied { .. } => Ok(()),
            Update::Declined { .. } => Err(CheckError::protocol_at("predecessor count overflow", r)),
        }
    }

    /// Returns the remaining count
    fn remove_predecessor(&self, r: Ref) -> Result<u32> {
        match update(&self.records[r], |w| (w & COUNT != 0).then(|| w - 1)) {
            Update::Applied { new, .. } => Ok(new & COUNT),
            Update::Declined { .. } => Err(CheckError::protocol_at("predecessor count below zero", r)),
        }
    }

    /// Plain reachability collecting the accepting states
    fn initialize(&self, ctx: Ctx<'_, '_>, loc: &mut OwctyLocal) -> (u64, bool) {
        let lb = ctx.lb();
        let OwctyLocal { work, out_stack, succs, .. } = loc;
        while lb.balance(ctx.id, work.load(), work, split_candidates) > 0 {
            let Some(r) = work.stack.pop() else { continue };
            if let Err(err) = self.visit_initial(ctx, succs, out_stack, &mut work.stack, r) {
                ctx.fail(err);
                break;
            }
        }
        ctx.reduce(out_stack.len())
    }

    fn visit_initial(
        &self,
        ctx: Ctx<'_, '_>,
        succs: &mut Vec<Successor>,
        out_stack: &mut Vec<Ref>,
        stack: &mut Vec<Ref>,
        r: Ref,
    ) -> Result<()> {
        ctx.counters.explored += 1;
        if ctx.is_accepting(r) {
            self.records[r].fetch_or(ACC, Ordering::AcqRel);
            out_stack.push(r);
        }
        ctx.expand(r, succs)?;
        ctx.counters.transitions += succs.len() as u64;
        stack.extend(succs.iter().filter(|s| s.is_new).map(|s| s.r));
        Ok(())
    }

    /// Forward pass from the candidates counting predecessors. Returns the
    /// number of states visited.
    fn reachability(&self, ctx: Ctx<'_, '_>, loc: &mut OwctyLocal, check_zero: bool) -> (u64, bool) {
        let lb = ctx.lb();
        let flip = loc.flip;
        let OwctyLocal { work, out_stack, succs, .. } = loc;
        let mut visited = 0;
        while lb.balance(ctx.id, work.load(), work, split_candidates) > 0 {
            if let Some(r) = work.stack.pop() {
                visited += 1;
                if let Err(err) = self.visit_reachable(ctx, succs, out_stack, &mut work.stack, flip, r) {
                    ctx.fail(err);
                    break;
                }
            } else if let Some(c) = work.in_stack.pop() {
                if self.try_reset(c, 0, flip, check_zero) {
                    work.stack.push(c);
                }
            }
        }
        ctx.reduce(visited)
    }

    fn visit_reachable(
        &self,
        ctx: Ctx<'_, '_>,
        succs: &mut Vec<Successor>,
        out_stack: &mut Vec<Ref>,
        stack: &mut Vec<Ref>,
        flip: u32,
        r: Ref,
    ) -> Result<()> {
        ctx.counters.explored += 1;
        if self.is_accepting(r) {
            out_stack.push(r);
        }
        ctx.expand(r, succs)?;
        ctx.counters.transitions += succs.len() as u64;
        for s in succs.iter() {
            if self.try_reset(s.r, 1, flip, false) {
                stack.push(s.r);
            } else {
                self.add_predecessor(s.r)?;
            }
        }
        Ok(())
    }

    /// Split the candidates into those without predecessors, which start
    /// the elimination, and survivors for the next round.
    fn pre_eliminate(&self, ctx: Ctx<'_, '_>, loc: &mut OwctyLocal) -> (u64, bool) {
        for r in loc.out_stack.drain(..) {
            if self.count(r) == 0 {
                loc.work.stack.push(r);
            } else {
                loc.work.in_stack.push(r);
            }
        }
        ctx.reduce(loc.work.stack.len())
    }

    /// Cascade removals forward. Returns the number of states eliminated.
    fn eliminate(&self, ctx: Ctx<'_, '_>, loc: &mut OwctyLocal) -> (u64, bool) {
        let lb = ctx.lb();
        let OwctyLocal { work, succs, .. } = loc;
        let mut eliminated = 0;
        while lb.balance(ctx.id, work.stack.len(), work, split_eliminated) > 0 {
            let Some(r) = work.stack.pop() else { continue };
            eliminated += 1;
            if let Err(err) = self.visit_eliminated(ctx, succs, &mut work.stack, r) {
                ctx.fail(err);
                break;
            }
        }
        ctx.reduce(eliminated)
    }

    fn visit_eliminated(
        &self,
        ctx: Ctx<'_, '_>,
        succs: &mut Vec<Successor>,
        stack: &mut Vec<Ref>,
        r: Ref,
    ) -> Result<()> {
        ctx.counters.explored += 1;
        ctx.expand(r, succs)?;
        ctx.counters.transitions += succs.len() as u64;
        for s in succs.iter() {
            if self.remove_predecessor(s.r)? == 0 {
                stack.push(s.r);
            }
        }
        Ok(())
    }

    fn phase_done(&self, ctx: &WorkerContext<'_, OwctyWork>, phase: &str, round: u64, size: u64) {
        if ctx.id == 0 {
            debug!(phase, round, candidates = size, "OWCTY phase done");
        }
    }
}

impl Algorithm for Owcty {
    type Work = OwctyWork;
    type Local = OwctyLocal;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        Ok(Self {
            records: (0..shared.store.capacity()).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    fn local_init(&self, ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        let mut local = OwctyLocal {
            work: OwctyWork::default(),
            out_stack: Vec::new(),
            succs: Vec::new(),
            flip: 0,
        };
        if ctx.id == 0 {
            let (init, _) = ctx.initial()?;
            local.work.stack.push(init);
        }
        Ok(local)
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        let lb = ctx.lb();
        let (mut size, mut stopped) = self.initialize(ctx, local);
        self.phase_done(ctx, "initialization", 0, size);
        local.work.in_stack = std::mem::take(&mut local.out_stack);

        let mut round = 0;
        let mut old_size = 0;
        while !stopped && size != 0 && size != old_size {
            round += 1;
            local.flip ^= FLIP;
            lb.reinit(ctx.id);
            (size, stopped) = self.reachability(ctx, local, round > 1);
            self.phase_done(ctx, "reachability", round, size);
            if stopped {
                break;
            }
            old_size = size;

            let (removed, halted) = self.pre_eliminate(ctx, local);
            size = size.saturating_sub(removed);
            stopped = halted;
            self.phase_done(ctx, "pre-elimination", round, size);
            if stopped || size == 0 || size == old_size {
                break;
            }

            lb.reinit(ctx.id);
            let (eliminated, halted) = self.eliminate(ctx, local);
            size = old_size.saturating_sub(eliminated);
            stopped = halted;
            self.phase_done(ctx, "elimination", round, size);
        }

        ctx.counters.rounds = round + 1;
        if !stopped && size > 0 && ctx.id == 0 {
            ctx.report_cycle_untraced();
        }
        if ctx.id == 0 && !stopped {
            debug!(rounds = round + 1, cycle = size > 0, "OWCTY fixpoint reached");
        }
        Ok(())
    }

    fn print_stats(&self, total: &Counters) {
        debug!(rounds = total.rounds, explored = total.explored, "OWCTY done");
    }
}
