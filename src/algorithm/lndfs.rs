//! Swarmed nested DFS sharing the red color.
//!
//! Workers run their own blue searches but publish red states globally, so
//! a red search never re-enters territory another worker has already
//! proven free of accepting cycles. A seed only turns red once every red
//! search passing through it has finished, tracked by its wip counter.

use crate::algorithm::ndfs::NestedLocal;
use crate::algorithm::{Algorithm, Shared, WorkerContext};
use crate::color::{GlobalColor, LocalColor};
use crate::core::errors::Result;
use crate::stats::Counters;
use crate::store::Ref;
use tracing::{debug, trace};

pub struct Lndfs {
    ecd: bool,
    all_red: bool,
}

type Ctx<'c, 's> = &'c mut WorkerContext<'s, ()>;

impl Lndfs {
    fn blue(&self, ctx: Ctx<'_, '_>, loc: &mut NestedLocal, root: Ref) -> Result<()> {
        let colors = ctx.colors();
        loc.stack.push(root);
        while !ctx.is_stopped() {
            if let Some(r) = loc.stack.top() {
                if loc.colors.is(r, LocalColor::White) && !colors.has(r, GlobalColor::Red) {
                    if self.all_red {
                        loc.mark_all_red();
                    }
                    loc.colors.set(r, LocalColor::Cyan);
                    self.explore_blue(ctx, loc, r)?;
                } else {
                    if self.all_red && !colors.has(r, GlobalColor::Red) {
                        loc.unset_parent();
                    }
                    loc.stack.pop();
                }
                continue;
            }
            if loc.stack.nframes() == 0 {
                break;
            }
            loc.stack.leave();
            let Some(seed) = loc.stack.top() else { break };
            if self.all_red && loc.is_all_red() {
                self.wait(ctx, seed);
                self.set_all_red(ctx, seed);
            } else if ctx.is_accepting(seed) {
                self.red(ctx, loc, seed)?;
            } else if self.all_red && !colors.has(seed, GlobalColor::Red) {
                loc.unset_parent();
            }
            loc.colors.set(seed, LocalColor::Blue);
            loc.stack.pop();
        }
        Ok(())
    }

    fn explore_blue(&self, ctx: Ctx<'_, '_>, loc: &mut NestedLocal, r: Ref) -> Result<()> {
        let colors = ctx.colors();
        loc.stack.enter();
        ctx.counters.explored += 1;
        ctx.counters.level(loc.stack.nframes());
        ctx.expand(r, &mut loc.succs)?;
        ctx.counters.transitions += loc.succs.len() as u64;
        let accepting = self.ecd && ctx.is_accepting(r);
        for i in 0..loc.succs.len() {
            let s = loc.succs[i].r;
            if self.ecd && loc.colors.is(s, LocalColor::Cyan) && (accepting || ctx.is_accepting(s)) {
                return ctx.report_cycle(loc.stack.path(), s);
            }
            if !colors.has(s, GlobalColor::Red) {
                loc.stack.push(s);
            }
        }
        Ok(())
    }

    /// Red search seeded at `seed`, bracketed by the seed's wip counter
    fn red(&self, ctx: Ctx<'_, '_>, loc: &mut NestedLocal, seed: Ref) -> Result<()> {
        let colors = ctx.colors();
        colors.inc_wip(seed)?;
        let searched = self.red_search(ctx, loc, seed);
        colors.dec_wip(seed)?;
        if searched? {
            let wait = self.wait(ctx, seed);
            if !wait.interrupted && colors.try_color(seed, GlobalColor::Red) {
                ctx.counters.accepting += 1;
            }
        }
        Ok(())
    }

    /// Returns `false` when the run stopped before the search completed
    fn red_search(&self, ctx: Ctx<'_, '_>, loc: &mut NestedLocal, seed: Ref) -> Result<bool> {
        let colors = ctx.colors();
        let base = loc.stack.nframes();
        self.explore_red(ctx, loc, seed)?;
        while !ctx.is_stopped() {
            if let Some(r) = loc.stack.top() {
                if !loc.colors.is(r, LocalColor::Pink) && !colors.has(r, GlobalColor::Red) {
                    loc.colors.set(r, LocalColor::Pink);
                    ctx.counters.red_explored += 1;
                    self.explore_red(ctx, loc, r)?;
                } else {
                    loc.stack.pop();
                }
                continue;
            }
            loc.stack.leave();
            if loc.stack.nframes() == base {
                return Ok(true);
            }
            if let Some(r) = loc.stack.top() {
                if !colors.try_color(r, GlobalColor::Red) {
                    ctx.counters.bogus_red += 1;
                }
            }
            loc.stack.pop();
        }
        Ok(false)
    }

    fn explore_red(&self, ctx: Ctx<'_, '_>, loc: &mut NestedLocal, r: Ref) -> Result<()> {
        let colors = ctx.colors();
        loc.stack.enter();
        ctx.expand(r, &mut loc.succs)?;
        ctx.counters.red_transitions += loc.succs.len() as u64;
        for i in 0..loc.succs.len() {
            let s = loc.succs[i].r;
            match loc.colors.get(s) {
                LocalColor::Cyan => return ctx.report_cycle(loc.stack.path(), s),
                LocalColor::Blue if !colors.has(s, GlobalColor::Red) => loc.stack.push(s),
                _ => {}
            }
        }
        Ok(())
    }

    fn wait(&self, ctx: Ctx<'_, '_>, seed: Ref) -> crate::color::SeedWait {
        let wait = ctx.colors().wait_seed(seed, || ctx.is_stopped());
        if wait.waited {
            ctx.counters.waits += 1;
            trace!(worker = ctx.id, seed, "Waited for seed");
        }
        wait
    }

    fn set_all_red(&self, ctx: Ctx<'_, '_>, r: Ref) {
        if ctx.colors().try_color(r, GlobalColor::Red) {
            ctx.counters.allred += 1;
            if ctx.is_accepting(r) {
                ctx.counters.accepting += 1;
            }
        } else {
            ctx.counters.bogus_red += 1;
        }
    }
}

impl Algorithm for Lndfs {
    type Work = ();
    type Local = NestedLocal;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        Ok(Self {
            ecd: shared.config.ltl.early_cycle_detection,
            all_red: shared.config.ltl.all_red,
        })
    }

    fn local_init(&self, ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        Ok(NestedLocal::new(ctx.store().capacity()))
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        let (init, _) = ctx.initial()?;
        self.blue(ctx, local, init)
    }

    fn print_stats(&self, total: &Counters) {
        debug!(
            accepting = total.accepting,
            red = total.red_explored,
            allred = total.allred,
            waits = total.waits,
            bogus_red = total.bogus_red,
            "LNDFS done"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::testing::{config, shared};
    use crate::core::config::AlgorithmKind;
    use crate::oracle::ExplicitGraph;
    use crate::run::Outcome;
    use pretty_assertions::assert_eq;

    fn check(graph: &ExplicitGraph, ecd: bool) -> (Option<Outcome>, Counters, usize) {
        let mut config = config(AlgorithmKind::Lndfs, 1);
        config.ltl.early_cycle_detection = ecd;
        let shared = shared::<()>(&config, graph);
        let lndfs = Lndfs::global_init(&shared).unwrap();
        let mut ctx = WorkerContext::new(0, &shared);
        let mut local = lndfs.local_init(&mut ctx).unwrap();
        lndfs.run(&mut ctx, &mut local).unwrap();
        let red = shared
            .store
            .published()
            .filter(|r| ctx.colors().has(*r, GlobalColor::Red))
            .count();
        (shared.take_finding().map(|f| f.outcome), ctx.counters, red)
    }

    #[test]
    fn test_acyclic_graph_turns_fully_red() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 3])
            .edge(1, 3)
            .accepting(2)
            .build();
        let (outcome, counters, red) = check(&graph, true);
        assert_eq!(outcome, None);
        assert_eq!(red, 4);
        assert_eq!(counters.waits, 0);
    }

    #[test]
    fn test_cycle_found_with_and_without_early_detection() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 3, 1])
            .accepting(2)
            .build();
        assert_eq!(check(&graph, true).0, Some(Outcome::CycleFound));
        assert_eq!(check(&graph, false).0, Some(Outcome::CycleFound));
    }

    #[test]
    fn test_wip_drains_after_red_search() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2])
            .path(&[0, 3, 2])
            .accepting(1)
            .accepting(3)
            .build();
        let mut config = config(AlgorithmKind::Lndfs, 1);
        config.ltl.all_red = false;
        let shared = shared::<()>(&config, &graph);
        let lndfs = Lndfs::global_init(&shared).unwrap();
        let mut ctx = WorkerContext::new(0, &shared);
        let mut local = lndfs.local_init(&mut ctx).unwrap();
        lndfs.run(&mut ctx, &mut local).unwrap();
        assert_eq!(shared.store.published().count(), 4);
        for r in shared.store.published() {
            assert_eq!(ctx.colors().wip(r), 0);
        }
        assert!(shared.take_finding().is_none());
        assert_eq!(ctx.counters.accepting, 2);
    }
}
