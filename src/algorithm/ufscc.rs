//! Multi-core SCC decomposition on a shared union-find.
//!
//! Every worker runs its own Tarjan-like search with a DFS stack and a
//! roots stack. Cycles are collapsed in the shared [`UnionFind`], so a
//! component found by one worker is immediately visible to all others and
//! a set whose list of unexplored states runs empty is dead for everyone.
//! An accepting state inside a non-trivial set, or on a self-loop, is an
//! accepting cycle.

use crate::algorithm::unionfind::{Claim, Pick, UnionFind};
use crate::algorithm::{Algorithm, Shared, Successor, WorkerContext};
use crate::core::errors::Result;
use crate::stats::Counters;
use crate::store::Ref;
use tracing::{debug, trace};

/// Entry of the DFS stack
struct Frame {
    r: Ref,
    succs: Vec<Successor>,
    next: usize,
    expanded: bool,
}

#[derive(Default)]
pub struct UfsccLocal {
    dstack: Vec<Frame>,
    roots: Vec<Ref>,
    spare: Vec<Vec<Successor>>,
}

impl UfsccLocal {
    fn push(&mut self, r: Ref) {
        let succs = self.spare.pop().unwrap_or_default();
        self.dstack.push(Frame {
            r,
            succs,
            next: 0,
            expanded: false,
        });
    }

    fn pop(&mut self) -> Option<Ref> {
        let frame = self.dstack.pop()?;
        let mut succs = frame.succs;
        succs.clear();
        self.spare.push(succs);
        Some(frame.r)
    }

    fn top(&self) -> Option<Ref> {
        self.dstack.last().map(|f| f.r)
    }
}

enum Step {
    Descend(Ref),
    Dead,
    Done,
}

pub struct Ufscc {
    uf: UnionFind,
}

type Ctx<'c, 's> = &'c mut WorkerContext<'s, ()>;

impl Ufscc {
    /// Explore the successors of the DFS top until a new state shows up
    fn step(&self, ctx: Ctx<'_, '_>, loc: &mut UfsccLocal) -> Result<Step> {
        let Some(frame) = loc.dstack.last_mut() else {
            return Ok(Step::Done);
        };
        let v = frame.r;
        if !frame.expanded {
            ctx.expand(v, &mut frame.succs)?;
            ctx.counters.transitions += frame.succs.len() as u64;
            frame.expanded = true;
        }
        while frame.next < frame.succs.len() {
            if self.uf.is_dead(v) {
                return Ok(Step::Dead);
            }
            let w = frame.succs[frame.next].r;
            frame.next += 1;
            if w == v {
                ctx.counters.self_loops += 1;
                if ctx.is_accepting(v) {
                    ctx.report_cycle_untraced();
                }
                continue;
            }
            let accepting = ctx.is_accepting(w);
            match self.uf.make_claim(w, ctx.id, accepting) {
                Claim::Dead => {}
                Claim::First => {
                    ctx.counters.explored += 1;
                    if accepting {
                        ctx.counters.accepting += 1;
                    }
                    return Ok(Step::Descend(w));
                }
                Claim::Success => return Ok(Step::Descend(w)),
                Claim::Found => {
                    if self.uf.sameset(v, w) {
                        continue;
                    }
                    let mut merged_accepting = false;
                    while !self.uf.sameset(v, w) {
                        loc.roots.pop();
                        let Some(&root) = loc.roots.last() else { break };
                        merged_accepting |= self.uf.union(root, v);
                    }
                    if merged_accepting {
                        trace!(worker = ctx.id, state = v, "Accepting set closed");
                        ctx.report_cycle_untraced();
                    }
                }
            }
        }
        Ok(Step::Done)
    }

    /// Backtrack from a fully explored top. Returns `false` once the search
    /// of this worker is over.
    fn backtrack(&self, ctx: Ctx<'_, '_>, loc: &mut UfsccLocal, v: Ref) -> bool {
        loc.pop();
        if let Some(top) = loc.top() {
            if self.uf.sameset(top, v) {
                return true;
            }
        }
        match self.uf.pick_from_list(v) {
            Pick::Live(w) => {
                loc.push(w);
                true
            }
            pick => {
                if pick == Pick::MarkedDead {
                    ctx.counters.sccs += 1;
                }
                let Some(top) = loc.top() else { return false };
                if self.uf.sameset(top, v) {
                    return true;
                }
                while loc.roots.len() > 1 {
                    match loc.roots.last() {
                        Some(&root) if self.uf.sameset(v, root) => {
                            loc.roots.pop();
                        }
                        _ => break,
                    }
                }
                true
            }
        }
    }
}

impl Algorithm for Ufscc {
    type Work = ();
    type Local = UfsccLocal;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        Ok(Self {
            uf: UnionFind::new(shared.store.capacity()),
        })
    }

    fn local_init(&self, _ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        Ok(UfsccLocal::default())
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, loc: &mut Self::Local) -> Result<()> {
        let (init, _) = ctx.initial()?;
        let accepting = ctx.is_accepting(init);
        if self.uf.make_claim(init, ctx.id, accepting) == Claim::First {
            ctx.counters.explored += 1;
            if accepting {
                ctx.counters.accepting += 1;
            }
        }
        loc.push(init);
        loc.roots.push(init);

        while !ctx.is_stopped() {
            let Some(v) = loc.top() else { break };
            if !self.uf.is_in_list(v) {
                if !self.backtrack(ctx, loc, v) {
                    break;
                }
                continue;
            }
            match self.step(ctx, loc)? {
                Step::Descend(w) => {
                    loc.push(w);
                    loc.roots.push(w);
                    ctx.counters.level(loc.dstack.len());
                }
                Step::Dead => {}
                Step::Done => self.uf.remove_from_list(v),
            }
        }
        Ok(())
    }

    fn print_stats(&self, total: &Counters) {
        debug!(
            sccs = total.sccs,
            self_loops = total.self_loops,
            accepting = total.accepting,
            "UFSCC done"
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

    fn check(graph: &ExplicitGraph) -> (Option<Outcome>, Counters) {
        let config = config(AlgorithmKind::Ufscc, 1);
        let shared = shared::<()>(&config, graph);
        let ufscc = Ufscc::global_init(&shared).unwrap();
        let mut ctx = WorkerContext::new(0, &shared);
        let mut local = ufscc.local_init(&mut ctx).unwrap();
        ufscc.run(&mut ctx, &mut local).unwrap();
        (shared.take_finding().map(|f| f.outcome), ctx.counters)
    }

    #[test]
    fn test_counts_components() {
        // {0} {1, 2} {3}
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 1])
            .edge(2, 3)
            .build();
        let (outcome, counters) = check(&graph);
        assert_eq!(outcome, None);
        assert_eq!(counters.explored, 4);
        assert_eq!(counters.sccs, 3);
    }

    #[test]
    fn test_accepting_component_is_a_cycle() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 3, 1])
            .accepting(3)
            .build();
        assert_eq!(check(&graph).0, Some(Outcome::CycleFound));
    }

    #[test]
    fn test_accepting_state_outside_cycles() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 1])
            .path(&[0, 3, 4])
            .accepting(3)
            .accepting(0)
            .build();
        let (outcome, counters) = check(&graph);
        assert_eq!(outcome, None);
        assert_eq!(counters.accepting, 2);
    }

    #[test]
    fn test_self_loops() {
        let plain = ExplicitGraph::builder().path(&[0, 1]).edge(1, 1).build();
        let (outcome, counters) = check(&plain);
        assert_eq!(outcome, None);
        assert_eq!(counters.self_loops, 1);

        let accepting = ExplicitGraph::builder()
            .path(&[0, 1])
            .edge(1, 1)
            .accepting(1)
            .build();
        assert_eq!(check(&accepting).0, Some(Outcome::CycleFound));
    }
}
