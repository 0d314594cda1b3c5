//! Cooperative nested DFS (CNDFS) and its dangerous-state sibling (ENDFS).
//!
//! Blue searches share GREEN (blue-finished somewhere) and red searches
//! share RED. A red search remembers what it colored PINK; once it is done
//! those states become RED together. CNDFS first waits until every other
//! accepting state met on the way is red. ENDFS instead marks such states
//! DANGEROUS and, when the seed itself ends up dangerous, settles it with
//! a sequential nested search.

use crate::algorithm::ndfs::{NestedLocal, Ndfs};
use crate::algorithm::{Algorithm, Shared, WorkerContext};
use crate::color::{GlobalColor, LocalColor};
use crate::core::atomics::spin_until;
use crate::core::config::{AlgorithmKind, LtlConfig};
use crate::core::errors::Result;
use crate::stats::Counters;
use crate::store::Ref;
use tracing::{debug, trace};

pub struct Cndfs {
    endfs: bool,
    ecd: bool,
    all_red: bool,
    fallback: Ndfs,
}

pub struct CndfsLocal {
    nested: NestedLocal,
    /// States colored PINK by the current red search
    in_stack: Vec<Ref>,
    /// Accepting states other than the seed met by the current red search
    out_stack: Vec<Ref>,
    /// Colors of the sequential fallback search, allocated on first use
    fallback: Option<NestedLocal>,
}

type Ctx<'c, 's> = &'c mut WorkerContext<'s, ()>;

impl Cndfs {
    fn blue(&self, ctx: Ctx<'_, '_>, loc: &mut CndfsLocal, root: Ref) -> Result<()> {
        let colors = ctx.colors();
        loc.nested.stack.push(root);
        while !ctx.is_stopped() {
            let nested = &mut loc.nested;
            if let Some(r) = nested.stack.top() {
                let color = nested.colors.get(r);
                if color != LocalColor::Cyan
                    && color != LocalColor::Blue
                    && !colors.has(r, GlobalColor::Green)
                {
                    if self.all_red {
                        nested.mark_all_red();
                    }
                    nested.colors.set(r, LocalColor::Cyan);
                    self.explore_blue(ctx, nested, r)?;
                } else {
                    if self.all_red && !colors.has(r, GlobalColor::Red) {
                        nested.unset_parent();
                    }
                    nested.stack.pop();
                }
                continue;
            }
            if nested.stack.nframes() == 0 {
                break;
            }
            nested.stack.leave();
            let Some(seed) = nested.stack.top() else { break };
            colors.try_color(seed, GlobalColor::Green);
            if self.all_red && nested.is_all_red() {
                self.set_all_red(ctx, seed);
            } else if ctx.is_accepting(seed) {
                self.red(ctx, loc, seed)?;
            } else if self.all_red && !colors.has(seed, GlobalColor::Red) {
                loc.nested.unset_parent();
            }
            loc.nested.colors.set(seed, LocalColor::Blue);
            loc.nested.stack.pop();
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
            let color = loc.colors.get(s);
            if self.ecd && color == LocalColor::Cyan && (accepting || ctx.is_accepting(s)) {
                return ctx.report_cycle(loc.stack.path(), s);
            }
            if self.all_red
                || (color != LocalColor::Cyan
                    && color != LocalColor::Blue
                    && !colors.has(s, GlobalColor::Green))
            {
                loc.stack.push(s);
            }
        }
        Ok(())
    }

    fn red(&self, ctx: Ctx<'_, '_>, loc: &mut CndfsLocal, seed: Ref) -> Result<()> {
        if ctx.colors().has(seed, GlobalColor::Red) {
            return Ok(());
        }
        loc.in_stack.clear();
        loc.out_stack.clear();
        if !self.red_search(ctx, loc, seed)? {
            return Ok(());
        }
        if self.endfs {
            self.settle_dangerous(ctx, loc, seed)
        } else {
            self.settle_accepting(ctx, loc, seed);
            Ok(())
        }
    }

    /// Returns `false` when the run stopped before the search completed
    fn red_search(&self, ctx: Ctx<'_, '_>, loc: &mut CndfsLocal, seed: Ref) -> Result<bool> {
        let colors = ctx.colors();
        let base = loc.nested.stack.nframes();
        loc.in_stack.push(seed);
        self.explore_red(ctx, &mut loc.nested, seed)?;
        while !ctx.is_stopped() {
            if let Some(r) = loc.nested.stack.top() {
                if !loc.nested.colors.is(r, LocalColor::Pink) && !colors.has(r, GlobalColor::Red) {
                    loc.nested.colors.set(r, LocalColor::Pink);
                    ctx.counters.red_explored += 1;
                    loc.in_stack.push(r);
                    if !self.endfs && ctx.is_accepting(r) {
                        loc.out_stack.push(r);
                    }
                    self.explore_red(ctx, &mut loc.nested, r)?;
                } else {
                    loc.nested.stack.pop();
                }
                continue;
            }
            loc.nested.stack.leave();
            if loc.nested.stack.nframes() == base {
                return Ok(true);
            }
            loc.nested.stack.pop();
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
            let color = loc.colors.get(s);
            if color == LocalColor::Cyan {
                return ctx.report_cycle(loc.stack.path(), s);
            }
            let red = colors.has(s, GlobalColor::Red);
            if self.endfs && !red && ctx.is_accepting(s) {
                colors.try_color(s, GlobalColor::Dangerous);
            }
            if color != LocalColor::Pink && !red {
                loc.stack.push(s);
            }
        }
        Ok(())
    }

    /// CNDFS: wait for the other accepting states of the red search to turn
    /// red, then publish the whole search as red.
    fn settle_accepting(&self, ctx: Ctx<'_, '_>, loc: &mut CndfsLocal, seed: Ref) {
        let colors = ctx.colors();
        if !loc.out_stack.is_empty() {
            ctx.counters.waits += 1;
            let out = &loc.out_stack;
            let (polls, _) = spin_until(
                || out.iter().all(|r| colors.has(*r, GlobalColor::Red)),
                || ctx.is_stopped(),
            );
            trace!(worker = ctx.id, seed, pending = out.len(), polls, "Waited for accepting states");
            loc.out_stack.clear();
        }
        if ctx.is_stopped() {
            return;
        }
        for r in loc.in_stack.drain(..) {
            if colors.try_color(r, GlobalColor::Red) {
                if r == seed {
                    ctx.counters.accepting += 1;
                }
            } else {
                ctx.counters.bogus_red += 1;
            }
        }
    }

    /// ENDFS: everything but dangerous states turns red. A dangerous seed
    /// is handed to the sequential nested search.
    fn settle_dangerous(&self, ctx: Ctx<'_, '_>, loc: &mut CndfsLocal, seed: Ref) -> Result<()> {
        let colors = ctx.colors();
        for r in loc.in_stack.drain(..) {
            if r != seed && !colors.has(r, GlobalColor::Dangerous) && !colors.try_color(r, GlobalColor::Red) {
                ctx.counters.bogus_red += 1;
            }
        }
        if colors.try_color(seed, GlobalColor::Red) {
            ctx.counters.accepting += 1;
        }
        if colors.has(seed, GlobalColor::Dangerous) {
            debug!(worker = ctx.id, seed, "Dangerous seed, running sequential search");
            let prefix: Vec<Ref> = loc.nested.stack.path().collect();
            let capacity = ctx.store().capacity();
            let fallback = loc.fallback.get_or_insert_with(|| NestedLocal::new(capacity));
            self.fallback.search(ctx, fallback, &prefix, seed)?;
        }
        Ok(())
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

impl Algorithm for Cndfs {
    type Work = ();
    type Local = CndfsLocal;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        let ltl = &shared.config.ltl;
        Ok(Self {
            endfs: shared.config.algorithm == AlgorithmKind::Endfs,
            ecd: ltl.early_cycle_detection,
            all_red: ltl.all_red,
            fallback: Ndfs::new(&LtlConfig {
                early_cycle_detection: true,
                all_red: ltl.all_red,
            }),
        })
    }

    fn local_init(&self, ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        Ok(CndfsLocal {
            nested: NestedLocal::new(ctx.store().capacity()),
            in_stack: Vec::new(),
            out_stack: Vec::new(),
            fallback: None,
        })
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        let (init, _) = ctx.initial()?;
        self.blue(ctx, local, init)
    }

    fn print_stats(&self, total: &Counters) {
        debug!(
            endfs = self.endfs,
            accepting = total.accepting,
            red = total.red_explored,
            allred = total.allred,
            waits = total.waits,
            bogus_red = total.bogus_red,
            "Cooperative nested search done"
        );
    }
}
