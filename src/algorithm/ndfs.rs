//! Nested depth-first search on local colors only.
//!
//! The blue search colors states CYAN while they are on the stack and BLUE
//! once backtracked. On backtracking an accepting state a red search looks
//! for a path back to any CYAN state, coloring what it visits PINK. With
//! several workers each one runs the complete search in its own successor
//! order and the first to close a cycle stops the others.

use crate::algorithm::{Algorithm, Shared, Successor, WorkerContext};
use crate::color::{ColorMap, LocalColor};
use crate::core::config::LtlConfig;
use crate::core::errors::Result;
use crate::dfs_stack::DfsStack;
use crate::stats::Counters;
use crate::store::Ref;
use tracing::debug;

/// Worker-private state of the nested searches.
///
/// `all_red[level]` stays set while every successor seen so far from the
/// state explored at `level` is red.
pub struct NestedLocal {
    pub(crate) stack: DfsStack<Ref>,
    pub(crate) colors: ColorMap,
    pub(crate) all_red: Vec<bool>,
    pub(crate) succs: Vec<Successor>,
}

impl NestedLocal {
    pub fn new(capacity: usize) -> Self {
        Self {
            stack: DfsStack::new(),
            colors: ColorMap::new(capacity),
            all_red: Vec::new(),
            succs: Vec::new(),
        }
    }

    /// Mark the state about to be explored as all-red until disproven
    #[inline]
    pub(crate) fn mark_all_red(&mut self) {
        let level = self.stack.nframes();
        if self.all_red.len() <= level {
            self.all_red.resize(level + 1, false);
        }
        self.all_red[level] = true;
    }

    /// The state on top of the current frame has all-red successors
    #[inline]
    pub(crate) fn is_all_red(&self) -> bool {
        self.all_red
            .get(self.stack.nframes())
            .copied()
            .unwrap_or(false)
    }

    /// A child of the state being explored is not red
    #[inline]
    pub(crate) fn unset_parent(&mut self) {
        let level = self.stack.nframes();
        if level > 0 {
            if let Some(bit) = self.all_red.get_mut(level - 1) {
                *bit = false;
            }
        }
    }
}

pub struct Ndfs {
    ecd: bool,
    all_red: bool,
}

impl Ndfs {
    pub fn new(ltl: &LtlConfig) -> Self {
        Self {
            ecd: ltl.early_cycle_detection,
            all_red: ltl.all_red,
        }
    }

    /// Run the nested search from `root`.
    ///
    /// `prefix` is the path leading to `root` and only ends up in traces.
    /// Colors in `loc` are kept between calls, so repeated searches from
    /// different roots skip what earlier ones settled.
    pub fn search<Q: Default + Send>(
        &self,
        ctx: &mut WorkerContext<'_, Q>,
        loc: &mut NestedLocal,
        prefix: &[Ref],
        root: Ref,
    ) -> Result<()> {
        loc.stack.clear();
        loc.stack.push(root);
        while !ctx.is_stopped() {
            if let Some(r) = loc.stack.top() {
                if loc.colors.is(r, LocalColor::White) {
                    if self.all_red {
                        loc.mark_all_red();
                    }
                    loc.colors.set(r, LocalColor::Cyan);
                    self.explore_blue(ctx, loc, prefix, r)?;
                } else {
                    if !loc.colors.is(r, LocalColor::Pink) {
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
                loc.colors.set(seed, LocalColor::Pink);
                ctx.counters.allred += 1;
                if ctx.is_accepting(seed) {
                    ctx.counters.accepting += 1;
                }
            } else if ctx.is_accepting(seed) {
                self.red(ctx, loc, prefix, seed)?;
                loc.colors.set(seed, LocalColor::Pink);
            } else {
                loc.unset_parent();
                loc.colors.set(seed, LocalColor::Blue);
            }
            loc.stack.pop();
        }
        Ok(())
    }

    fn explore_blue<Q: Default + Send>(
        &self,
        ctx: &mut WorkerContext<'_, Q>,
        loc: &mut NestedLocal,
        prefix: &[Ref],
        r: Ref,
    ) -> Result<()> {
        loc.stack.enter();
        ctx.counters.explored += 1;
        ctx.counters.level(prefix.len() + loc.stack.nframes());
        ctx.expand(r, &mut loc.succs)?;
        ctx.counters.transitions += loc.succs.len() as u64;
        let accepting = self.ecd && ctx.is_accepting(r);
        for i in 0..loc.succs.len() {
            let s = loc.succs[i].r;
            let color = loc.colors.get(s);
            if self.ecd && color == LocalColor::Cyan && (accepting || ctx.is_accepting(s)) {
                return ctx.report_cycle(prefix.iter().copied().chain(loc.stack.path()), s);
            }
            if color != LocalColor::Pink {
                loc.stack.push(s);
            }
        }
        Ok(())
    }

    /// Search for a path from `seed` back to the blue stack. The seed stays
    /// CYAN meanwhile, so reaching it again closes a cycle.
    fn red<Q: Default + Send>(
        &self,
        ctx: &mut WorkerContext<'_, Q>,
        loc: &mut NestedLocal,
        prefix: &[Ref],
        seed: Ref,
    ) -> Result<()> {
        ctx.counters.accepting += 1;
        let base = loc.stack.nframes();
        self.explore_red(ctx, loc, prefix, seed)?;
        while !ctx.is_stopped() {
            if let Some(r) = loc.stack.top() {
                if loc.colors.is(r, LocalColor::Blue) {
                    loc.colors.set(r, LocalColor::Pink);
                    ctx.counters.red_explored += 1;
                    self.explore_red(ctx, loc, prefix, r)?;
                } else {
                    loc.stack.pop();
                }
                continue;
            }
            loc.stack.leave();
            if loc.stack.nframes() == base {
                break;
            }
            loc.stack.pop();
        }
        Ok(())
    }

    fn explore_red<Q: Default + Send>(
        &self,
        ctx: &mut WorkerContext<'_, Q>,
        loc: &mut NestedLocal,
        prefix: &[Ref],
        r: Ref,
    ) -> Result<()> {
        loc.stack.enter();
        ctx.expand(r, &mut loc.succs)?;
        ctx.counters.red_transitions += loc.succs.len() as u64;
        for i in 0..loc.succs.len() {
            let s = loc.succs[i].r;
            match loc.colors.get(s) {
                LocalColor::Cyan => {
                    return ctx.report_cycle(prefix.iter().copied().chain(loc.stack.path()), s);
                }
                LocalColor::Blue => loc.stack.push(s),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Algorithm for Ndfs {
    type Work = ();
    type Local = NestedLocal;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self> {
        Ok(Self::new(&shared.config.ltl))
    }

    fn local_init(&self, ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        Ok(NestedLocal::new(ctx.store().capacity()))
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        let (init, _) = ctx.initial()?;
        self.search(ctx, local, &[], init)
    }

    fn print_stats(&self, total: &Counters) {
        debug!(
            accepting = total.accepting,
            red = total.red_explored,
            allred = total.allred,
            "Nested search done"
        );
    }
}
