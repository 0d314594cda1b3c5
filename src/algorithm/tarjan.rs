//! Tarjan's SCC algorithm on an explicit stack.
//!
//! [`LocalTarjan`] is the single-worker search; [`Tarjan`] runs it as a
//! swarm where every worker decomposes the whole graph in its own successor
//! order. Renault's algorithm reuses the same search and plugs a shared
//! union-find in through [`ComponentSink`].
//!
//! A completed component that holds an accepting state and has more than
//! one member, or an accepting state with a self-loop, is an accepting
//! cycle. These are reported without a trace.

use crate::algorithm::{Algorithm, Shared, Successor, WorkerContext};
use crate::core::errors::Result;
use crate::dfs_stack::DfsStack;
use crate::stats::Counters;
use crate::store::Ref;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

/// Where completed components are published
pub(crate) trait ComponentSink: Sync {
    /// The component of `r` was completed, possibly by another worker
    fn is_dead(&self, r: Ref) -> bool;

    /// Returns `true` for the first worker to reach `r`
    fn claim(&self, r: Ref) -> bool;

    fn unite(&self, a: Ref, b: Ref);

    /// Returns `true` when this call completed the component
    fn mark_dead(&self, root: Ref) -> bool;
}

/// Components stay private to the worker that found them
pub(crate) struct Private;

impl ComponentSink for Private {
    fn is_dead(&self, _r: Ref) -> bool {
        false
    }

    fn claim(&self, _r: Ref) -> bool {
        true
    }

    fn unite(&self, _a: Ref, _b: Ref) {}

    fn mark_dead(&self, _root: Ref) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct Index {
    index: u32,
    low: u32,
}

/// Worker-private Tarjan search state
#[derive(Default)]
pub struct LocalTarjan {
    stack: DfsStack<Ref>,
    /// Visited states whose component is still open
    visited: FxHashMap<Ref, Index>,
    /// Backtracked states waiting for their root
    tarjan: Vec<Ref>,
    done: FxHashSet<Ref>,
    counter: u32,
    succs: Vec<Successor>,
}

impl LocalTarjan {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn search<Q: Default + Send, S: ComponentSink>(
        &mut self,
        ctx: &mut WorkerContext<'_, Q>,
        sink: &S,
        init: Ref,
    ) -> Result<()> {
        self.stack.push(init);
        while !ctx.is_stopped() {
            if let Some(r) = self.stack.top() {
                let first = sink.claim(r);
                if self.done.contains(&r) || sink.is_dead(r) {
                    self.stack.pop();
                    continue;
                }
                match self.visited.get(&r) {
                    None => {
                        self.counter += 1;
                        let index = Index {
                            index: self.counter,
                            low: self.counter,
                        };
                        self.visited.insert(r, index);
                        if first {
                            ctx.counters.explored += 1;
                        }
                        self.explore(ctx, sink, r)?;
                    }
                    Some(entry) => {
                        let low = entry.low;
                        self.update_parent(low);
                        self.stack.pop();
                    }
                }
                continue;
            }
            if self.stack.nframes() == 0 {
                break;
            }
            self.stack.leave();
            let Some(r) = self.stack.top() else { break };
            if let Some(entry) = self.visited.get(&r).copied() {
                if entry.index == entry.low {
                    self.pop_component(ctx, sink, r, entry.low);
                } else {
                    self.tarjan.push(r);
                    self.update_parent(entry.low);
                }
            }
            self.stack.pop();
        }
        Ok(())
    }

    fn explore<Q: Default + Send, S: ComponentSink>(
        &mut self,
        ctx: &mut WorkerContext<'_, Q>,
        sink: &S,
        v: Ref,
    ) -> Result<()> {
        self.stack.enter();
        ctx.counters.level(self.stack.nframes());
        ctx.expand(v, &mut self.succs)?;
        ctx.counters.transitions += self.succs.len() as u64;
        for i in 0..self.succs.len() {
            let s = self.succs[i].r;
            if s == v {
                ctx.counters.self_loops += 1;
                if ctx.is_accepting(v) {
                    ctx.report_cycle_untraced();
                }
                continue;
            }
            if self.done.contains(&s) || sink.is_dead(s) {
                continue;
            }
            match self.visited.get(&s).copied() {
                Some(target) => {
                    sink.unite(v, s);
                    if let Some(entry) = self.visited.get_mut(&v) {
                        entry.low = entry.low.min(target.low);
                    }
                }
                None => self.stack.push(s),
            }
        }
        Ok(())
    }

    /// Lower the lowlink of the state that opened the current frame
    fn update_parent(&mut self, low: u32) {
        let Some(parent) = self.stack.parent() else { return };
        if let Some(entry) = self.visited.get_mut(&parent) {
            if entry.low > low {
                entry.low = low;
            }
        }
    }

    fn pop_component<Q: Default + Send, S: ComponentSink>(
        &mut self,
        ctx: &mut WorkerContext<'_, Q>,
        sink: &S,
        root: Ref,
        root_low: u32,
    ) {
        let mut members = 0usize;
        let mut accepting = false;
        while let Some(&t) = self.tarjan.last() {
            match self.visited.get(&t) {
                Some(entry) if entry.low >= root_low => {}
                _ => break,
            }
            accepting = accepting || ctx.is_accepting(t);
            sink.unite(root, t);
            self.visited.remove(&t);
            self.done.insert(t);
            self.tarjan.pop();
            members += 1;
        }
        self.visited.remove(&root);
        self.done.insert(root);
        if members > 0 && (accepting || ctx.is_accepting(root)) {
            trace!(worker = ctx.id, root, size = members + 1, "Accepting component");
            ctx.report_cycle_untraced();
        }
        if sink.mark_dead(root) {
            ctx.counters.sccs += 1;
        }
    }
}

/// Swarmed Tarjan: independent searches, one per worker
pub struct Tarjan;

impl Algorithm for Tarjan {
    type Work = ();
    type Local = LocalTarjan;

    fn global_init(_shared: &Shared<'_, Self::Work>) -> Result<Self> {
        Ok(Self)
    }

    fn local_init(&self, _ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local> {
        Ok(LocalTarjan::new())
    }

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()> {
        let (init, _) = ctx.initial()?;
        local.search(ctx, &Private, init)
    }

    fn print_stats(&self, total: &Counters) {
        debug!(sccs = total.sccs, self_loops = total.self_loops, "Tarjan done");
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
        let config = config(AlgorithmKind::Tarjan, 1);
        let shared = shared::<()>(&config, graph);
        let tarjan = Tarjan::global_init(&shared).unwrap();
        let mut ctx = WorkerContext::new(0, &shared);
        let mut local = tarjan.local_init(&mut ctx).unwrap();
        tarjan.run(&mut ctx, &mut local).unwrap();
        (shared.take_finding().map(|f| f.outcome), ctx.counters)
    }

    #[test]
    fn test_component_count() {
        // {0} {1, 2, 3} {4} {5}
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 3, 1])
            .edge(3, 4)
            .edge(2, 5)
            .edge(5, 4)
            .build();
        let (outcome, counters) = check(&graph);
        assert_eq!(outcome, None);
        assert_eq!(counters.sccs, 4);
        assert_eq!(counters.explored, 6);
    }

    #[test]
    fn test_cross_edges_keep_components_apart() {
        // 2 reaches the finished component {1} only
        let graph = ExplicitGraph::builder()
            .path(&[0, 1])
            .path(&[0, 2, 1])
            .accepting(1)
            .accepting(2)
            .build();
        let (outcome, counters) = check(&graph);
        assert_eq!(outcome, None);
        assert_eq!(counters.sccs, 3);
    }

    #[test]
    fn test_accepting_component_reported() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2, 3, 1])
            .accepting(2)
            .build();
        assert_eq!(check(&graph).0, Some(Outcome::CycleFound));
    }

    #[test]
    fn test_accepting_self_loop_reported() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1])
            .edge(1, 1)
            .accepting(1)
            .build();
        let (outcome, counters) = check(&graph);
        assert_eq!(outcome, Some(Outcome::CycleFound));
        assert_eq!(counters.self_loops, 1);
    }
}
