//! Next-state oracle interface and an explicit graph model.
//!
//! The checker never interprets state vectors itself. Everything it knows
//! about a state comes from a [`NextState`] implementation: the initial
//! vector, the labelled successors and the side predicates.

use crate::core::errors::{CheckError, Result};
use dashmap::DashMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use std::collections::{BTreeMap, BTreeSet};

/// Receives `(label, destination)` for every successor of a state
pub type SuccessorFn<'a> = dyn FnMut(Option<u32>, &[i32]) + 'a;

/// Deterministic successor generator for a transition system.
///
/// Implementations are shared by all workers and may be called
/// concurrently on different vectors.
pub trait NextState: Send + Sync {
    /// Number of integers in every state vector
    fn state_len(&self) -> usize;

    fn initial_state(&self) -> Vec<i32>;

    /// Feed every successor of `state` to `emit`; returns the successor count
    fn successors(&self, state: &[i32], emit: &mut SuccessorFn<'_>) -> Result<usize>;

    fn is_accepting(&self, _state: &[i32]) -> bool {
        false
    }

    fn invariant_holds(&self, _state: &[i32]) -> bool {
        true
    }

    /// States without successors that are not deadlocks
    fn is_valid_end(&self, _state: &[i32]) -> bool {
        false
    }
}

/// Hand-built automaton with one integer per state (the node number).
///
/// Used by the tests; also handy for small experiments. Expansion counts
/// are recorded per node so tests can observe how often a state was
/// generated.
#[derive(Debug)]
pub struct ExplicitGraph {
    initial: usize,
    edges: Vec<Vec<(usize, Option<u32>)>>,
    accepting: BTreeSet<usize>,
    invalid: BTreeSet<usize>,
    valid_end: BTreeSet<usize>,
    failing: BTreeSet<usize>,
    expansions: DashMap<usize, usize>,
}

impl ExplicitGraph {
    pub fn builder() -> ExplicitGraphBuilder {
        ExplicitGraphBuilder::default()
    }

    pub fn node_count(&self) -> usize {
        self.edges.len()
    }

    pub fn state_of(node: usize) -> Vec<i32> {
        vec![node as i32]
    }

    /// Times `successors` was asked for `node`
    pub fn expansions(&self, node: usize) -> usize {
        self.expansions.get(&node).map(|c| *c).unwrap_or(0)
    }

    pub fn total_expansions(&self) -> usize {
        self.expansions.iter().map(|e| *e.value()).sum()
    }

    fn node(&self, state: &[i32]) -> Result<usize> {
        match state {
            [n] if *n >= 0 && (*n as usize) < self.edges.len() => Ok(*n as usize),
            _ => Err(CheckError::oracle(state, "not a node of the graph")),
        }
    }

    fn graph(&self) -> DiGraph<usize, Option<u32>> {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.edges.len()).map(|n| graph.add_node(n)).collect();
        for (src, out) in self.edges.iter().enumerate() {
            for (dst, label) in out {
                graph.add_edge(nodes[src], nodes[*dst], *label);
            }
        }
        graph
    }

    /// Nodes reachable from the initial node
    pub fn reachable(&self) -> BTreeSet<usize> {
        let graph = self.graph();
        let mut bfs = Bfs::new(&graph, NodeIndex::new(self.initial));
        let mut seen = BTreeSet::new();
        while let Some(ix) = bfs.next(&graph) {
            seen.insert(graph[ix]);
        }
        seen
    }

    /// Whether an accepting state on a cycle is reachable, decided with
    /// petgraph's Tarjan SCC decomposition.
    pub fn has_accepting_cycle(&self) -> bool {
        let graph = self.graph();
        let reachable = self.reachable();
        tarjan_scc(&graph).into_iter().any(|scc| {
            let cyclic = scc.len() > 1
                || graph
                    .edges(scc[0])
                    .any(|e| e.target() == scc[0]);
            cyclic
                && scc.iter().any(|ix| {
                    let n = graph[*ix];
                    reachable.contains(&n) && self.accepting.contains(&n)
                })
        })
    }

    /// Reachable nodes without successors that are not valid end states
    pub fn deadlocks(&self) -> BTreeSet<usize> {
        self.reachable()
            .into_iter()
            .filter(|n| self.edges[*n].is_empty() && !self.valid_end.contains(n))
            .collect()
    }
}

impl NextState for ExplicitGraph {
    fn state_len(&self) -> usize {
        1
    }

    fn initial_state(&self) -> Vec<i32> {
        Self::state_of(self.initial)
    }

    fn successors(&self, state: &[i32], emit: &mut SuccessorFn<'_>) -> Result<usize> {
        let node = self.node(state)?;
        if self.failing.contains(&node) {
            return Err(CheckError::oracle(state, "injected failure"));
        }
        *self.expansions.entry(node).or_insert(0) += 1;
        let mut buf = [0i32; 1];
        for (dst, label) in &self.edges[node] {
            buf[0] = *dst as i32;
            emit(*label, &buf);
        }
        Ok(self.edges[node].len())
    }

    fn is_accepting(&self, state: &[i32]) -> bool {
        self.node(state)
            .map(|n| self.accepting.contains(&n))
            .unwrap_or(false)
    }

    fn invariant_holds(&self, state: &[i32]) -> bool {
        self.node(state)
            .map(|n| !self.invalid.contains(&n))
            .unwrap_or(true)
    }

    fn is_valid_end(&self, state: &[i32]) -> bool {
        self.node(state)
            .map(|n| self.valid_end.contains(&n))
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
pub struct ExplicitGraphBuilder {
    initial: usize,
    edges: BTreeMap<usize, Vec<(usize, Option<u32>)>>,
    nodes: usize,
    accepting: BTreeSet<usize>,
    invalid: BTreeSet<usize>,
    valid_end: BTreeSet<usize>,
    failing: BTreeSet<usize>,
}

impl ExplicitGraphBuilder {
    fn touch(&mut self, node: usize) {
        self.nodes = self.nodes.max(node + 1);
    }

    pub fn initial(mut self, node: usize) -> Self {
        self.touch(node);
        self.initial = node;
        self
    }

    pub fn edge(self, src: usize, dst: usize) -> Self {
        self.add_edge(src, dst, None)
    }

    pub fn labelled_edge(self, src: usize, dst: usize, label: u32) -> Self {
        self.add_edge(src, dst, Some(label))
    }

    fn add_edge(mut self, src: usize, dst: usize, label: Option<u32>) -> Self {
        self.touch(src);
        self.touch(dst);
        self.edges.entry(src).or_default().push((dst, label));
        self
    }

    pub fn path(mut self, nodes: &[usize]) -> Self {
        for pair in nodes.windows(2) {
            self = self.edge(pair[0], pair[1]);
        }
        self
    }

    pub fn accepting(mut self, node: usize) -> Self {
        self.touch(node);
        self.accepting.insert(node);
        self
    }

    pub fn invalid(mut self, node: usize) -> Self {
        self.touch(node);
        self.invalid.insert(node);
        self
    }

    pub fn valid_end(mut self, node: usize) -> Self {
        self.touch(node);
        self.valid_end.insert(node);
        self
    }

    /// Make the oracle fail when asked for the successors of `node`
    pub fn failing(mut self, node: usize) -> Self {
        self.touch(node);
        self.failing.insert(node);
        self
    }

    pub fn build(mut self) -> ExplicitGraph {
        self.touch(self.initial);
        let mut edges = vec![Vec::new(); self.nodes];
        for (src, out) in self.edges {
            edges[src] = out;
        }
        ExplicitGraph {
            initial: self.initial,
            edges,
            accepting: self.accepting,
            invalid: self.invalid,
            valid_end: self.valid_end,
            failing: self.failing,
            expansions: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lasso() -> ExplicitGraph {
        ExplicitGraph::builder()
            .path(&[0, 1, 2, 1])
            .accepting(1)
            .build()
    }

    #[test]
    fn test_successors_in_insertion_order() {
        let graph = ExplicitGraph::builder()
            .labelled_edge(0, 2, 7)
            .edge(0, 1)
            .build();
        let mut seen = Vec::new();
        let n = graph
            .successors(&[0], &mut |label, dst| seen.push((label, dst[0])))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen, vec![(Some(7), 2), (None, 1)]);
        assert_eq!(graph.expansions(0), 1);
    }

    #[test]
    fn test_reference_cycle_detection() {
        assert!(lasso().has_accepting_cycle());
        let acyclic = ExplicitGraph::builder().path(&[0, 1, 2]).accepting(1).build();
        assert!(!acyclic.has_accepting_cycle());
        let self_loop = ExplicitGraph::builder().path(&[0, 1, 1]).accepting(1).build();
        assert!(self_loop.has_accepting_cycle());
        let unreachable = ExplicitGraph::builder()
            .edge(0, 1)
            .path(&[2, 3, 2])
            .accepting(3)
            .build();
        assert!(!unreachable.has_accepting_cycle());
    }

    #[test]
    fn test_predicates_and_failures() {
        let graph = ExplicitGraph::builder()
            .path(&[0, 1, 2])
            .edge(0, 3)
            .invalid(1)
            .valid_end(2)
            .failing(3)
            .build();
        assert!(!graph.invariant_holds(&[1]));
        assert!(graph.is_valid_end(&[2]));
        assert!(graph.deadlocks().contains(&3));
        assert!(!graph.deadlocks().contains(&2));
        let err = graph.successors(&[3], &mut |_, _| {}).unwrap_err();
        assert_eq!(err.category(), "oracle");
        assert!(graph.successors(&[9], &mut |_, _| {}).is_err());
    }
}
