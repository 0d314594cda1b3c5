//! The algorithm family and the per-worker plumbing they share.
//!
//! Every strategy implements [`Algorithm`]. A [`crate::run::Run`] creates the
//! shared structures once, calls `global_init`, then drives `local_init`,
//! `run`, `reduce_stats` and `local_deinit` on every worker thread.

pub mod cndfs;
pub mod lndfs;
pub mod ndfs;
pub mod owcty;
pub mod reach;
pub mod renault;
pub mod tarjan;
pub mod ufscc;
pub mod unionfind;

use crate::balance::LoadBalancer;
use crate::color::GlobalColors;
use crate::core::config::{CheckerConfig, Permutation};
use crate::core::errors::{CheckError, Result};
use crate::oracle::NextState;
use crate::run::Outcome;
use crate::stats::Counters;
use crate::store::{Ref, StateStore};
use crate::trace::{Trace, TraceSink};
use parking_lot::Mutex;
use tracing::{error, warn};

/// Low bits of a reduction value that carry the stop flags
const STOP_BITS: u32 = 8;

/// Pack a count and the local stop flag into one reduction value
fn pack(value: usize, stopped: bool) -> u64 {
    ((value as u64) << STOP_BITS) | stopped as u64
}

fn unpack(total: u64) -> (u64, bool) {
    (total >> STOP_BITS, total & ((1 << STOP_BITS) - 1) != 0)
}

/// Lifecycle shared by all exploration strategies.
///
/// `run` executes on every worker concurrently. Implementations that
/// synchronize workers mid-run (barriers, reductions) must keep taking part
/// in every synchronization point after a failure; they report errors with
/// [`WorkerContext::fail`] instead of returning early.
pub trait Algorithm: Sized + Sync {
    /// Work container exchanged by the load balancer
    type Work: Default + Send;
    type Local;

    fn global_init(shared: &Shared<'_, Self::Work>) -> Result<Self>;

    fn local_init(&self, ctx: &mut WorkerContext<'_, Self::Work>) -> Result<Self::Local>;

    fn run(&self, ctx: &mut WorkerContext<'_, Self::Work>, local: &mut Self::Local) -> Result<()>;

    fn reduce_stats(&self, ctx: &WorkerContext<'_, Self::Work>, _local: &Self::Local) -> Counters {
        ctx.counters
    }

    fn print_stats(&self, _total: &Counters) {}

    fn local_deinit(&self, _ctx: &mut WorkerContext<'_, Self::Work>, _local: Self::Local) {}

    fn global_deinit(self) {}
}

/// A verification result recorded during the run
#[derive(Debug, Clone)]
pub struct Finding {
    pub outcome: Outcome,
    pub worker: usize,
    pub trace: Option<Trace>,
}

/// State shared by all workers of one run
pub struct Shared<'r, Q> {
    pub config: &'r CheckerConfig,
    pub oracle: &'r dyn NextState,
    pub store: StateStore,
    pub lb: LoadBalancer<Q>,
    trace_sink: Option<&'r dyn TraceSink>,
    finding: Mutex<Option<Finding>>,
    failure: Mutex<Option<CheckError>>,
}

impl<'r, Q: Default + Send> Shared<'r, Q> {
    pub fn new(
        config: &'r CheckerConfig,
        oracle: &'r dyn NextState,
        store: StateStore,
        lb: LoadBalancer<Q>,
        trace_sink: Option<&'r dyn TraceSink>,
    ) -> Self {
        Self {
            config,
            oracle,
            store,
            lb,
            trace_sink,
            finding: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn is_stopped(&self) -> bool {
        self.lb.is_stopped()
    }

    /// Record a finding. Returns `true` for the first one, whose finder
    /// is expected to attach the trace.
    pub fn report(&self, worker: usize, outcome: Outcome) -> bool {
        let first = {
            let mut slot = self.finding.lock();
            let first = slot.is_none();
            if first {
                *slot = Some(Finding {
                    outcome,
                    worker,
                    trace: None,
                });
            }
            first
        };
        if outcome == Outcome::CycleFound || !self.config.checks.no_exit {
            self.lb.stop();
        }
        first
    }

    pub fn attach_trace(&self, trace: Trace) -> Result<()> {
        if let Some(sink) = self.trace_sink {
            sink.write(&trace)?;
        }
        if let Some(finding) = self.finding.lock().as_mut() {
            finding.trace = Some(trace);
        }
        Ok(())
    }

    /// Keep the first fatal error and stop every worker
    pub fn fail(&self, worker: usize, err: CheckError) {
        let err = err.on_worker(worker);
        error!(worker, category = err.category(), error = %err, "Worker failed");
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.lb.stop();
    }

    pub fn take_failure(&self) -> Option<CheckError> {
        self.failure.lock().take()
    }

    pub fn take_finding(&self) -> Option<Finding> {
        self.finding.lock().take()
    }
}

/// One successor produced by [`WorkerContext::expand`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Successor {
    pub r: Ref,
    pub label: Option<u32>,
    /// This worker's insertion created the state
    pub is_new: bool,
}

/// Per-thread view of a run: id, counters, scratch buffers and the
/// successor permutation.
pub struct WorkerContext<'s, Q> {
    pub id: usize,
    pub shared: &'s Shared<'s, Q>,
    pub counters: Counters,
    permutation: Permutation,
    rng: fastrand::Rng,
    state: Vec<i32>,
    labels: Vec<Option<u32>>,
    data: Vec<i32>,
}

impl<'s, Q: Default + Send> WorkerContext<'s, Q> {
    pub fn new(id: usize, shared: &'s Shared<'s, Q>) -> Self {
        let seed = shared.config.store.seed ^ (id as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            id,
            shared,
            counters: Counters::default(),
            permutation: shared.config.permutation,
            rng: fastrand::Rng::with_seed(seed),
            state: vec![0; shared.store.width()],
            labels: Vec::new(),
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn store(&self) -> &'s StateStore {
        &self.shared.store
    }

    #[inline]
    pub fn lb(&self) -> &'s LoadBalancer<Q> {
        &self.shared.lb
    }

    #[inline]
    pub fn colors(&self) -> GlobalColors<'s> {
        GlobalColors::new(&self.shared.store)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.shared.lb.is_stopped()
    }

    pub fn config(&self) -> &'s CheckerConfig {
        self.shared.config
    }

    /// Insert the initial state
    pub fn initial(&mut self) -> Result<(Ref, bool)> {
        let state = self.shared.oracle.initial_state();
        self.shared.store.insert_or_find(&state)
    }

    /// Generate, store and permute the successors of `r` into `out`
    pub fn expand(&mut self, r: Ref, out: &mut Vec<Successor>) -> Result<()> {
        let store = &self.shared.store;
        store.get_into(r, &mut self.state);
        self.labels.clear();
        self.data.clear();
        let labels = &mut self.labels;
        let data = &mut self.data;
        self.shared.oracle.successors(&self.state, &mut |label, dst| {
            labels.push(label);
            data.extend_from_slice(dst);
        })?;

        let width = store.width();
        if self.data.len() != self.labels.len() * width {
            return Err(CheckError::oracle(
                &self.state,
                format!("successor vectors must have {} slots", width),
            ));
        }
        out.clear();
        for (label, dst) in self.labels.iter().zip(self.data.chunks_exact(width)) {
            let (succ, is_new) = store.insert_or_find(dst)?;
            out.push(Successor {
                r: succ,
                label: *label,
                is_new,
            });
        }
        self.permute(out);
        Ok(())
    }

    fn permute(&mut self, out: &mut [Successor]) {
        match self.permutation {
            Permutation::None => {}
            Permutation::Shift => {
                if !out.is_empty() {
                    let by = self.id % out.len();
                    out.rotate_left(by);
                }
            }
            Permutation::Random => self.rng.shuffle(out),
        }
    }

    pub fn is_accepting(&mut self, r: Ref) -> bool {
        self.shared.store.get_into(r, &mut self.state);
        self.shared.oracle.is_accepting(&self.state)
    }

    pub fn invariant_holds(&mut self, r: Ref) -> bool {
        self.shared.store.get_into(r, &mut self.state);
        self.shared.oracle.invariant_holds(&self.state)
    }

    pub fn is_valid_end(&mut self, r: Ref) -> bool {
        self.shared.store.get_into(r, &mut self.state);
        self.shared.oracle.is_valid_end(&self.state)
    }

    pub fn fail(&self, err: CheckError) {
        self.shared.fail(self.id, err);
    }

    /// Sum `value` over all workers. The flag is set when any worker saw
    /// the run stopped, so every worker takes the same branch afterwards.
    /// A poisoned balancer reads as stopped with nothing contributed.
    pub fn reduce(&self, value: usize) -> (u64, bool) {
        match self.shared.lb.reduce(pack(value, self.is_stopped())) {
            Some(total) => unpack(total),
            None => (0, true),
        }
    }

    /// Report an accepting cycle closed by `closing` on top of `path`.
    /// Only the first finder builds the trace.
    pub fn report_cycle<I: IntoIterator<Item = Ref>>(&self, path: I, closing: Ref) -> Result<()> {
        if !self.shared.report(self.id, Outcome::CycleFound) {
            return Ok(());
        }
        let path: Vec<Ref> = path.into_iter().collect();
        warn!(worker = self.id, depth = path.len() + 1, "Accepting cycle found");
        let trace = Trace::from_refs(&self.shared.store, self.shared.oracle, &path, Some(closing))?;
        self.shared.attach_trace(trace)
    }

    /// Report an accepting cycle without a witness
    pub fn report_cycle_untraced(&self) {
        if self.shared.report(self.id, Outcome::CycleFound) {
            warn!(worker = self.id, "Accepting cycle found");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::core::config::AlgorithmKind;
    use crate::oracle::ExplicitGraph;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pack_round_trip() {
        assert_eq!(unpack(pack(12, true) + pack(30, false)), (42, true));
        assert_eq!(unpack(pack(0, false) + pack(0, false)), (0, false));
    }

    #[test]
    fn test_expand_shift_rotates_by_worker() {
        let graph = ExplicitGraph::builder()
            .edge(0, 1)
            .edge(0, 2)
            .edge(0, 3)
            .build();
        let config = config(AlgorithmKind::Dfs, 2);
        let shared = shared::<()>(&config, &graph);
        let mut succs = Vec::new();

        let mut ctx0 = WorkerContext::new(0, &shared);
        let (init, new) = ctx0.initial().unwrap();
        assert!(new);
        ctx0.expand(init, &mut succs).unwrap();
        let order0: Vec<_> = succs.iter().map(|s| shared.store.get(s.r)[0]).collect();
        assert_eq!(order0, vec![1, 2, 3]);
        assert!(succs.iter().all(|s| s.is_new));

        let mut ctx1 = WorkerContext::new(1, &shared);
        ctx1.expand(init, &mut succs).unwrap();
        let order1: Vec<_> = succs.iter().map(|s| shared.store.get(s.r)[0]).collect();
        assert_eq!(order1, vec![2, 3, 1]);
        assert!(succs.iter().all(|s| !s.is_new));
    }

    #[test]
    fn test_first_finding_wins_and_stops() {
        let graph = ExplicitGraph::builder().edge(0, 1).build();
        let config = config(AlgorithmKind::Bfs, 2);
        let shared = shared::<()>(&config, &graph);
        assert!(shared.report(1, Outcome::Deadlock));
        assert!(!shared.report(0, Outcome::InvariantViolation));
        assert!(shared.is_stopped());
        let finding = shared.take_finding().unwrap();
        assert_eq!(finding.outcome, Outcome::Deadlock);
        assert_eq!(finding.worker, 1);
    }

    #[test]
    fn test_oracle_failure_surfaces() {
        let graph = ExplicitGraph::builder().edge(0, 1).failing(0).build();
        let config = config(AlgorithmKind::Dfs, 1);
        let shared = shared::<()>(&config, &graph);
        let mut ctx = WorkerContext::new(0, &shared);
        let (init, _) = ctx.initial().unwrap();
        let err = ctx.expand(init, &mut Vec::new()).unwrap_err();
        ctx.fail(err);
        assert!(shared.is_stopped());
        assert_eq!(shared.take_failure().unwrap().category(), "oracle");
    }
}
