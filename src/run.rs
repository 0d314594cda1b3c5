//! Worker and run orchestration.
//!
//! A [`Run`] builds the shared structures for the configured algorithm,
//! starts one named OS thread per worker and drives every worker through
//! `local_init`, `run`, `reduce_stats` and `local_deinit`. A watchdog
//! thread turns a [`CancelHandle`] signal or the configured timeout into
//! a balancer stop.

use crate::algorithm::cndfs::Cndfs;
use crate::algorithm::lndfs::Lndfs;
use crate::algorithm::ndfs::Ndfs;
use crate::algorithm::owcty::Owcty;
use crate::algorithm::reach::Reach;
use crate::algorithm::renault::Renault;
use crate::algorithm::tarjan::Tarjan;
use crate::algorithm::ufscc::Ufscc;
use crate::algorithm::{Algorithm, Shared, WorkerContext};
use crate::balance::LoadBalancer;
use crate::core::config::{AlgorithmKind, CheckerConfig};
use crate::core::errors::{CheckError, Result};
use crate::oracle::NextState;
use crate::stats::{Counters, FailureReport, LogStatsSink, StatsSink};
use crate::store::{SatLayout, StateStore};
use crate::trace::{Trace, TraceSink};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Verdict of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// The whole state space was searched without a finding
    NoCounterExample,
    CycleFound,
    Deadlock,
    InvariantViolation,
    ErrorAction,
    /// Stopped before the state space was exhausted
    Cancelled,
}

impl Outcome {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Outcome::NoCounterExample => ExitStatus::Success,
            Outcome::CycleFound
            | Outcome::Deadlock
            | Outcome::InvariantViolation
            | Outcome::ErrorAction => ExitStatus::CounterExample,
            Outcome::Cancelled => ExitStatus::Unsound,
        }
    }
}

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    CounterExample = 1,
    /// The search was incomplete
    Unsound = 2,
    Failure = 255,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_result(result: &Result<RunReport>) -> Self {
        match result {
            Ok(report) => report.outcome.exit_status(),
            Err(_) => ExitStatus::Failure,
        }
    }
}

/// Everything a finished run reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub algorithm: AlgorithmKind,
    pub workers: usize,
    pub outcome: Outcome,
    pub counters: Counters,
    pub stored_states: usize,
    pub elapsed: Duration,
    pub trace: Option<Trace>,
}

impl RunReport {
    pub fn exit_status(&self) -> ExitStatus {
        self.outcome.exit_status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Cancel,
    Finished,
}

/// Stops a run from another thread
#[derive(Debug, Clone)]
pub struct CancelHandle {
    signals: Sender<Signal>,
}

impl CancelHandle {
    /// Ask the run to stop. Workers notice at their next stop check.
    pub fn cancel(&self) {
        let _ = self.signals.send(Signal::Cancel);
    }
}

/// One model checking run over a next-state oracle
pub struct Run<'a> {
    config: CheckerConfig,
    oracle: &'a dyn NextState,
    trace_sink: Option<&'a dyn TraceSink>,
    stats_sink: Option<&'a dyn StatsSink>,
    signals: (Sender<Signal>, Receiver<Signal>),
}

impl<'a> Run<'a> {
    pub fn new(config: CheckerConfig, oracle: &'a dyn NextState) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            oracle,
            trace_sink: None,
            stats_sink: None,
            signals: channel::unbounded(),
        })
    }

    pub fn with_trace_sink(mut self, sink: &'a dyn TraceSink) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn with_stats_sink(mut self, sink: &'a dyn StatsSink) -> Self {
        self.stats_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            signals: self.signals.0.clone(),
        }
    }

    /// Run the configured algorithm to completion.
    ///
    /// Findings are reported in the [`RunReport`]; an `Err` means a fatal
    /// condition on some worker, and is the first one raised.
    pub fn execute(self) -> Result<RunReport> {
        match self.config.algorithm {
            AlgorithmKind::Bfs | AlgorithmKind::Dfs | AlgorithmKind::Sbfs | AlgorithmKind::Pbfs => {
                self.drive::<Reach>()
            }
            AlgorithmKind::Ndfs => self.drive::<Ndfs>(),
            AlgorithmKind::Lndfs => self.drive::<Lndfs>(),
            AlgorithmKind::Cndfs | AlgorithmKind::Endfs => self.drive::<Cndfs>(),
            AlgorithmKind::Owcty => self.drive::<Owcty>(),
            AlgorithmKind::Ufscc => self.drive::<Ufscc>(),
            AlgorithmKind::Renault => self.drive::<Renault>(),
            AlgorithmKind::Tarjan => self.drive::<Tarjan>(),
        }
    }

    fn drive<A: Algorithm>(&self) -> Result<RunReport> {
        let config = &self.config;
        let workers = config.workers;
        let started = Instant::now();

        let layout = SatLayout::new(config.algorithm.wip_bits(workers))?;
        let store = StateStore::new(self.oracle.state_len(), &config.store, layout)?;
        let lb = LoadBalancer::<A::Work>::new(workers, &config.balancer)?;
        let shared = Shared::new(config, self.oracle, store, lb, self.trace_sink);
        let algorithm = A::global_init(&shared)?;
        info!(
            algorithm = %config.algorithm,
            workers,
            capacity = shared.store.capacity(),
            "Starting run"
        );

        let (per_worker, spawn_error) = match self.spawn_workers(&algorithm, &shared) {
            Ok(per_worker) => (per_worker, None),
            Err(err) => (Vec::new(), Some(err)),
        };

        let counters = Counters::reduce(&per_worker);
        algorithm.print_stats(&counters);
        algorithm.global_deinit();
        debug!(
            max_load = shared.lb.max_load(),
            handoffs = shared.lb.handoffs(),
            "Load balancer totals"
        );
        if let Some(err) = spawn_error.or_else(|| shared.take_failure()) {
            let failure = FailureReport {
                algorithm: config.algorithm,
                workers,
                category: err.category(),
                error: err.to_string(),
                counters,
                stored_states: shared.store.len(),
                elapsed: started.elapsed(),
            };
            match self.stats_sink {
                Some(sink) => sink.report_failure(&failure),
                None => LogStatsSink.report_failure(&failure),
            }
            return Err(err);
        }

        let (outcome, trace) = match shared.take_finding() {
            Some(finding) => (finding.outcome, finding.trace),
            None if shared.is_stopped() => (Outcome::Cancelled, None),
            None => (Outcome::NoCounterExample, None),
        };
        let report = RunReport {
            algorithm: config.algorithm,
            workers,
            outcome,
            counters,
            stored_states: shared.store.len(),
            elapsed: started.elapsed(),
            trace,
        };
        match self.stats_sink {
            Some(sink) => sink.report(&report),
            None => LogStatsSink.report(&report),
        }
        Ok(report)
    }

    /// Start the workers behind a gate so none begins before all exist
    fn spawn_workers<A: Algorithm>(
        &self,
        algorithm: &A,
        shared: &Shared<'_, A::Work>,
    ) -> Result<Vec<Counters>> {
        let gate = RwLock::new(());
        let aborted = AtomicBool::new(false);
        let signals = &self.signals.1;
        let timeout = self.config.timeout;

        thread::scope(|scope| {
            scope.spawn(|| watchdog(shared, signals, timeout));

            let hold = gate.write();
            let mut handles = Vec::with_capacity(shared.workers());
            let mut spawn_error = None;
            for id in 0..shared.workers() {
                let (gate, aborted) = (&gate, &aborted);
                let spawned = thread::Builder::new()
                    .name(format!("mcheck-worker-{}", id))
                    .spawn_scoped(scope, move || {
                        drop(gate.read());
                        if aborted.load(Ordering::Acquire) {
                            return Counters::default();
                        }
                        let span = info_span!("worker", id);
                        let _enter = span.enter();
                        guarded_worker(algorithm, shared, id)
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        spawn_error = Some(CheckError::io("spawn worker thread", err));
                        aborted.store(true, Ordering::Release);
                        break;
                    }
                }
            }
            drop(hold);

            let mut per_worker = Vec::with_capacity(handles.len());
            for (id, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(counters) => per_worker.push(counters),
                    Err(_) => {
                        shared.fail(id, CheckError::internal("worker thread panicked"));
                        shared.lb.poison();
                    }
                }
            }
            let _ = self.signals.0.send(Signal::Finished);
            match spawn_error {
                Some(err) => Err(err),
                None => Ok(per_worker),
            }
        })
    }
}

/// Run [`worker`], turning a panic into a run failure. The balancer is
/// poisoned so the surviving workers leave their barriers.
fn guarded_worker<A: Algorithm>(algorithm: &A, shared: &Shared<'_, A::Work>, id: usize) -> Counters {
    match panic::catch_unwind(AssertUnwindSafe(|| worker(algorithm, shared, id))) {
        Ok(counters) => counters,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|m| m.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            shared.fail(id, CheckError::internal(format!("worker panicked: {}", message)));
            shared.lb.poison();
            Counters::default()
        }
    }
}

/// Body of one worker thread
fn worker<A: Algorithm>(algorithm: &A, shared: &Shared<'_, A::Work>, id: usize) -> Counters {
    let mut ctx = WorkerContext::new(id, shared);
    let local = match algorithm.local_init(&mut ctx) {
        Ok(local) => Some(local),
        Err(err) => {
            ctx.fail(err);
            None
        }
    };
    // doubles as the start barrier; every worker sees the same verdict
    let (failed, _) = ctx.reduce(local.is_none() as usize);
    let mut local = match local {
        Some(local) if failed == 0 && !shared.lb.is_poisoned() => local,
        Some(local) => {
            algorithm.local_deinit(&mut ctx, local);
            return ctx.counters;
        }
        None => return ctx.counters,
    };

    debug!("Worker started");
    if let Err(err) = algorithm.run(&mut ctx, &mut local) {
        ctx.fail(err);
    }
    shared.lb.barrier();

    let counters = algorithm.reduce_stats(&ctx, &local);
    algorithm.local_deinit(&mut ctx, local);
    debug!(explored = counters.explored, "Worker finished");
    counters
}

/// Stop the balancer on cancellation or when the deadline passes
fn watchdog<Q: Default + Send>(
    shared: &Shared<'_, Q>,
    signals: &Receiver<Signal>,
    timeout: Option<Duration>,
) {
    let mut deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let signal = match deadline {
            Some(at) => signals.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => signals.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match signal {
            Ok(Signal::Finished) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(Signal::Cancel) => {
                info!("Run cancelled");
                shared.lb.stop();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.map(|t| t.as_millis() as u64), "Run timed out");
                shared.lb.stop();
                deadline = None;
            }
        }
    }
}
