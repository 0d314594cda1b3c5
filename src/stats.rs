//! Per-worker counters and the statistics sink.

use crate::core::config::AlgorithmKind;
use crate::run::RunReport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Work counters kept by every worker and combined after a run.
///
/// Sums for everything except `level_max` and `rounds`, which take the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub explored: u64,
    pub transitions: u64,
    pub level_max: u64,
    pub accepting: u64,
    pub allred: u64,
    pub waits: u64,
    pub red_explored: u64,
    pub red_transitions: u64,
    pub bogus_red: u64,
    pub deadlocks: u64,
    pub violations: u64,
    pub errors: u64,
    pub rounds: u64,
    pub sccs: u64,
    pub self_loops: u64,
}

impl Counters {
    pub fn merge(&mut self, other: &Counters) {
        self.explored += other.explored;
        self.transitions += other.transitions;
        self.level_max = self.level_max.max(other.level_max);
        self.accepting += other.accepting;
        self.allred += other.allred;
        self.waits += other.waits;
        self.red_explored += other.red_explored;
        self.red_transitions += other.red_transitions;
        self.bogus_red += other.bogus_red;
        self.deadlocks += other.deadlocks;
        self.violations += other.violations;
        self.errors += other.errors;
        self.rounds = self.rounds.max(other.rounds);
        self.sccs += other.sccs;
        self.self_loops += other.self_loops;
    }

    pub fn reduce<'a, I: IntoIterator<Item = &'a Counters>>(all: I) -> Counters {
        all.into_iter().fold(Counters::default(), |mut acc, c| {
            acc.merge(c);
            acc
        })
    }

    #[inline]
    pub fn level(&mut self, depth: usize) {
        self.level_max = self.level_max.max(depth as u64);
    }
}

/// Summary of a run that ended in a fatal error
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub algorithm: AlgorithmKind,
    pub workers: usize,
    pub category: &'static str,
    pub error: String,
    pub counters: Counters,
    pub stored_states: usize,
    pub elapsed: Duration,
}

/// Receives the report of a finished run
pub trait StatsSink: Send + Sync {
    fn report(&self, report: &RunReport);

    /// Called instead of [`StatsSink::report`] when the run failed.
    /// Logs the summary unless overridden.
    fn report_failure(&self, failure: &FailureReport) {
        LogStatsSink.report_failure(failure);
    }
}

/// Writes the summary through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn report(&self, report: &RunReport) {
        let c = &report.counters;
        info!(
            algorithm = %report.algorithm,
            workers = report.workers,
            outcome = ?report.outcome,
            states = report.stored_states,
            explored = c.explored,
            transitions = c.transitions,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run finished"
        );
        if report.algorithm.is_ltl() {
            info!(
                accepting = c.accepting,
                red = c.red_explored,
                red_transitions = c.red_transitions,
                allred = c.allred,
                waits = c.waits,
                bogus_red = c.bogus_red,
                rounds = c.rounds,
                sccs = c.sccs,
                self_loops = c.self_loops,
                "Cycle search statistics"
            );
        } else {
            info!(
                levels = c.level_max,
                deadlocks = c.deadlocks,
                violations = c.violations,
                errors = c.errors,
                "Reachability statistics"
            );
        }
    }

    fn report_failure(&self, failure: &FailureReport) {
        error!(
            algorithm = %failure.algorithm,
            workers = failure.workers,
            category = failure.category,
            error = %failure.error,
            states = failure.stored_states,
            explored = failure.counters.explored,
            transitions = failure.counters.transitions,
            elapsed_ms = failure.elapsed.as_millis() as u64,
            "Run failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reduce_sums_and_maxes() {
        let a = Counters {
            explored: 3,
            transitions: 5,
            level_max: 7,
            rounds: 2,
            ..Default::default()
        };
        let b = Counters {
            explored: 4,
            transitions: 1,
            level_max: 2,
            rounds: 3,
            waits: 1,
            ..Default::default()
        };
        let total = Counters::reduce([&a, &b]);
        assert_eq!(total.explored, 7);
        assert_eq!(total.transitions, 6);
        assert_eq!(total.level_max, 7);
        assert_eq!(total.rounds, 3);
        assert_eq!(total.waits, 1);
        assert_eq!(Counters::reduce([&b, &a]), total);
    }
}
