//! Accepting cycle detection through complete runs.
//!
//! Every LTL variant is run on small hand-built automata, with one and
//! with several workers, and compared against the reference SCC oracle.

use anyhow::Result;
use mcheck::{AlgorithmKind, CheckerConfig, ExitStatus, ExplicitGraph, MemoryTraceSink, Outcome, Run};

/// Variants that produce a lasso trace for the cycle they find
const TRACED: [AlgorithmKind; 4] = [
    AlgorithmKind::Ndfs,
    AlgorithmKind::Lndfs,
    AlgorithmKind::Cndfs,
    AlgorithmKind::Endfs,
];

fn config(algorithm: AlgorithmKind, workers: usize) -> CheckerConfig {
    let mut config = CheckerConfig::development()
        .with_algorithm(algorithm)
        .with_workers(workers);
    config.store.log2_capacity = 10;
    config
}

fn outcome(graph: &ExplicitGraph, algorithm: AlgorithmKind, workers: usize) -> Result<Outcome> {
    let report = Run::new(config(algorithm, workers), graph)?.execute()?;
    Ok(report.outcome)
}

fn expected(graph: &ExplicitGraph) -> Outcome {
    if graph.has_accepting_cycle() {
        Outcome::CycleFound
    } else {
        Outcome::NoCounterExample
    }
}

/// s0 -> s1 -> s2 -> s1 with s1 accepting
fn lasso() -> ExplicitGraph {
    ExplicitGraph::builder()
        .path(&[0, 1, 2, 1])
        .accepting(1)
        .build()
}

#[test]
fn test_lasso_trace_with_two_workers() -> Result<()> {
    let graph = lasso();
    for algorithm in TRACED {
        let sink = MemoryTraceSink::new();
        let report = Run::new(config(algorithm, 2), &graph)?
            .with_trace_sink(&sink)
            .execute()?;
        assert_eq!(report.outcome, Outcome::CycleFound, "{}", algorithm);
        assert_eq!(report.exit_status(), ExitStatus::CounterExample);
        assert_eq!(report.exit_status().code(), 1);

        let trace = report.trace.expect("cycle comes with a trace");
        let prefix: Vec<Vec<i32>> = trace.prefix.iter().map(|s| s.state.clone()).collect();
        let cycle: Vec<Vec<i32>> = trace.cycle.iter().map(|s| s.state.clone()).collect();
        assert_eq!(prefix, vec![vec![0]], "{}", algorithm);
        assert_eq!(cycle, vec![vec![1], vec![2]], "{}", algorithm);
        assert_eq!(sink.traces().len(), 1, "{}", algorithm);
    }
    Ok(())
}

#[test]
fn test_lasso_found_by_every_variant() -> Result<()> {
    let graph = lasso();
    for algorithm in AlgorithmKind::LTL {
        for workers in [1, 2, 4] {
            assert_eq!(
                outcome(&graph, algorithm, workers)?,
                Outcome::CycleFound,
                "{} with {} workers",
                algorithm,
                workers
            );
        }
    }
    Ok(())
}

#[test]
fn test_self_loop_decides_the_verdict() -> Result<()> {
    let with_loop = ExplicitGraph::builder()
        .path(&[0, 1, 2])
        .edge(1, 1)
        .accepting(1)
        .build();
    let without_loop = ExplicitGraph::builder()
        .path(&[0, 1, 2])
        .accepting(1)
        .build();
    for algorithm in AlgorithmKind::LTL {
        assert_eq!(outcome(&with_loop, algorithm, 2)?, Outcome::CycleFound, "{}", algorithm);
        assert_eq!(
            outcome(&without_loop, algorithm, 2)?,
            Outcome::NoCounterExample,
            "{}",
            algorithm
        );
    }
    Ok(())
}

#[test]
fn test_one_and_many_workers_agree() -> Result<()> {
    let graphs = vec![
        // diamond of accepting states, no cycle
        ExplicitGraph::builder()
            .path(&[0, 1, 3, 4])
            .path(&[0, 2, 3])
            .accepting(1)
            .accepting(2)
            .accepting(3)
            .build(),
        // cycle without accepting states next to an accepting dead end
        ExplicitGraph::builder()
            .path(&[0, 1, 2, 0])
            .path(&[1, 3, 4])
            .accepting(3)
            .build(),
        // accepting cycle reachable only through a long detour
        ExplicitGraph::builder()
            .path(&[0, 1, 2, 3, 4, 5, 6])
            .path(&[0, 7, 6])
            .path(&[6, 8, 9, 6])
            .accepting(9)
            .build(),
        // nested cycles sharing a state
        ExplicitGraph::builder()
            .path(&[0, 1, 2, 1])
            .path(&[2, 3, 2])
            .accepting(3)
            .build(),
    ];
    for (i, graph) in graphs.iter().enumerate() {
        let want = expected(graph);
        for algorithm in AlgorithmKind::LTL {
            for workers in [1, 3] {
                assert_eq!(
                    outcome(graph, algorithm, workers)?,
                    want,
                    "graph {} with {} on {} workers",
                    i,
                    algorithm,
                    workers
                );
            }
        }
    }
    Ok(())
}

#[test]
fn test_owcty_without_accepting_states_takes_one_round() -> Result<()> {
    let graph = ExplicitGraph::builder()
        .path(&[0, 1, 2, 0])
        .path(&[2, 3])
        .build();
    let report = Run::new(config(AlgorithmKind::Owcty, 2), &graph)?.execute()?;
    assert_eq!(report.outcome, Outcome::NoCounterExample);
    assert_eq!(report.counters.rounds, 1);
    assert_eq!(report.stored_states, 4);
    assert_eq!(report.exit_status().code(), 0);
    Ok(())
}

#[test]
fn test_all_red_toggle_does_not_change_verdicts() -> Result<()> {
    let graph = ExplicitGraph::builder()
        .path(&[0, 1, 2, 3])
        .path(&[1, 3])
        .path(&[3, 4, 3])
        .accepting(2)
        .accepting(4)
        .build();
    for algorithm in TRACED {
        for all_red in [true, false] {
            let mut config = config(algorithm, 2);
            config.ltl.all_red = all_red;
            let report = Run::new(config, &graph)?.execute()?;
            assert_eq!(report.outcome, Outcome::CycleFound, "{} all_red={}", algorithm, all_red);
        }
    }
    Ok(())
}
