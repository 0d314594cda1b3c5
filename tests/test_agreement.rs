//! Random small automata: every LTL variant must agree with the reference
//! SCC decomposition on whether an accepting cycle is reachable. Random
//! vectors exercise the state store's canonicalization.

use mcheck::core::config::{HashKind, StoreConfig};
use mcheck::store::SatLayout;
use mcheck::{AlgorithmKind, CheckerConfig, ExplicitGraph, Outcome, Permutation, Ref, Run, StateStore};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::thread;

const WIDTH: usize = 3;

fn store(hash: HashKind) -> StateStore {
    let config = StoreConfig {
        log2_capacity: 10,
        hash,
        seed: 7,
    };
    StateStore::new(WIDTH, &config, SatLayout::default()).unwrap()
}

fn vectors_strategy() -> impl Strategy<Value = Vec<Vec<i32>>> {
    // small value range so duplicates are common
    prop::collection::vec(prop::collection::vec(-3i32..4, WIDTH), 1..200)
}

fn hash_strategy() -> impl Strategy<Value = HashKind> {
    prop_oneof![Just(HashKind::Xxh3), Just(HashKind::Fx)]
}

fn graph_strategy() -> impl Strategy<Value = ExplicitGraph> {
    (2usize..9).prop_flat_map(|nodes| {
        (
            prop::collection::vec((0..nodes, 0..nodes), 0..nodes * 2),
            prop::collection::vec(any::<bool>(), nodes),
        )
            .prop_map(|(edges, accepting)| {
                let mut builder = ExplicitGraph::builder();
                for (src, dst) in edges {
                    builder = builder.edge(src, dst);
                }
                for (node, acc) in accepting.into_iter().enumerate() {
                    if acc {
                        builder = builder.accepting(node);
                    }
                }
                builder.build()
            })
    })
}

fn verdict(graph: &ExplicitGraph, algorithm: AlgorithmKind, workers: usize, permutation: Permutation) -> Outcome {
    let mut config = CheckerConfig::development()
        .with_algorithm(algorithm)
        .with_workers(workers);
    config.store.log2_capacity = 8;
    config.permutation = permutation;
    Run::new(config, graph)
        .and_then(|run| run.execute())
        .map(|report| report.outcome)
        .unwrap_or(Outcome::Cancelled)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_ltl_variants_match_reference(graph in graph_strategy()) {
        let want = if graph.has_accepting_cycle() {
            Outcome::CycleFound
        } else {
            Outcome::NoCounterExample
        };
        for algorithm in AlgorithmKind::LTL {
            for (workers, permutation) in [(1, Permutation::None), (3, Permutation::Random)] {
                prop_assert_eq!(
                    verdict(&graph, algorithm, workers, permutation),
                    want,
                    "{} on {} workers",
                    algorithm,
                    workers
                );
            }
        }
    }

    #[test]
    fn prop_reachability_stores_reachable_states(graph in graph_strategy()) {
        let reachable = graph.reachable().len();
        for algorithm in [AlgorithmKind::Bfs, AlgorithmKind::Dfs, AlgorithmKind::Sbfs, AlgorithmKind::Pbfs] {
            let mut config = CheckerConfig::development()
                .with_algorithm(algorithm)
                .with_workers(2);
            config.store.log2_capacity = 8;
            let report = Run::new(config, &graph).and_then(|run| run.execute());
            prop_assert!(report.is_ok());
            let report = report.unwrap();
            prop_assert_eq!(report.stored_states, reachable);
            prop_assert_eq!(report.counters.explored as usize, reachable);
        }
    }

    #[test]
    fn prop_store_round_trip(vectors in vectors_strategy(), hash in hash_strategy()) {
        let store = store(hash);
        for v in &vectors {
            let (r, _) = store.insert_or_find(v).unwrap();
            prop_assert_eq!(&store.get(r), v);
        }
        let distinct: BTreeSet<&Vec<i32>> = vectors.iter().collect();
        prop_assert_eq!(store.len(), distinct.len());
        prop_assert_eq!(store.published().count(), distinct.len());
    }

    #[test]
    fn prop_insert_is_canonical(vectors in vectors_strategy(), hash in hash_strategy()) {
        let store = store(hash);
        let per_thread: Vec<Vec<(Ref, bool)>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let (store, vectors) = (&store, &vectors);
                    scope.spawn(move || {
                        // every thread walks the input from a different offset
                        let n = vectors.len();
                        let mut seen = vec![(0, false); n];
                        for k in 0..n {
                            let i = (k + t * n / 4) % n;
                            seen[i] = store.insert_or_find(&vectors[i]).unwrap();
                        }
                        seen
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut refs: BTreeMap<&Vec<i32>, Ref> = BTreeMap::new();
        let mut winners: BTreeMap<&Vec<i32>, usize> = BTreeMap::new();
        for seen in &per_thread {
            for (v, &(r, is_new)) in vectors.iter().zip(seen) {
                prop_assert_eq!(*refs.entry(v).or_insert(r), r);
                if is_new {
                    *winners.entry(v).or_insert(0) += 1;
                }
            }
        }
        // duplicates inside one thread's input report new only once as well
        prop_assert!(winners.values().all(|&w| w == 1));
        prop_assert_eq!(winners.len(), refs.len());
        let distinct: BTreeSet<Ref> = refs.values().copied().collect();
        prop_assert_eq!(distinct.len(), refs.len());
        prop_assert_eq!(store.len(), refs.len());
    }
}
