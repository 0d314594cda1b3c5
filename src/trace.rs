//! Counterexample traces and where they go.

use crate::core::errors::{CheckError, Result};
use crate::oracle::NextState;
use crate::store::{Ref, StateStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

/// One state of a trace and the label of the transition leaving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub state: Vec<i32>,
    pub label: Option<u32>,
}

/// A path from the initial state, optionally closed into a lasso.
///
/// For a lasso the last step of `cycle` leads back to the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub prefix: Vec<TraceStep>,
    pub cycle: Vec<TraceStep>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.prefix.len() + self.cycle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_lasso(&self) -> bool {
        !self.cycle.is_empty()
    }

    /// All states in order, prefix first
    pub fn states(&self) -> impl Iterator<Item = &[i32]> {
        self.prefix
            .iter()
            .chain(self.cycle.iter())
            .map(|s| s.state.as_slice())
    }

    /// Build a trace from stored references.
    ///
    /// `path` runs from the initial state. When `closing` is given the path
    /// is a lasso: the cycle starts at the first occurrence of `closing`,
    /// which must be on the path.
    pub fn from_refs(
        store: &StateStore,
        oracle: &dyn NextState,
        path: &[Ref],
        closing: Option<Ref>,
    ) -> Result<Self> {
        let states: Vec<Vec<i32>> = path.iter().map(|r| store.get(*r)).collect();
        let split = match closing {
            Some(c) => path.iter().position(|r| *r == c).ok_or_else(|| {
                CheckError::internal(format!("cycle state {} is not on the trace path", c))
            })?,
            None => states.len(),
        };

        let mut steps = Vec::with_capacity(states.len());
        for (i, state) in states.iter().enumerate() {
            let next = match states.get(i + 1) {
                Some(next) => Some(next),
                None if closing.is_some() => states.get(split),
                None => None,
            };
            let label = match next {
                Some(next) => label_between(oracle, state, next)?,
                None => None,
            };
            steps.push(TraceStep {
                state: state.clone(),
                label,
            });
        }
        let cycle = steps.split_off(split);
        debug!(prefix = steps.len(), cycle = cycle.len(), "Trace reconstructed");
        Ok(Self {
            prefix: steps,
            cycle,
        })
    }
}

/// Label of the first transition from `src` to `dst`
fn label_between(oracle: &dyn NextState, src: &[i32], dst: &[i32]) -> Result<Option<u32>> {
    let mut found = None;
    let mut matched = false;
    oracle.successors(src, &mut |label, succ| {
        if !matched && succ == dst {
            matched = true;
            found = label;
        }
    })?;
    if !matched {
        return Err(CheckError::internal(format!(
            "trace step {:?} -> {:?} is not a transition",
            src, dst
        )));
    }
    Ok(found)
}

/// Consumer of counterexample traces
pub trait TraceSink: Send + Sync {
    fn write(&self, trace: &Trace) -> Result<()>;
}

/// Keeps every trace in memory
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    traces: Mutex<Vec<Trace>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().clone()
    }

    pub fn last(&self) -> Option<Trace> {
        self.traces.lock().last().cloned()
    }
}

impl TraceSink for MemoryTraceSink {
    fn write(&self, trace: &Trace) -> Result<()> {
        self.traces.lock().push(trace.clone());
        Ok(())
    }
}

/// Writes each trace as one JSON line
pub struct JsonTraceSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonTraceSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> TraceSink for JsonTraceSink<W> {
    fn write(&self, trace: &Trace) -> Result<()> {
        let line = serde_json::to_string(trace)?;
        let mut out = self.out.lock();
        writeln!(out, "{}", line).map_err(|e| CheckError::io("write trace", e))?;
        out.flush().map_err(|e| CheckError::io("flush trace", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use crate::oracle::ExplicitGraph;
    use crate::store::SatLayout;
    use pretty_assertions::assert_eq;

    fn setup(graph: &ExplicitGraph) -> (StateStore, Vec<Ref>) {
        let config = StoreConfig {
            log2_capacity: 6,
            ..Default::default()
        };
        let store = StateStore::new(1, &config, SatLayout::default()).unwrap();
        let refs = (0..graph.node_count())
            .map(|n| store.insert_or_find(&ExplicitGraph::state_of(n)).unwrap().0)
            .collect();
        (store, refs)
    }

    #[test]
    fn test_lasso_labels_wrap_around() {
        let graph = ExplicitGraph::builder()
            .labelled_edge(0, 1, 10)
            .labelled_edge(1, 2, 11)
            .labelled_edge(2, 1, 12)
            .accepting(1)
            .build();
        let (store, refs) = setup(&graph);
        let trace = Trace::from_refs(&store, &graph, &refs, Some(refs[1])).unwrap();
        assert_eq!(trace.prefix, vec![TraceStep { state: vec![0], label: Some(10) }]);
        assert_eq!(
            trace.cycle,
            vec![
                TraceStep { state: vec![1], label: Some(11) },
                TraceStep { state: vec![2], label: Some(12) },
            ]
        );
        assert!(trace.is_lasso());
    }

    #[test]
    fn test_linear_trace_ends_unlabelled() {
        let graph = ExplicitGraph::builder().path(&[0, 1, 2]).build();
        let (store, refs) = setup(&graph);
        let trace = Trace::from_refs(&store, &graph, &refs, None).unwrap();
        assert_eq!(trace.len(), 3);
        assert!(!trace.is_lasso());
        assert_eq!(trace.prefix[2].label, None);
        assert_eq!(
            trace.states().map(|s| s.to_vec()).collect::<Vec<_>>(),
            vec![vec![0], vec![1], vec![2]]
        );
    }

    #[test]
    fn test_broken_path_is_rejected() {
        let graph = ExplicitGraph::builder().path(&[0, 1]).edge(0, 2).build();
        let (store, refs) = setup(&graph);
        assert!(Trace::from_refs(&store, &graph, &[refs[1], refs[2]], None).is_err());
        assert!(Trace::from_refs(&store, &graph, &[refs[0]], Some(refs[1])).is_err());
    }

    #[test]
    fn test_sinks_collect_traces() {
        let trace = Trace {
            prefix: vec![TraceStep { state: vec![4], label: None }],
            cycle: Vec::new(),
        };
        let memory = MemoryTraceSink::new();
        memory.write(&trace).unwrap();
        assert_eq!(memory.last(), Some(trace.clone()));

        let json = JsonTraceSink::new(Vec::new());
        json.write(&trace).unwrap();
        let text = String::from_utf8(json.into_inner()).unwrap();
        let back: Trace = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(back, trace);
    }
}
