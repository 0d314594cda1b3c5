// Core infrastructure modules
pub mod core;

// Shared data structures
pub mod balance;
pub mod color;
pub mod dfs_stack;
pub mod store;

// Model interface and results
pub mod oracle;
pub mod stats;
pub mod trace;

// Exploration strategies and their orchestration
pub mod algorithm;
pub mod run;

// Re-exports for convenience
pub use crate::core::config::{AlgorithmKind, CheckerConfig, LtlConfig, Permutation};
pub use crate::core::errors::{CheckError, Result};
pub use crate::core::logging::init_tracing;
pub use oracle::{ExplicitGraph, NextState};
pub use run::{CancelHandle, ExitStatus, Outcome, Run, RunReport};
pub use stats::{Counters, FailureReport, LogStatsSink, StatsSink};
pub use store::{Ref, StateStore};
pub use trace::{JsonTraceSink, MemoryTraceSink, Trace, TraceSink, TraceStep};
