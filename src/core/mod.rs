// Infrastructure shared by every component of the checker

pub mod atomics;
pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use atomics::{cas, update, CachePadded, Update, CACHE_LINE_SIZE};
pub use config::{
    AlgorithmKind, BalancerConfig, CheckConfig, CheckerConfig, HashKind, LtlConfig, Permutation,
    StoreConfig, MAX_WORKERS,
};
pub use errors::{CheckError, Result};
pub use logging::init_tracing;
