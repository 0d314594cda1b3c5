use crate::core::errors::{CheckError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Most workers the balancer's request bitmask can address
pub const MAX_WORKERS: usize = 64;

/// Exploration strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    Bfs,
    Dfs,
    Sbfs,
    Pbfs,
    Ndfs,
    Lndfs,
    Cndfs,
    Endfs,
    Owcty,
    Ufscc,
    Renault,
    Tarjan,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 12] = [
        Self::Bfs,
        Self::Dfs,
        Self::Sbfs,
        Self::Pbfs,
        Self::Ndfs,
        Self::Lndfs,
        Self::Cndfs,
        Self::Endfs,
        Self::Owcty,
        Self::Ufscc,
        Self::Renault,
        Self::Tarjan,
    ];

    /// Variants that decide accepting-cycle existence
    pub const LTL: [AlgorithmKind; 8] = [
        Self::Ndfs,
        Self::Lndfs,
        Self::Cndfs,
        Self::Endfs,
        Self::Owcty,
        Self::Ufscc,
        Self::Renault,
        Self::Tarjan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bfs => "bfs",
            Self::Dfs => "dfs",
            Self::Sbfs => "sbfs",
            Self::Pbfs => "pbfs",
            Self::Ndfs => "ndfs",
            Self::Lndfs => "lndfs",
            Self::Cndfs => "cndfs",
            Self::Endfs => "endfs",
            Self::Owcty => "owcty",
            Self::Ufscc => "ufscc",
            Self::Renault => "renault",
            Self::Tarjan => "tarjan",
        }
    }

    pub fn is_ltl(&self) -> bool {
        Self::LTL.contains(self)
    }

    pub fn uses_load_balancer(&self) -> bool {
        matches!(self, Self::Bfs | Self::Dfs | Self::Sbfs | Self::Owcty)
    }

    /// Satellite bits needed for the wip counter of `workers` threads
    pub fn wip_bits(&self, workers: usize) -> u32 {
        match self {
            Self::Lndfs => usize::BITS - workers.leading_zeros(),
            _ => 0,
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Hash function used by the state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Xxh3,
    Fx,
}

/// Successor ordering per worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permutation {
    /// Oracle order
    None,
    /// Rotate by the worker id
    Shift,
    /// Seeded per-worker shuffle
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Table holds `1 << log2_capacity` states
    pub log2_capacity: u32,
    pub hash: HashKind,
    pub seed: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            log2_capacity: 22,
            hash: HashKind::Xxh3,
            seed: 0x5bd1_e995,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Handoff only happens when the load crosses a multiple of `1 << granularity_log2`
    pub granularity_log2: u32,
    /// Most items moved by one handoff
    pub max_handoff: usize,
    /// Completed back-offs before an idle worker polls a different victim
    pub poll_spins: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            granularity_log2: 4,
            max_handoff: 100,
            poll_spins: 4,
        }
    }
}

/// Side predicates evaluated by the reachability variants
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConfig {
    pub deadlock: bool,
    pub invariant: bool,
    /// Transitions carrying this label are error actions
    pub action_label: Option<u32>,
    /// Count violations and keep searching instead of stopping
    pub no_exit: bool,
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtlConfig {
    pub early_cycle_detection: bool,
    pub all_red: bool,
}

impl Default for LtlConfig {
    fn default() -> Self {
        Self {
            early_cycle_detection: true,
            all_red: true,
        }
    }
}

/// Top-level configuration consumed by a [`crate::run::Run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub workers: usize,
    pub algorithm: AlgorithmKind,
    pub store: StoreConfig,
    pub balancer: BalancerConfig,
    pub checks: CheckConfig,
    pub ltl: LtlConfig,
    pub permutation: Permutation,
    /// Wall-clock limit enforced by a watchdog calling `stop()`
    pub timeout: Option<Duration>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, MAX_WORKERS),
            algorithm: AlgorithmKind::Cndfs,
            store: StoreConfig::default(),
            balancer: BalancerConfig::default(),
            checks: CheckConfig::default(),
            ltl: LtlConfig::default(),
            permutation: Permutation::Random,
            timeout: None,
        }
    }
}

impl CheckerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(CheckError::configuration_field(
                format!("workers must be between 1 and {}", MAX_WORKERS),
                "workers",
                self.workers,
            ));
        }
        if !(4..=40).contains(&self.store.log2_capacity) {
            return Err(CheckError::configuration_field(
                "log2_capacity must be between 4 and 40",
                "store.log2_capacity",
                self.store.log2_capacity,
            ));
        }
        if self.balancer.granularity_log2 >= 32 {
            return Err(CheckError::configuration_field(
                "granularity_log2 must be below 32",
                "balancer.granularity_log2",
                self.balancer.granularity_log2,
            ));
        }
        if self.balancer.max_handoff == 0 {
            return Err(CheckError::configuration(
                "max_handoff must be greater than 0",
            ));
        }
        if matches!(self.algorithm, AlgorithmKind::Cndfs | AlgorithmKind::Endfs)
            && !self.ltl.early_cycle_detection
        {
            return Err(CheckError::configuration_field(
                "cndfs and endfs require early cycle detection",
                "ltl.early_cycle_detection",
                false,
            ));
        }
        if let Some(depth) = self.checks.max_depth {
            if depth == 0 {
                return Err(CheckError::configuration(
                    "max_depth must be greater than 0",
                ));
            }
        }
        Ok(())
    }

    /// Small store and two workers, for tests and experiments
    pub fn development() -> Self {
        Self {
            workers: 2,
            store: StoreConfig {
                log2_capacity: 16,
                ..Default::default()
            },
            balancer: BalancerConfig {
                granularity_log2: 2,
                ..Default::default()
            },
            permutation: Permutation::Shift,
            ..Default::default()
        }
    }

    /// Large store, all detections enabled
    pub fn exhaustive() -> Self {
        Self {
            store: StoreConfig {
                log2_capacity: 28,
                ..Default::default()
            },
            checks: CheckConfig {
                deadlock: true,
                invariant: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: AlgorithmKind) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
