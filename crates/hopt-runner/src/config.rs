//! Scheduler and optimizer configuration.

use hopt_search::{OptArg, OptList, OptRange, ParameterSpace, Strategy};
use hopt_types::{ConfigError, HoptResult, TrialConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// What a pooled model does when a training callback fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log it, record a `None` result and keep going.
    Isolate,
    /// Abort the whole batch with the error.
    Propagate,
}

/// Timing and failure knobs for the execution models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound of the random delay before each CPU-pool trial.
    pub cpu_jitter_max_ms: u64,
    /// Delay between spawning consecutive children of a forked batch.
    pub fork_stagger_ms: u64,
    /// Failure handling of the CPU pool (the GPU pool always isolates).
    pub cpu_failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_jitter_max_ms: 4_000,
            fork_stagger_ms: 500,
            cpu_failure_policy: FailurePolicy::Propagate,
        }
    }
}

impl SchedulerConfig {
    /// No jitter and no stagger.
    pub fn immediate() -> Self {
        Self {
            cpu_jitter_max_ms: 0,
            fork_stagger_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_cpu_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.cpu_failure_policy = policy;
        self
    }

    pub fn cpu_jitter_max(&self) -> Duration {
        Duration::from_millis(self.cpu_jitter_max_ms)
    }

    pub fn fork_stagger(&self) -> Duration {
        Duration::from_millis(self.fork_stagger_ms)
    }
}

/// Top-level configuration of a [`HyperOptimizer`](crate::HyperOptimizer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub strategy: Strategy,
    /// Seed for random search. `None` draws from the OS.
    pub seed: Option<u64>,
    pub scheduler: SchedulerConfig,
}

impl OptimizerConfig {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> HoptResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// One parameter declaration in a sweep document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Declaration {
    List(OptList),
    Range(OptRange),
}

/// A search space, its base configuration and strategy, as read from JSON.
///
/// ```json
/// {
///   "strategy": "random",
///   "seed": 7,
///   "base": { "epochs": 10 },
///   "parameters": [
///     { "list": { "id": "--optimizer", "options": ["adam", "sgd"], "tunable": true } },
///     { "range": { "id": "--lr", "low": 0.0001, "high": 0.1, "log_base": 10, "tunable": true } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepDocument {
    pub strategy: Strategy,
    pub seed: Option<u64>,
    pub scheduler: SchedulerConfig,
    pub base: Map<String, Value>,
    pub parameters: Vec<Declaration>,
}

impl SweepDocument {
    pub fn from_json_file(path: impl AsRef<Path>) -> HoptResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Declare every parameter into a fresh space.
    ///
    /// Range samples are drawn from `seed` when one is set.
    pub fn declare(&self) -> Result<ParameterSpace, ConfigError> {
        let mut space = match self.seed {
            Some(seed) => ParameterSpace::with_seed(seed),
            None => ParameterSpace::new(),
        };
        for decl in &self.parameters {
            match decl {
                Declaration::List(list) => space.opt_list(list.clone())?,
                Declaration::Range(range) => space.opt_range(range.clone())?,
            };
        }
        Ok(space)
    }

    /// Base configuration: the document's `base`, then every declared
    /// parameter's first candidate as its default when not already set.
    pub fn base_config(&self, space: &ParameterSpace) -> TrialConfig {
        let mut base = TrialConfig::from(self.base.clone());
        for arg in space.iter() {
            let name = arg.clean_name();
            if !base.contains(&name) {
                if let Some(default) = default_value(arg) {
                    base.set(name, default);
                }
            }
        }
        base
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            strategy: self.strategy,
            seed: self.seed,
            scheduler: self.scheduler.clone(),
        }
    }
}

fn default_value(arg: &OptArg) -> Option<Value> {
    arg.candidates.first().map(|v| v.to_json())
}
