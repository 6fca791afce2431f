//! Trial generation strategies over a flattened search space.

use hopt_types::ConfigError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::space::{Assignment, FlattenedSpace, Trial};

/// Which built-in strategy expands the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    #[serde(alias = "grid_search")]
    Grid,
    #[serde(alias = "random_search")]
    Random,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grid" | "grid_search" => Ok(Self::Grid),
            "random" | "random_search" => Ok(Self::Random),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::Random => write!(f, "random"),
        }
    }
}

/// Common trait for all search strategies.
pub trait SearchStrategy: Send + Sync {
    /// Expand `space` into at most `trial_count` trials.
    fn generate(&mut self, space: &FlattenedSpace, trial_count: usize) -> Vec<Trial>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Exhaustive Cartesian product, truncated to the first `trial_count` points.
#[derive(Debug, Clone, Default)]
pub struct GridSearch;

impl GridSearch {
    pub fn new() -> Self {
        Self
    }

    fn build_grid(space: &FlattenedSpace, limit: usize) -> Vec<Trial> {
        GridIter::new(&space.groups).take(limit).collect()
    }
}

/// Walks the Cartesian product in order without materializing it.
///
/// `digits` is a mixed-radix counter over the group sizes, last group
/// fastest; `None` once the product is exhausted.
struct GridIter<'a> {
    groups: &'a [Vec<Assignment>],
    digits: Option<Vec<usize>>,
}

impl<'a> GridIter<'a> {
    fn new(groups: &'a [Vec<Assignment>]) -> Self {
        let digits = if groups.iter().any(Vec::is_empty) {
            None
        } else {
            Some(vec![0; groups.len()])
        };
        Self { groups, digits }
    }
}

impl Iterator for GridIter<'_> {
    type Item = Trial;

    fn next(&mut self) -> Option<Trial> {
        let digits = self.digits.as_mut()?;
        let trial = Trial::new(
            self.groups
                .iter()
                .zip(digits.iter())
                .map(|(group, &d)| group[d].clone())
                .collect(),
        );

        let mut exhausted = true;
        for (digit, group) in digits.iter_mut().zip(self.groups).rev() {
            *digit += 1;
            if *digit < group.len() {
                exhausted = false;
                break;
            }
            *digit = 0;
        }
        if exhausted {
            self.digits = None;
        }
        Some(trial)
    }
}

impl SearchStrategy for GridSearch {
    fn generate(&mut self, space: &FlattenedSpace, trial_count: usize) -> Vec<Trial> {
        match space.grid_size() {
            Some(size) if size > trial_count => {
                tracing::info!(grid_size = size, trial_count, "truncating grid")
            }
            None => tracing::info!(trial_count, "grid size overflows usize, truncating"),
            _ => {}
        }
        Self::build_grid(space, trial_count)
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent uniform choice of one candidate per group, per trial.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    rng: StdRng,
}

impl RandomSearch {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample_one(&mut self, space: &FlattenedSpace) -> Trial {
        let assignments = space
            .groups
            .iter()
            .filter(|group| !group.is_empty())
            .map(|group| group[self.rng.random_range(0..group.len())].clone())
            .collect();
        Trial::new(assignments)
    }
}

impl Default for RandomSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchStrategy for RandomSearch {
    fn generate(&mut self, space: &FlattenedSpace, trial_count: usize) -> Vec<Trial> {
        (0..trial_count).map(|_| self.sample_one(space)).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Expand `space` with the chosen built-in strategy.
pub fn generate_trials(
    strategy: Strategy,
    space: &FlattenedSpace,
    trial_count: usize,
    seed: Option<u64>,
) -> Vec<Trial> {
    let mut engine: Box<dyn SearchStrategy> = match (strategy, seed) {
        (Strategy::Grid, _) => Box::new(GridSearch::new()),
        (Strategy::Random, Some(seed)) => Box::new(RandomSearch::with_seed(seed)),
        (Strategy::Random, None) => Box::new(RandomSearch::new()),
    };
    let trials = engine.generate(space, trial_count);
    tracing::debug!(strategy = engine.name(), trials = trials.len(), "generated trials");
    trials
}
