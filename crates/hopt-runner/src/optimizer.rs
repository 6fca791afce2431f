//! The user-facing entry points: generate trials and run them.

use chrono::{DateTime, Utc};
use hopt_search::{build_config, generate_trials, ParameterSpace};
use hopt_types::{HoptResult, TrialConfig};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::info;
use uuid::Uuid;

use crate::config::OptimizerConfig;
use crate::forked::{run_forked, ForkedSummary, TrialLauncher};
use crate::scheduler::{Scheduler, TrialContext, TrialOutcome};

/// Which execution model a run used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    GpuPool,
    CpuPool,
    Forked,
}

/// Bookkeeping for one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub id: Uuid,
    pub model: ExecutionModel,
    pub trials: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn finish(model: ExecutionModel, started_at: DateTime<Utc>, trials: usize, failed: usize) -> Self {
        let report = Self {
            id: Uuid::new_v4(),
            model,
            trials,
            failed,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            run = %report.id,
            model = ?report.model,
            trials,
            failed,
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "run finished"
        );
        report
    }
}

/// A declared search space, a frozen base configuration and a scheduler.
///
/// The base configuration is snapshotted at construction and never changes;
/// every trial gets its own copy with the trial's assignments applied.
#[derive(Debug)]
pub struct HyperOptimizer {
    space: ParameterSpace,
    base: TrialConfig,
    config: OptimizerConfig,
    scheduler: Scheduler,
    last_report: Mutex<Option<RunReport>>,
}

impl HyperOptimizer {
    pub fn new(space: ParameterSpace, base: TrialConfig, config: OptimizerConfig) -> Self {
        let scheduler = Scheduler::new(config.scheduler.clone());
        Self {
            space,
            base,
            config,
            scheduler,
            last_report: Mutex::new(None),
        }
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn base(&self) -> &TrialConfig {
        &self.base
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Report of the most recent run, if any.
    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.lock().clone()
    }

    /// Expand the space into `trial_count` complete configurations.
    pub fn generate_trials(&self, trial_count: usize) -> Vec<TrialConfig> {
        self.trials(trial_count).collect()
    }

    /// Like [`generate_trials`](Self::generate_trials), building each
    /// configuration only when it is pulled.
    pub fn trials(&self, trial_count: usize) -> impl Iterator<Item = TrialConfig> + '_ {
        let trials = generate_trials(
            self.config.strategy,
            &self.space.flatten(),
            trial_count,
            self.config.seed,
        );
        trials.into_iter().map(move |trial| build_config(&trial, &self.base))
    }

    /// Generate `trial_count` trials and run them on the GPU pool's worker
    /// processes started by `launcher`.
    pub fn run_gpu_pool<L, R, S>(
        &self,
        launcher: &L,
        trial_count: usize,
        gpu_ids: &[S],
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        L: TrialLauncher + Sync + ?Sized,
        R: DeserializeOwned + Send,
        S: AsRef<str>,
    {
        let configs = self.generate_trials(trial_count);
        self.run_gpu_pool_on(launcher, configs, gpu_ids, workers)
    }

    /// Run already generated configurations on the GPU pool.
    pub fn run_gpu_pool_on<L, R, S>(
        &self,
        launcher: &L,
        configs: Vec<TrialConfig>,
        gpu_ids: &[S],
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        L: TrialLauncher + Sync + ?Sized,
        R: DeserializeOwned + Send,
        S: AsRef<str>,
    {
        let started_at = Utc::now();
        info!(trials = configs.len(), workers, gpus = gpu_ids.len(), "starting GPU pool run");
        let outcomes = self.scheduler.run_gpu(configs, launcher, gpu_ids, workers)?;
        self.record_pooled(ExecutionModel::GpuPool, started_at, &outcomes);
        Ok(outcomes)
    }

    /// Like [`run_gpu_pool`](Self::run_gpu_pool), calling `train` on the
    /// pool's threads instead of worker processes.
    pub fn run_gpu_pool_in_process<F, R, E, S>(
        &self,
        train: F,
        trial_count: usize,
        gpu_ids: &[S],
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        F: Fn(&TrialConfig, &TrialContext) -> Result<R, E> + Send + Sync,
        R: Send,
        E: Display,
        S: AsRef<str>,
    {
        let configs = self.generate_trials(trial_count);
        let started_at = Utc::now();
        info!(trials = configs.len(), workers, gpus = gpu_ids.len(), "starting in-process GPU pool run");
        let outcomes = self.scheduler.run_gpu_in_process(configs, train, gpu_ids, workers)?;
        self.record_pooled(ExecutionModel::GpuPool, started_at, &outcomes);
        Ok(outcomes)
    }

    /// Generate `trial_count` trials and run them on the CPU pool's worker
    /// processes started by `launcher`.
    pub fn run_cpu_pool<L, R>(
        &self,
        launcher: &L,
        trial_count: usize,
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        L: TrialLauncher + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let configs = self.generate_trials(trial_count);
        let started_at = Utc::now();
        info!(trials = configs.len(), workers, "starting CPU pool run");
        let outcomes = self.scheduler.run_cpu(configs, launcher, workers)?;
        self.record_pooled(ExecutionModel::CpuPool, started_at, &outcomes);
        Ok(outcomes)
    }

    /// Like [`run_cpu_pool`](Self::run_cpu_pool), calling `train` on the
    /// pool's threads instead of worker processes.
    pub fn run_cpu_pool_in_process<F, R, E>(
        &self,
        train: F,
        trial_count: usize,
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        F: Fn(&TrialConfig, &TrialContext) -> Result<R, E> + Send + Sync,
        R: Send,
        E: Display,
    {
        let configs = self.generate_trials(trial_count);
        let started_at = Utc::now();
        info!(trials = configs.len(), workers, "starting in-process CPU pool run");
        let outcomes = self.scheduler.run_cpu_in_process(configs, train, workers)?;
        self.record_pooled(ExecutionModel::CpuPool, started_at, &outcomes);
        Ok(outcomes)
    }

    /// Generate `trial_count` trials and run each in its own process,
    /// `parallelism` at a time.
    pub fn run_forked<L>(
        &self,
        launcher: &L,
        trial_count: usize,
        parallelism: usize,
    ) -> HoptResult<ForkedSummary>
    where
        L: TrialLauncher + ?Sized,
    {
        let configs = self.generate_trials(trial_count);
        let trials = configs.len();
        let started_at = Utc::now();
        info!(trials, parallelism, "starting forked run");
        let summary = run_forked(
            launcher,
            configs,
            parallelism,
            self.config.scheduler.fork_stagger(),
        )?;
        self.record(RunReport::finish(
            ExecutionModel::Forked,
            started_at,
            trials,
            summary.failed_children.len(),
        ));
        Ok(summary)
    }

    fn record_pooled<R>(&self, model: ExecutionModel, started_at: DateTime<Utc>, outcomes: &[TrialOutcome<R>]) {
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        self.record(RunReport::finish(model, started_at, outcomes.len(), failed));
    }

    fn record(&self, report: RunReport) {
        *self.last_report.lock() = Some(report);
    }
}
