//! Pooled execution models: GPU pool with resource leases, CPU pool with jitter.
//!
//! Both pools run trials in persistent worker processes by default (see
//! [`worker`](crate::worker)), with an in-process variant on the same threads.

use hopt_types::{ConfigError, HoptResult, TrialConfig, WorkerError};
use parking_lot::Mutex;
use rand::Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{FailurePolicy, SchedulerConfig};
use crate::forked::TrialLauncher;
use crate::resource::ResourceQueue;
use crate::worker::ProcessPool;

/// What a training callback gets to know about the trial it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialContext {
    trial: usize,
    device: Option<String>,
    batch_position: Option<usize>,
}

impl TrialContext {
    pub fn new(trial: usize) -> Self {
        Self {
            trial,
            device: None,
            batch_position: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_batch_position(mut self, position: usize) -> Self {
        self.batch_position = Some(position);
        self
    }

    /// Submission index of the trial.
    pub fn trial(&self) -> usize {
        self.trial
    }

    /// Leased GPU id set (e.g. `"0"` or `"1,3"`), pooled-GPU model only.
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Position inside the forked batch, forked model only.
    pub fn batch_position(&self) -> Option<usize> {
        self.batch_position
    }
}

/// A trial's configuration and its result, `None` when the trial failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome<R> {
    pub trial: usize,
    pub config: TrialConfig,
    pub result: Option<R>,
}

impl<R> TrialOutcome<R> {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }
}

struct GpuPool {
    threads: ThreadPool,
    queue: Arc<ResourceQueue>,
    processes: ProcessPool,
    workers: usize,
}

struct CpuPool {
    threads: ThreadPool,
    processes: ProcessPool,
    workers: usize,
}

/// Runs trials on worker pools built on first use and reused afterwards.
///
/// `run_gpu` and `run_cpu` execute every trial in a persistent worker
/// process, so a trial that aborts or crashes fails alone. The
/// `*_in_process` variants run the callback on the pool's threads instead;
/// they only survive failures that unwind.
pub struct Scheduler {
    config: SchedulerConfig,
    gpu: Mutex<Option<Arc<GpuPool>>>,
    cpu: Mutex<Option<Arc<CpuPool>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            gpu: Mutex::new(None),
            cpu: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Resource queue of the GPU pool, once it has been built.
    pub fn gpu_queue(&self) -> Option<Arc<ResourceQueue>> {
        self.gpu.lock().as_ref().map(|pool| Arc::clone(&pool.queue))
    }

    fn gpu_pool<S: AsRef<str>>(&self, gpu_ids: &[S], workers: usize) -> HoptResult<Arc<GpuPool>> {
        let mut slot = self.gpu.lock();
        if let Some(pool) = slot.as_ref() {
            if pool.workers != workers || !pool.queue.has_tokens(gpu_ids) {
                warn!(
                    workers = pool.workers,
                    tokens = ?pool.queue.tokens(),
                    "GPU pool already built, reusing it with its original settings"
                );
            }
            return Ok(Arc::clone(pool));
        }

        let queue = ResourceQueue::new(gpu_ids.iter().map(|id| id.as_ref().to_string()))?;
        let pool = Arc::new(GpuPool {
            threads: build_threads("hopt-gpu", workers)?,
            queue: Arc::new(queue),
            processes: ProcessPool::new(workers),
            workers,
        });
        info!(workers, gpus = pool.queue.capacity(), "built GPU worker pool");
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn cpu_pool(&self, workers: usize) -> HoptResult<Arc<CpuPool>> {
        let mut slot = self.cpu.lock();
        if let Some(pool) = slot.as_ref() {
            if pool.workers != workers {
                warn!(workers = pool.workers, "CPU pool already built, reusing it");
            }
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(CpuPool {
            threads: build_threads("hopt-cpu", workers)?,
            processes: ProcessPool::new(workers),
            workers,
        });
        info!(workers, "built CPU worker pool");
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Run every configuration on the GPU pool's worker processes.
    ///
    /// Each trial leases one GPU id set for the duration of its trial; the
    /// worker sees it in the envelope and as `CUDA_VISIBLE_DEVICES`.
    /// Failures, including a worker process dying, are logged and recorded as
    /// `None`; they never abort the run.
    pub fn run_gpu<L, R, S>(
        &self,
        configs: Vec<TrialConfig>,
        launcher: &L,
        gpu_ids: &[S],
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        L: TrialLauncher + Sync + ?Sized,
        R: DeserializeOwned + Send,
        S: AsRef<str>,
    {
        let pool = self.gpu_pool(gpu_ids, workers)?;
        let processes = &pool.processes;
        Ok(dispatch_gpu(&pool, configs, |config, ctx| {
            processes.run(launcher, config, ctx)
        }))
    }

    /// Like [`run_gpu`](Self::run_gpu), calling `train` on the pool's threads.
    pub fn run_gpu_in_process<F, R, E, S>(
        &self,
        configs: Vec<TrialConfig>,
        train: F,
        gpu_ids: &[S],
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        F: Fn(&TrialConfig, &TrialContext) -> Result<R, E> + Send + Sync,
        R: Send,
        E: Display,
        S: AsRef<str>,
    {
        let pool = self.gpu_pool(gpu_ids, workers)?;
        Ok(dispatch_gpu(&pool, configs, |config, ctx| {
            invoke(&train, config, ctx)
        }))
    }

    /// Run every configuration on the CPU pool's worker processes.
    ///
    /// Each trial first sleeps a random delay of up to
    /// [`SchedulerConfig::cpu_jitter_max`]. With [`FailurePolicy::Propagate`]
    /// the first failure aborts the run.
    pub fn run_cpu<L, R>(
        &self,
        configs: Vec<TrialConfig>,
        launcher: &L,
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        L: TrialLauncher + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let pool = self.cpu_pool(workers)?;
        let processes = &pool.processes;
        Ok(dispatch_cpu(&pool, &self.config, configs, |config, ctx| {
            processes.run(launcher, config, ctx)
        })?)
    }

    /// Like [`run_cpu`](Self::run_cpu), calling `train` on the pool's threads.
    pub fn run_cpu_in_process<F, R, E>(
        &self,
        configs: Vec<TrialConfig>,
        train: F,
        workers: usize,
    ) -> HoptResult<Vec<TrialOutcome<R>>>
    where
        F: Fn(&TrialConfig, &TrialContext) -> Result<R, E> + Send + Sync,
        R: Send,
        E: Display,
    {
        let pool = self.cpu_pool(workers)?;
        Ok(dispatch_cpu(&pool, &self.config, configs, |config, ctx| {
            invoke(&train, config, ctx)
        })?)
    }
}

fn dispatch_gpu<R, G>(pool: &GpuPool, configs: Vec<TrialConfig>, run: G) -> Vec<TrialOutcome<R>>
where
    R: Send,
    G: Fn(&TrialConfig, &TrialContext) -> Result<R, WorkerError> + Sync,
{
    let queue = &pool.queue;
    pool.threads.install(|| {
        configs
            .into_par_iter()
            .enumerate()
            .map(|(trial, config)| {
                let lease = queue.acquire();
                let ctx = TrialContext::new(trial).with_device(lease.token());
                debug!(trial, device = lease.token(), "running trial");

                let result = match run(&config, &ctx) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        error!(trial, device = lease.token(), %err, "trial failed, continuing");
                        debug!("failed trial configuration:\n{config}");
                        None
                    }
                };
                drop(lease);

                TrialOutcome {
                    trial,
                    config,
                    result,
                }
            })
            .collect()
    })
}

fn dispatch_cpu<R, G>(
    pool: &CpuPool,
    settings: &SchedulerConfig,
    configs: Vec<TrialConfig>,
    run: G,
) -> Result<Vec<TrialOutcome<R>>, WorkerError>
where
    R: Send,
    G: Fn(&TrialConfig, &TrialContext) -> Result<R, WorkerError> + Sync,
{
    let jitter_max = settings.cpu_jitter_max_ms;
    let policy = settings.cpu_failure_policy;

    pool.threads.install(|| {
        configs
            .into_par_iter()
            .enumerate()
            .map(|(trial, config)| {
                thread::sleep(jitter_delay(jitter_max));
                let ctx = TrialContext::new(trial);
                debug!(trial, "running trial");

                match run(&config, &ctx) {
                    Ok(value) => Ok(TrialOutcome {
                        trial,
                        config,
                        result: Some(value),
                    }),
                    Err(err) if policy == FailurePolicy::Isolate => {
                        error!(trial, %err, "trial failed, continuing");
                        Ok(TrialOutcome {
                            trial,
                            config,
                            result: None,
                        })
                    }
                    Err(err) => {
                        error!(trial, %err, "trial failed, aborting run");
                        Err(err)
                    }
                }
            })
            .collect()
    })
}

/// Random start delay in `[0, max_ms]` milliseconds.
pub(crate) fn jitter_delay(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("gpu_pool_built", &self.gpu.lock().is_some())
            .field("cpu_pool_built", &self.cpu.lock().is_some())
            .finish()
    }
}

fn build_threads(prefix: &'static str, workers: usize) -> HoptResult<ThreadPool> {
    if workers == 0 {
        return Err(ConfigError::ZeroWorkers.into());
    }
    ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(move |i| format!("{prefix}-{i}"))
        .build()
        .map_err(|e| {
            WorkerError::PoolBuild {
                message: e.to_string(),
            }
            .into()
        })
}

/// Call the training callback, turning both `Err` and panics into a
/// [`WorkerError`] tagged with the trial number.
pub(crate) fn invoke<F, R, E>(train: &F, config: &TrialConfig, ctx: &TrialContext) -> Result<R, WorkerError>
where
    F: Fn(&TrialConfig, &TrialContext) -> Result<R, E>,
    E: Display,
{
    match catch_unwind(AssertUnwindSafe(|| train(config, ctx))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(WorkerError::CallbackFailed {
            trial: ctx.trial(),
            message: e.to_string(),
        }),
        Err(payload) => Err(WorkerError::Panicked {
            trial: ctx.trial(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forked::SelfExecLauncher;
    use hopt_types::HoptError;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn configs(n: usize) -> Vec<TrialConfig> {
        (0..n).map(|i| TrialConfig::new().with("i", i)).collect()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::immediate())
    }

    #[test]
    fn gpu_pool_bounds_concurrency_and_conserves_tokens() {
        let scheduler = scheduler();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let held = std::sync::Mutex::new(HashSet::<String>::new());

        let outcomes = scheduler
            .run_gpu_in_process(
                configs(10),
                |config, ctx| {
                    let device = ctx.device().unwrap_or_default().to_string();
                    assert!(held.lock().unwrap().insert(device.clone()), "token double-issued");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    held.lock().unwrap().remove(&device);
                    Ok::<_, String>(config.get_i64("i").unwrap_or(-1) * 10)
                },
                &["0", "1"],
                2,
            )
            .unwrap();

        assert_eq!(outcomes.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.trial, i);
            assert_eq!(outcome.result, Some(i as i64 * 10));
        }

        let queue = scheduler.gpu_queue().unwrap();
        assert_eq!(queue.available(), 2);
        assert!(queue.has_tokens(&["1", "0"]));
    }

    #[test]
    fn gpu_pool_isolates_failures() {
        let scheduler = scheduler();
        let outcomes = scheduler
            .run_gpu_in_process(
                configs(10),
                |config, _ctx| {
                    let i = config.get_i64("i").unwrap_or(0);
                    match i {
                        2 | 5 => Err(format!("trial {i} diverged")),
                        8 => panic!("out of memory"),
                        _ => Ok(i),
                    }
                },
                &["0", "1"],
                2,
            )
            .unwrap();

        assert_eq!(outcomes.len(), 10);
        let failed: Vec<usize> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.trial)
            .collect();
        assert_eq!(failed, vec![2, 5, 8]);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 7);
        // failed trials keep their configuration
        assert_eq!(outcomes[5].config.get_i64("i"), Some(5));
        assert_eq!(scheduler.gpu_queue().unwrap().available(), 2);
    }

    #[test]
    fn gpu_pool_capacity_follows_id_list_not_workers() {
        let scheduler = scheduler();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        scheduler
            .run_gpu_in_process(
                configs(8),
                |_config, _ctx| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                },
                &["0"],
                4,
            )
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gpu_pool_is_built_once_and_reused() {
        let scheduler = scheduler();
        let run = |ids: &[&str]| {
            scheduler
                .run_gpu_in_process(
                    configs(3),
                    |_c, ctx| Ok::<_, String>(ctx.device().map(str::to_string)),
                    ids,
                    2,
                )
                .unwrap()
        };

        run(&["0", "1"][..]);
        let second = run(&["7"][..]);
        // the original pool and its tokens are reused
        for outcome in second {
            let device = outcome.result.flatten().unwrap();
            assert!(device == "0" || device == "1");
        }
    }

    #[test]
    fn gpu_pool_rejects_bad_setup() {
        let ok = |_: &TrialConfig, _: &TrialContext| Ok::<_, String>(());
        let err = scheduler().run_gpu_in_process(configs(1), ok, &["0", "0"], 2).unwrap_err();
        assert!(err.to_string().contains("Duplicate resource token"));

        let err = scheduler().run_gpu_in_process(configs(1), ok, &["0"], 0).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn cpu_pool_preserves_order() {
        let scheduler = scheduler();
        let outcomes = scheduler
            .run_cpu_in_process(
                configs(12),
                |config, ctx| {
                    assert!(ctx.device().is_none());
                    Ok::<_, String>(config.get_i64("i").unwrap_or(-1))
                },
                3,
            )
            .unwrap();

        let results: Vec<i64> = outcomes.into_iter().filter_map(|o| o.result).collect();
        assert_eq!(results, (0..12).collect::<Vec<i64>>());
    }

    #[test]
    fn cpu_pool_propagates_failures_by_default() {
        let err = scheduler()
            .run_cpu_in_process(
                configs(6),
                |config, _ctx| match config.get_i64("i") {
                    Some(3) => Err("loss is NaN"),
                    _ => Ok(()),
                },
                2,
            )
            .unwrap_err();

        assert!(err.to_string().contains("Trial 3 failed: loss is NaN"));
    }

    #[test]
    fn cpu_pool_propagates_panics() {
        let err = scheduler()
            .run_cpu_in_process(
                configs(2),
                |config, _ctx| {
                    if config.get_i64("i") == Some(1) {
                        panic!("bad shape");
                    }
                    Ok::<_, String>(())
                },
                2,
            )
            .unwrap_err();
        assert!(err.to_string().contains("panicked: bad shape"));
    }

    #[test]
    fn cpu_pool_can_isolate_failures() {
        let scheduler = Scheduler::new(
            SchedulerConfig::immediate().with_cpu_failure_policy(FailurePolicy::Isolate),
        );
        let outcomes = scheduler
            .run_cpu_in_process(
                configs(5),
                |config, _ctx| match config.get_i64("i") {
                    Some(i) if i % 2 == 0 => Err("even"),
                    Some(i) => Ok(i),
                    None => Err("missing"),
                },
                2,
            )
            .unwrap();

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 2);
    }

    #[test]
    fn jitter_delay_stays_within_bound() {
        assert_eq!(jitter_delay(0), Duration::ZERO);

        let draws: Vec<Duration> = (0..1_000).map(|_| jitter_delay(25)).collect();
        assert!(draws.iter().all(|d| *d <= Duration::from_millis(25)));
        let distinct: HashSet<Duration> = draws.into_iter().collect();
        assert!(distinct.len() > 1, "jitter never varies");
    }

    #[test]
    fn cpu_trials_start_after_a_random_delay() {
        let jitter_max = Duration::from_millis(200);
        let scheduler = Scheduler::new(SchedulerConfig {
            cpu_jitter_max_ms: jitter_max.as_millis() as u64,
            ..SchedulerConfig::immediate()
        });
        let start = Instant::now();
        let outcomes = scheduler
            .run_cpu_in_process(configs(8), |_c, _ctx| Ok::<_, String>(start.elapsed()), 8)
            .unwrap();

        let offsets: Vec<Duration> = outcomes.into_iter().filter_map(|o| o.result).collect();
        assert_eq!(offsets.len(), 8);
        // a worker runs at most all eight trials back to back
        let ceiling = jitter_max * 8 + Duration::from_millis(500);
        assert!(offsets.iter().all(|d| *d <= ceiling), "offsets: {offsets:?}");
        assert!(
            offsets.iter().any(|d| *d >= Duration::from_millis(10)),
            "no trial was delayed: {offsets:?}"
        );
    }

    /// Training function served by this test binary when it is re-executed as
    /// a pool worker.
    fn worker_train(config: &TrialConfig, ctx: &TrialContext) -> Result<serde_json::Value, String> {
        let i = config.get_i64("i").unwrap_or(-1);
        match i {
            2 => std::process::abort(),
            5 => Err(format!("trial {i} diverged")),
            7 => panic!("bad shape"),
            _ => Ok(serde_json::json!({
                "i": i,
                "device": ctx.device(),
                "visible": std::env::var(crate::worker::DEVICE_ENV).ok(),
            })),
        }
    }

    #[test]
    fn pool_worker_entry() {
        if let Some(code) = crate::forked::serve_if_child(worker_train) {
            std::process::exit(code);
        }
    }

    fn self_exec() -> SelfExecLauncher {
        SelfExecLauncher::with_args([
            "scheduler::tests::pool_worker_entry",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
    }

    #[test]
    fn gpu_process_pool_survives_aborting_trial() {
        let scheduler = scheduler();
        let outcomes: Vec<TrialOutcome<serde_json::Value>> = scheduler
            .run_gpu(configs(8), &self_exec(), &["0", "1"], 2)
            .unwrap();

        assert_eq!(outcomes.len(), 8);
        let failed: Vec<usize> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.trial)
            .collect();
        assert_eq!(failed, vec![2, 5, 7]);

        for outcome in outcomes.iter().filter(|o| o.is_success()) {
            let result = outcome.result.as_ref().unwrap();
            assert_eq!(result["i"], serde_json::json!(outcome.trial));
            let device = result["device"].as_str().unwrap();
            assert!(device == "0" || device == "1");
            assert_eq!(result["visible"].as_str(), Some(device));
        }
        assert_eq!(scheduler.gpu_queue().unwrap().available(), 2);
    }

    #[test]
    fn cpu_process_pool_propagates_a_crash() {
        let err = scheduler()
            .run_cpu::<_, serde_json::Value>(configs(4), &self_exec(), 2)
            .unwrap_err();
        assert!(
            matches!(err, HoptError::Worker(WorkerError::Crashed { trial: 2, .. })),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn cpu_process_pool_can_isolate_a_crash() {
        let scheduler = Scheduler::new(
            SchedulerConfig::immediate().with_cpu_failure_policy(FailurePolicy::Isolate),
        );
        let outcomes: Vec<TrialOutcome<serde_json::Value>> =
            scheduler.run_cpu(configs(8), &self_exec(), 3).unwrap();

        assert_eq!(outcomes.len(), 8);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 5);
        assert!(outcomes[2].result.is_none());
        assert_eq!(outcomes[3].result.as_ref().unwrap()["device"], serde_json::Value::Null);
    }
}
