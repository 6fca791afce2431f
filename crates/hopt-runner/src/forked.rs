//! Forked-batch model: one freshly spawned process per trial, batch by batch.
//!
//! The parent serializes a [`ChildEnvelope`] to each child's stdin and waits
//! for the whole batch before starting the next one. A program that wants to
//! run its own training function as the child calls [`serve_if_child`] at
//! the top of `main` and launches itself through [`SelfExecLauncher`]. The
//! same call also serves the persistent workers of the pooled models.

use hopt_types::{ConfigError, HoptResult, TrialConfig, WorkerError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt::Display;
use std::io::{self, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::scheduler::{panic_message, TrialContext};
use crate::worker::{serve_worker, WORKER_MODE_ENV};

/// Set on every child; its presence makes [`serve_if_child`] take over.
pub const CHILD_ENV: &str = "HOPT_TRIAL_CHILD";
pub const TRIAL_NUMBER_ENV: &str = "HOPT_TRIAL_NUMBER";
pub const BATCH_INDEX_ENV: &str = "HOPT_BATCH_INDEX";
pub const BATCH_POSITION_ENV: &str = "HOPT_BATCH_POSITION";

/// Everything a child needs to run one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEnvelope {
    pub trial: usize,
    /// Forked children only.
    #[serde(default)]
    pub batch_index: Option<usize>,
    #[serde(default)]
    pub batch_position: Option<usize>,
    /// Leased device, pooled-GPU workers only.
    #[serde(default)]
    pub device: Option<String>,
    pub config: TrialConfig,
}

impl ChildEnvelope {
    pub fn forked(trial: usize, batch_index: usize, batch_position: usize, config: TrialConfig) -> Self {
        Self {
            trial,
            batch_index: Some(batch_index),
            batch_position: Some(batch_position),
            device: None,
            config,
        }
    }

    pub fn pooled(ctx: &TrialContext, config: TrialConfig) -> Self {
        Self {
            trial: ctx.trial(),
            batch_index: None,
            batch_position: None,
            device: ctx.device().map(str::to_string),
            config,
        }
    }

    /// The context the callback sees for this envelope.
    pub fn context(&self) -> TrialContext {
        let mut ctx = TrialContext::new(self.trial);
        if let Some(device) = &self.device {
            ctx = ctx.with_device(device.clone());
        }
        if let Some(position) = self.batch_position {
            ctx = ctx.with_batch_position(position);
        }
        ctx
    }
}

/// Builds the command that starts a trial child or a pool worker.
pub trait TrialLauncher {
    fn command(&self) -> io::Result<Command>;
}

/// Re-executes the current binary with the current arguments.
#[derive(Debug, Clone, Default)]
pub struct SelfExecLauncher {
    args: Vec<OsString>,
}

impl SelfExecLauncher {
    pub fn new() -> Self {
        Self {
            args: std::env::args_os().skip(1).collect(),
        }
    }

    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl TrialLauncher for SelfExecLauncher {
    fn command(&self) -> io::Result<Command> {
        let mut cmd = Command::new(std::env::current_exe()?);
        cmd.args(&self.args);
        Ok(cmd)
    }
}

/// Runs an arbitrary external program per trial.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl TrialLauncher for CommandLauncher {
    fn command(&self) -> io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        Ok(cmd)
    }
}

/// What the parent observed; callback results are never collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkedSummary {
    pub batch_sizes: Vec<usize>,
    pub failed_children: Vec<usize>,
}

impl ForkedSummary {
    pub fn batches(&self) -> usize {
        self.batch_sizes.len()
    }
}

/// Run every configuration in its own process, `parallelism` at a time.
///
/// Batch `k + 1` starts only once every child of batch `k` has exited. The
/// child at position `p` is spawned `p * stagger` after the batch starts.
pub fn run_forked<L>(
    launcher: &L,
    configs: Vec<TrialConfig>,
    parallelism: usize,
    stagger: Duration,
) -> HoptResult<ForkedSummary>
where
    L: TrialLauncher + ?Sized,
{
    if parallelism == 0 {
        return Err(ConfigError::ZeroWorkers.into());
    }

    let mut summary = ForkedSummary::default();
    for (batch_index, batch) in configs.chunks(parallelism).enumerate() {
        debug!(batch_index, size = batch.len(), "starting forked batch");
        let mut children: Vec<(usize, Child)> = Vec::with_capacity(batch.len());
        let mut spawn_error = None;

        for (position, config) in batch.iter().enumerate() {
            if position > 0 && !stagger.is_zero() {
                thread::sleep(stagger);
            }
            let envelope = ChildEnvelope::forked(
                batch_index * parallelism + position,
                batch_index,
                position,
                config.clone(),
            );
            match spawn_child(launcher, &envelope) {
                Ok(child) => children.push((envelope.trial, child)),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        // siblings are always joined, even when a spawn failed
        for (trial, mut child) in children {
            match child.wait() {
                Ok(status) if status.success() => debug!(trial, "child finished"),
                Ok(status) => {
                    warn!(trial, %status, "child exited with failure");
                    summary.failed_children.push(trial);
                }
                Err(e) => {
                    warn!(trial, error = %e, "could not wait for child");
                    summary.failed_children.push(trial);
                }
            }
        }

        if let Some(e) = spawn_error {
            return Err(e.into());
        }
        summary.batch_sizes.push(batch.len());
    }

    info!(
        batches = summary.batches(),
        failed = summary.failed_children.len(),
        "forked run finished"
    );
    Ok(summary)
}

fn spawn_child<L>(launcher: &L, envelope: &ChildEnvelope) -> Result<Child, WorkerError>
where
    L: TrialLauncher + ?Sized,
{
    let trial = envelope.trial;
    let spawn_err = |e: io::Error| WorkerError::Spawn {
        trial,
        message: e.to_string(),
    };

    let mut cmd = launcher.command().map_err(spawn_err)?;
    cmd.env(CHILD_ENV, "1")
        .env_remove(WORKER_MODE_ENV)
        .env(TRIAL_NUMBER_ENV, trial.to_string())
        .stdin(Stdio::piped());
    if let (Some(index), Some(position)) = (envelope.batch_index, envelope.batch_position) {
        cmd.env(BATCH_INDEX_ENV, index.to_string())
            .env(BATCH_POSITION_ENV, position.to_string());
    }

    let payload = serde_json::to_vec(envelope).map_err(|e| WorkerError::ChildIo {
        trial,
        message: e.to_string(),
    })?;
    let mut child = cmd.spawn().map_err(spawn_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        // a child that ignores stdin may already be gone; its exit status tells
        if let Err(e) = stdin.write_all(&payload) {
            debug!(trial, error = %e, "child did not take its envelope");
        }
    }
    Ok(child)
}

/// Run the child side when this process was launched as a trial child or
/// as a pool worker.
///
/// Returns the exit code to terminate with, or `None` in a normal launch.
pub fn serve_if_child<F, R, E>(train: F) -> Option<i32>
where
    F: Fn(&TrialConfig, &TrialContext) -> Result<R, E>,
    R: Serialize,
    E: Display,
{
    std::env::var_os(CHILD_ENV)?;
    let code = if matches!(std::env::var(WORKER_MODE_ENV).as_deref(), Ok("pool")) {
        serve_worker(io::stdin().lock(), io::stdout(), train)
    } else {
        run_child(io::stdin().lock(), train)
    };
    Some(code)
}

/// Read one envelope from `reader`, run the callback, and return an exit code:
/// `0` on success, `1` when the callback fails, `2` on a bad envelope, `101`
/// when it panics.
pub fn run_child<Rd, F, R, E>(mut reader: Rd, train: F) -> i32
where
    Rd: Read,
    F: Fn(&TrialConfig, &TrialContext) -> Result<R, E>,
    E: Display,
{
    let mut raw = String::new();
    if let Err(e) = reader.read_to_string(&mut raw) {
        error!(error = %e, "could not read trial envelope");
        return 2;
    }
    let envelope: ChildEnvelope = match serde_json::from_str(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(error = %e, "malformed trial envelope");
            return 2;
        }
    };

    let ctx = envelope.context();
    match catch_unwind(AssertUnwindSafe(|| train(&envelope.config, &ctx))) {
        Ok(Ok(_)) => {
            info!(trial = envelope.trial, "trial finished");
            0
        }
        Ok(Err(e)) => {
            error!(trial = envelope.trial, error = %e, "trial failed");
            1
        }
        Err(payload) => {
            error!(
                trial = envelope.trial,
                panic = %panic_message(payload.as_ref()),
                "trial panicked"
            );
            101
        }
    }
}
