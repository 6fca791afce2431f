//! # hopt-runner
//!
//! Parallel execution of hyperparameter trials.
//!
//! Three execution models share one callback contract,
//! `Fn(&TrialConfig, &TrialContext) -> Result<R, E>`:
//!
//! - **GPU pool**: a reusable pool of worker processes where every trial
//!   leases one GPU id set from a [`ResourceQueue`]; failures, including a
//!   worker dying, are isolated per trial.
//! - **CPU pool**: a reusable pool of worker processes with a random start
//!   delay per trial; failures abort the run unless
//!   [`FailurePolicy::Isolate`] is configured.
//! - **Forked batches**: one fresh process per trial, batch after batch, with
//!   the configuration passed as JSON on stdin (see [`forked`]).
//!
//! Pool workers and forked children are started through a [`TrialLauncher`];
//! with [`SelfExecLauncher`] the program re-executes itself and
//! [`serve_if_child`] runs the callback on the child side. Both pools also
//! have `*_in_process` variants that call the callback on their threads.
//!
//! [`HyperOptimizer`] ties a declared search space and base configuration to
//! these models.

pub mod config;
pub mod forked;
mod optimizer;
mod resource;
mod scheduler;
pub mod worker;

pub use config::{Declaration, FailurePolicy, OptimizerConfig, SchedulerConfig, SweepDocument};
pub use forked::{
    run_child, run_forked, serve_if_child, ChildEnvelope, CommandLauncher, ForkedSummary,
    SelfExecLauncher, TrialLauncher,
};
pub use optimizer::{ExecutionModel, HyperOptimizer, RunReport};
pub use resource::{ResourceLease, ResourceQueue};
pub use scheduler::{Scheduler, TrialContext, TrialOutcome};
pub use worker::{serve_worker, WorkerReply};
