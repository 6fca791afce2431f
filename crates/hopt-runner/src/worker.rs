//! Process-backed workers for the pooled models.
//!
//! Every pool slot owns one long-lived child started through a
//! [`TrialLauncher`]. The parent writes one [`ChildEnvelope`] per line to the
//! child's stdin and the child answers with one line starting with
//! [`RESULT_PREFIX`] that holds a [`WorkerReply`]. Other stdout lines are the
//! training code's own output and are passed through. A child that dies in
//! the middle of a trial fails only that trial; its slot starts a fresh child
//! the next time it is used.

use crossbeam_channel::{bounded, Receiver, Sender};
use hopt_types::{TrialConfig, WorkerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use tracing::{debug, error, warn};

use crate::forked::{ChildEnvelope, TrialLauncher, CHILD_ENV};
use crate::scheduler::{invoke, TrialContext};

/// `pool` on persistent pool workers; absent on forked children.
pub const WORKER_MODE_ENV: &str = "HOPT_WORKER_MODE";
pub const WORKER_SLOT_ENV: &str = "HOPT_WORKER_SLOT";
/// Set by a pool worker to the leased device before each trial.
pub const DEVICE_ENV: &str = "CUDA_VISIBLE_DEVICES";
/// Marks the reply line among everything else the child prints.
pub const RESULT_PREFIX: &str = "HOPT_RESULT ";

/// What a pool worker sends back for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerReply<R> {
    Ok(R),
    Err(String),
    Panic(String),
}

struct ProcessWorker {
    slot: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessWorker {
    fn spawn<L>(launcher: &L, slot: usize, trial: usize) -> Result<Self, WorkerError>
    where
        L: TrialLauncher + ?Sized,
    {
        let spawn_err = |e: io::Error| WorkerError::Spawn {
            trial,
            message: e.to_string(),
        };

        let mut cmd = launcher.command().map_err(spawn_err)?;
        cmd.env(CHILD_ENV, "1")
            .env(WORKER_MODE_ENV, "pool")
            .env(WORKER_SLOT_ENV, slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        let mut child = cmd.spawn().map_err(spawn_err)?;

        let missing = || spawn_err(io::Error::new(io::ErrorKind::Other, "stdio was not piped"));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        debug!(slot, pid = child.id(), "started worker process");

        Ok(Self {
            slot,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    /// Send one envelope and wait for its reply.
    ///
    /// `Err` means this worker can no longer be used.
    fn run<R: DeserializeOwned>(&mut self, envelope: &ChildEnvelope) -> Result<WorkerReply<R>, WorkerError> {
        let trial = envelope.trial;
        let mut request = serde_json::to_string(envelope).map_err(|e| WorkerError::ChildIo {
            trial,
            message: e.to_string(),
        })?;
        request.push('\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.crashed(trial));
        };
        if stdin
            .write_all(request.as_bytes())
            .and_then(|()| stdin.flush())
            .is_err()
        {
            return Err(self.crashed(trial));
        }

        let mut line = String::new();
        loop {
            line.clear();
            match self.stdout.read_line(&mut line) {
                Ok(0) => return Err(self.crashed(trial)),
                Ok(_) => {}
                Err(e) => {
                    return Err(WorkerError::ChildIo {
                        trial,
                        message: e.to_string(),
                    })
                }
            }
            // output without a trailing newline may precede the marker
            match line.find(RESULT_PREFIX) {
                Some(at) => {
                    print!("{}", &line[..at]);
                    let payload = line[at + RESULT_PREFIX.len()..].trim_end();
                    return serde_json::from_str(payload).map_err(|e| WorkerError::ChildIo {
                        trial,
                        message: format!("malformed reply: {e}"),
                    });
                }
                None => print!("{line}"),
            }
        }
    }

    /// Reap a child that stopped answering and describe how it ended.
    fn crashed(&mut self, trial: usize) -> WorkerError {
        drop(self.stdin.take());
        let status = match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };
        WorkerError::Crashed { trial, status }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(slot = self.slot, error = %e, "worker process already gone");
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // closing stdin ends the child's serve loop
        drop(self.stdin.take());
        if let Err(e) = self.child.wait() {
            warn!(slot = self.slot, error = %e, "could not reap worker process");
        }
    }
}

struct WorkerSlot {
    index: usize,
    worker: Option<ProcessWorker>,
}

/// A fixed number of worker slots, each holding at most one live child.
///
/// Children are started on first use and kept across runs; they exit when
/// the pool is dropped.
pub(crate) struct ProcessPool {
    idle_tx: Sender<WorkerSlot>,
    idle_rx: Receiver<WorkerSlot>,
    size: usize,
}

impl ProcessPool {
    pub(crate) fn new(size: usize) -> Self {
        let (idle_tx, idle_rx) = bounded(size);
        for index in 0..size {
            if let Err(e) = idle_tx.try_send(WorkerSlot { index, worker: None }) {
                error!(slot = e.into_inner().index, "could not seed worker slot");
            }
        }
        Self {
            idle_tx,
            idle_rx,
            size,
        }
    }

    /// Slots whose child is currently alive and idle.
    #[cfg(test)]
    pub(crate) fn live_idle(&self) -> usize {
        self.idle_rx
            .try_iter()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|slot| {
                let live = slot.worker.is_some();
                self.give_back(slot);
                usize::from(live)
            })
            .sum()
    }

    /// Run one trial on a worker process.
    pub(crate) fn run<L, R>(&self, launcher: &L, config: &TrialConfig, ctx: &TrialContext) -> Result<R, WorkerError>
    where
        L: TrialLauncher + ?Sized,
        R: DeserializeOwned,
    {
        let trial = ctx.trial();
        let mut lease = self.checkout();
        let mut worker = match lease.worker.take() {
            Some(worker) => worker,
            None => ProcessWorker::spawn(launcher, lease.index, trial)?,
        };

        let envelope = ChildEnvelope::pooled(ctx, config.clone());
        match worker.run::<R>(&envelope) {
            Ok(reply) => {
                lease.worker = Some(worker);
                match reply {
                    WorkerReply::Ok(value) => Ok(value),
                    WorkerReply::Err(message) => Err(WorkerError::CallbackFailed { trial, message }),
                    WorkerReply::Panic(message) => Err(WorkerError::Panicked { trial, message }),
                }
            }
            Err(err) => {
                warn!(slot = lease.index, trial, %err, "worker process lost, replacing it on next use");
                if matches!(err, WorkerError::ChildIo { .. }) {
                    worker.kill();
                }
                Err(err)
            }
        }
    }

    fn checkout(&self) -> SlotLease<'_> {
        // `self.idle_tx` keeps the channel connected for as long as `self` lives
        let slot = match self.idle_rx.recv() {
            Ok(slot) => slot,
            Err(_) => unreachable!("process pool holds its own sender"),
        };
        SlotLease {
            pool: self,
            index: slot.index,
            worker: slot.worker,
        }
    }

    fn give_back(&self, slot: WorkerSlot) {
        if let Err(e) = self.idle_tx.try_send(slot) {
            error!(slot = e.into_inner().index, "worker slot returned twice, dropping it");
        }
    }
}

impl fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPool")
            .field("size", &self.size)
            .field("idle", &self.idle_rx.len())
            .finish()
    }
}

struct SlotLease<'a> {
    pool: &'a ProcessPool,
    index: usize,
    worker: Option<ProcessWorker>,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.pool.give_back(WorkerSlot {
            index: self.index,
            worker: self.worker.take(),
        });
    }
}

/// Child side of a pool worker: answer envelopes read from `reader` until it
/// closes.
///
/// Returns the exit code: `0` once the parent closes the pipe, `2` on a bad
/// envelope or a broken output pipe.
pub fn serve_worker<Rd, W, F, R, E>(reader: Rd, mut writer: W, train: F) -> i32
where
    Rd: BufRead,
    W: Write,
    F: Fn(&TrialConfig, &TrialContext) -> Result<R, E>,
    R: Serialize,
    E: Display,
{
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "could not read trial envelope");
                return 2;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let envelope: ChildEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "malformed trial envelope");
                return 2;
            }
        };

        if let Some(device) = &envelope.device {
            std::env::set_var(DEVICE_ENV, device);
        }
        let ctx = envelope.context();
        let reply = match invoke(&train, &envelope.config, &ctx) {
            Ok(value) => WorkerReply::Ok(value),
            Err(WorkerError::Panicked { message, .. }) => {
                error!(trial = ctx.trial(), panic = %message, "trial panicked");
                WorkerReply::Panic(message)
            }
            Err(err) => {
                error!(trial = ctx.trial(), %err, "trial failed");
                WorkerReply::Err(match err {
                    WorkerError::CallbackFailed { message, .. } => message,
                    other => other.to_string(),
                })
            }
        };

        let payload = match serde_json::to_string(&reply) {
            Ok(payload) => payload,
            Err(e) => serde_json::json!({ "err": format!("result is not serializable: {e}") }).to_string(),
        };
        if let Err(e) = writeln!(writer, "{RESULT_PREFIX}{payload}").and_then(|()| writer.flush()) {
            error!(error = %e, "could not send trial reply");
            return 2;
        }
    }
    0
}
