//! Worker lifecycle: spawn, liveness, graceful stop and crash detection.
//!
//! Native workers are OS processes whose stdout/stderr are appended to the
//! session log. The built-in simulator runs on a named thread and writes to
//! the same log, so both go through one state machine:
//!
//! `Idle -> Starting -> Running -> {Stopping -> Stopped, Crashed}`

use crossbeam_channel::{bounded, Sender};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::backend::simulated::run_simulator;
use crate::backend::{LaunchSpec, LaunchTarget};
use crate::error::{SessionError, SessionResult};
use crate::types::WorkerExit;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// How `stop()` ended the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    NotRunning,
    /// Worker exited within the grace period
    Graceful(WorkerExit),
    /// Worker ignored the termination request and was killed
    Forced(WorkerExit),
}

enum Worker {
    Process(Child),
    Simulator {
        handle: JoinHandle<WorkerExit>,
        stop_tx: Sender<()>,
    },
}

impl Worker {
    /// Exit status if the worker has finished, without blocking
    fn try_exit(&mut self) -> Option<WorkerExit> {
        match self {
            Worker::Process(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.into()),
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to query worker status: {}", e);
                    None
                }
            },
            Worker::Simulator { handle, .. } => handle.is_finished().then(WorkerExit::success),
        }
    }

    /// Collect the final status of a finished worker
    fn reap(self) -> WorkerExit {
        match self {
            Worker::Process(mut child) => child
                .wait()
                .map(WorkerExit::from)
                .unwrap_or(WorkerExit { code: None, signal: None }),
            Worker::Simulator { handle, .. } => handle.join().unwrap_or(WorkerExit::failure(101)),
        }
    }
}

/// Owns the single worker of a session
pub struct ProcessSupervisor {
    log_path: PathBuf,
    grace_period: Duration,
    state: WorkerState,
    worker: Option<Worker>,
    last_exit: Option<WorkerExit>,
}

impl ProcessSupervisor {
    pub fn new(log_path: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self {
            log_path: log_path.into(),
            grace_period,
            state: WorkerState::Idle,
            worker: None,
            last_exit: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn last_exit(&self) -> Option<WorkerExit> {
        self.last_exit
    }

    /// Spawn the worker described by `spec`.
    ///
    /// A missing or non-executable program leaves the supervisor `Crashed`
    /// and returns a launch error; nothing is retried here.
    pub fn start(&mut self, spec: &LaunchSpec) -> SessionResult<()> {
        if self.worker.is_some() {
            return Err(SessionError::Launch {
                program: PathBuf::from(spec.program_name()),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "a worker is already running"),
            });
        }

        self.state = WorkerState::Starting;
        match self.spawn(spec) {
            Ok(worker) => {
                info!("Worker started: {}", spec.program_name());
                self.worker = Some(worker);
                self.last_exit = None;
                self.state = WorkerState::Running;
                Ok(())
            }
            Err(e) => {
                error!("Worker failed to start: {}", e);
                self.state = WorkerState::Crashed;
                Err(e)
            }
        }
    }

    fn spawn(&self, spec: &LaunchSpec) -> SessionResult<Worker> {
        let log = self.open_log()?;

        match &spec.target {
            LaunchTarget::Executable(program) => {
                let launch_error = |source| SessionError::Launch {
                    program: program.clone(),
                    source,
                };
                if !program.is_file() {
                    return Err(launch_error(io::Error::new(
                        io::ErrorKind::NotFound,
                        "executable not found",
                    )));
                }
                let stderr = log.try_clone().map_err(launch_error)?;
                let child = Command::new(program)
                    .args(&spec.args)
                    .current_dir(&spec.working_dir)
                    .stdin(Stdio::null())
                    .stdout(Stdio::from(log))
                    .stderr(Stdio::from(stderr))
                    .spawn()
                    .map_err(launch_error)?;
                Ok(Worker::Process(child))
            }
            LaunchTarget::Simulator(settings) => {
                let settings = settings.clone();
                let (stop_tx, stop_rx) = bounded::<()>(1);
                let handle = thread::Builder::new()
                    .name("simulator".to_string())
                    .spawn(move || {
                        let mut log = log;
                        run_simulator(&settings, &mut log, &stop_rx)
                    })
                    .map_err(|source| SessionError::Launch {
                        program: PathBuf::from(spec.program_name()),
                        source,
                    })?;
                Ok(Worker::Simulator { handle, stop_tx })
            }
        }
    }

    fn open_log(&self) -> SessionResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| SessionError::io(format!("opening {}", self.log_path.display()), e))
    }

    /// Non-blocking liveness probe
    pub fn is_alive(&mut self) -> bool {
        match self.worker.as_mut() {
            Some(worker) => worker.try_exit().is_none(),
            None => false,
        }
    }

    /// Detect an exit that happened while `Running`.
    ///
    /// A successful exit moves to `Stopped`, anything else to `Crashed`.
    /// Returns the exit once; later calls return `None`.
    pub fn poll(&mut self) -> Option<WorkerExit> {
        if self.state != WorkerState::Running || self.is_alive() {
            return None;
        }

        let exit = self.worker.take()?.reap();
        self.last_exit = Some(exit);
        if exit.is_success() {
            info!("Worker exited cleanly");
            self.state = WorkerState::Stopped;
        } else {
            warn!("Worker crashed with {}", exit);
            self.state = WorkerState::Crashed;
        }
        Some(exit)
    }

    /// Ask the worker to terminate, killing it after the grace period.
    ///
    /// Idempotent: with no worker running this returns `NotRunning`.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(mut worker) = self.worker.take() else {
            if matches!(self.state, WorkerState::Running | WorkerState::Stopping) {
                self.state = WorkerState::Stopped;
            }
            return StopOutcome::NotRunning;
        };

        self.state = WorkerState::Stopping;
        request_termination(&mut worker);

        let deadline = Instant::now() + self.grace_period;
        let outcome = loop {
            if worker.try_exit().is_some() {
                break StopOutcome::Graceful(worker.reap());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Worker did not exit within {:?}, killing it",
                    self.grace_period
                );
                break StopOutcome::Forced(force_kill(worker));
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };

        let exit = match outcome {
            StopOutcome::Graceful(exit) | StopOutcome::Forced(exit) => exit,
            StopOutcome::NotRunning => WorkerExit::success(),
        };
        info!("Worker stopped ({})", exit);
        self.last_exit = Some(exit);
        self.state = WorkerState::Stopped;
        outcome
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn request_termination(worker: &mut Worker) {
    match worker {
        Worker::Process(child) => {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to worker: {}", e);
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.kill();
            }
        }
        Worker::Simulator { stop_tx, .. } => {
            let _ = stop_tx.try_send(());
        }
    }
}

fn force_kill(worker: Worker) -> WorkerExit {
    match worker {
        Worker::Process(mut child) => {
            let _ = child.kill();
            child
                .wait()
                .map(WorkerExit::from)
                .unwrap_or(WorkerExit { code: None, signal: None })
        }
        // threads cannot be killed; the simulator exits at its next tick
        Worker::Simulator { handle, stop_tx } => {
            drop(stop_tx);
            drop(handle);
            WorkerExit { code: None, signal: None }
        }
    }
}
