//! Session orchestration and the host-facing control surface.
//!
//! A session runs: validate -> provision -> lock the install path -> render
//! config -> start the worker -> pump log lines into metrics until stopped.
//! Everything up to the lock happens synchronously in [`Session::run`] and
//! aborts before any worker exists. From the start onwards a dedicated pump
//! thread owns the supervisor, the tailer and the event sink.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

use crate::backend::{create_backend, BackendKind, LaunchSpec, SimulatorOptions};
use crate::channel::{event_channel, EventSink, MetricsStream, DEFAULT_CAPACITY};
use crate::error::{SessionError, SessionResult};
use crate::profile::MiningProfile;
use crate::provision::{CancelToken, ProvisionState, Provisioner, DEFAULT_PROVISION_TIMEOUT};
use crate::render::ConfigGenerator;
use crate::supervisor::{ProcessSupervisor, WorkerState, DEFAULT_GRACE_PERIOD};
use crate::tailer::{LogTailer, MetricsExtractor};
use crate::types::SessionEvent;

pub const SESSION_LOG_FILE: &str = "session.log";
pub const LOCK_FILE: &str = ".session.lock";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Restart budget applied when a worker crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 0,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart `attempt` (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// Tunables for running sessions
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub install_root: PathBuf,
    pub provision_timeout: Duration,
    pub grace_period: Duration,
    pub restart: RestartPolicy,
    /// How often the pump checks the log and the worker
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    /// Session log location; defaults to `<install>/session.log`
    pub log_file: Option<PathBuf>,
    /// Start each session with an empty log instead of appending
    pub truncate_log: bool,
    pub simulator: SimulatorOptions,
}

impl SessionOptions {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            restart: RestartPolicy::default(),
            poll_interval: Duration::from_millis(250),
            channel_capacity: DEFAULT_CAPACITY,
            log_file: None,
            truncate_log: false,
            simulator: SimulatorOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Runs sessions against a shared provisioner
pub struct Session {
    options: SessionOptions,
    provisioner: Arc<Provisioner>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let provisioner = Arc::new(Provisioner::new(&options.install_root));
        Self::with_provisioner(options, provisioner)
    }

    pub fn with_provisioner(options: SessionOptions, provisioner: Arc<Provisioner>) -> Self {
        Self {
            options,
            provisioner,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    /// Prepare and start a session.
    ///
    /// Validation, provisioning and config errors are returned here and no
    /// worker is spawned. Launch failures and crashes arrive on the event
    /// stream.
    pub fn run(
        &self,
        profile: MiningProfile,
        kind: BackendKind,
        cancel: &CancelToken,
    ) -> SessionResult<SessionHandle> {
        profile.validate()?;
        let backend = create_backend(kind, &self.options.simulator);
        let descriptor = backend.descriptor();

        let install_path =
            self.provisioner
                .provision(descriptor, self.options.provision_timeout, cancel)?;
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        // the running session owns the install path, config file included
        let lock = acquire_lock(&install_path)?;
        let rendered = ConfigGenerator::render(&profile, backend.as_ref(), &install_path)?;
        let launch = backend.launch_spec(&install_path, &rendered);

        let log_path = self
            .options
            .log_file
            .clone()
            .unwrap_or_else(|| install_path.join(SESSION_LOG_FILE));
        if self.options.truncate_log && log_path.exists() {
            File::create(&log_path)
                .map_err(|e| SessionError::io(format!("truncating {}", log_path.display()), e))?;
        }

        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(Mutex::new(WorkerState::Idle));
        let (sink, events) = event_channel(self.options.channel_capacity);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let pump = Pump {
            id,
            kind,
            launch,
            tailer: LogTailer::from_end(&log_path),
            extractor: MetricsExtractor::new(backend.clone()),
            supervisor: ProcessSupervisor::new(&log_path, self.options.grace_period),
            sink,
            stop_rx,
            state: state.clone(),
            restart: self.options.restart,
            poll_interval: self.options.poll_interval,
            _lock: lock,
        };
        let thread = thread::Builder::new()
            .name(format!("pump-{}", id.0))
            .spawn(move || pump.run())
            .map_err(|e| SessionError::io("spawning session thread", e))?;

        info!("{} started with {} backend", id, kind);
        Ok(SessionHandle {
            id,
            kind,
            install_path,
            log_path,
            state,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
            events: Mutex::new(Some(events)),
        })
    }
}

/// Exclusive advisory lock on a backend's install path
struct InstallLock {
    file: File,
    path: PathBuf,
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

fn acquire_lock(install_path: &Path) -> SessionResult<InstallLock> {
    let path = install_path.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| SessionError::io(format!("opening {}", path.display()), e))?;

    if file.try_lock_exclusive().is_err() {
        return Err(SessionError::SessionBusy {
            path: install_path.to_path_buf(),
        });
    }
    Ok(InstallLock { file, path })
}

/// State owned by a session's pump thread
struct Pump {
    id: SessionId,
    kind: BackendKind,
    launch: LaunchSpec,
    tailer: LogTailer,
    extractor: MetricsExtractor,
    supervisor: ProcessSupervisor,
    sink: EventSink,
    stop_rx: Receiver<()>,
    state: Arc<Mutex<WorkerState>>,
    restart: RestartPolicy,
    poll_interval: Duration,
    _lock: InstallLock,
}

impl Pump {
    fn run(mut self) {
        let _span = info_span!("session", id = self.id.0, backend = %self.kind).entered();

        if self.start_worker() {
            self.supervise();
        }

        self.supervisor.stop();
        self.publish_state();
        self.drain_log();
        self.sink.send(SessionEvent::Stopped);

        if self.sink.dropped() > 0 {
            debug!("{} metrics events dropped for a slow consumer", self.sink.dropped());
        }
        info!("{} finished", self.id);
    }

    fn publish_state(&self) {
        *self.state.lock() = self.supervisor.state();
    }

    /// Returns false when the worker could not be launched
    fn start_worker(&mut self) -> bool {
        let result = self.supervisor.start(&self.launch);
        self.publish_state();
        match result {
            Ok(()) => true,
            Err(e) => {
                self.sink.send(SessionEvent::LaunchFailed {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn drain_log(&mut self) {
        match self.tailer.poll() {
            Ok(lines) => {
                for line in lines {
                    if let Some(event) = self.extractor.ingest(&line) {
                        self.sink.send(SessionEvent::Metrics(event));
                    }
                }
            }
            Err(e) => warn!("Failed to read {}: {}", self.tailer.path().display(), e),
        }
    }

    /// True when the caller asked to stop during `timeout`
    fn stop_requested(&self, timeout: Duration) -> bool {
        match self.stop_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn supervise(&mut self) {
        let mut restarts = 0;

        loop {
            self.drain_log();

            if let Some(exit) = self.supervisor.poll() {
                self.publish_state();
                self.drain_log();

                if exit.is_success() {
                    self.sink.send(SessionEvent::WorkerExited { status: exit });
                    return;
                }

                self.sink.send(SessionEvent::WorkerCrashed { status: exit });
                if restarts >= self.restart.max_restarts {
                    warn!("Worker crashed ({}), restart budget exhausted", exit);
                    return;
                }

                restarts += 1;
                let backoff = self.restart.backoff(restarts);
                info!("Restarting worker in {:?} (attempt {})", backoff, restarts);
                if self.stop_requested(backoff) {
                    return;
                }

                self.extractor.worker_restarted();
                if !self.start_worker() {
                    return;
                }
                self.sink.send(SessionEvent::WorkerRestarted { attempt: restarts });
                continue;
            }

            if self.stop_requested(self.poll_interval) {
                debug!("Stop requested");
                return;
            }
        }
    }
}

/// Control handle for one running session.
///
/// `stop()` may be called from any thread and any number of times. When it
/// returns the worker is gone, the pump thread has exited and the event
/// stream has received its final `Stopped`.
pub struct SessionHandle {
    id: SessionId,
    kind: BackendKind,
    install_path: PathBuf,
    log_path: PathBuf,
    state: Arc<Mutex<WorkerState>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<MetricsStream>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.kind
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Hand out the event stream; only the first caller receives it
    pub fn take_events(&self) -> Option<MetricsStream> {
        self.events.lock().take()
    }

    /// Wait until the worker is `Running`, or give up after `timeout`
    pub fn wait_until_running(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                WorkerState::Running => return true,
                WorkerState::Crashed | WorkerState::Stopped => return false,
                _ => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// The pump thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    pub fn stop(&self) {
        // dropping the sender wakes the pump
        self.stop_tx.lock().take();

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.join().is_err() {
            warn!("{} pump thread panicked", self.id);
        }
        info!("{} stopped", self.id);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("backend", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Host application's entry point to mining sessions
pub struct MiningHost {
    session: Session,
}

impl MiningHost {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            session: Session::new(options),
        }
    }

    pub fn with_session(session: Session) -> Self {
        Self { session }
    }

    pub fn start_session(
        &self,
        profile: MiningProfile,
        backend: BackendKind,
    ) -> SessionResult<SessionHandle> {
        self.session.run(profile, backend, &CancelToken::new())
    }

    /// Start with a caller-owned cancel token for provisioning
    pub fn start_session_cancellable(
        &self,
        profile: MiningProfile,
        backend: BackendKind,
        cancel: &CancelToken,
    ) -> SessionResult<SessionHandle> {
        self.session.run(profile, backend, cancel)
    }

    pub fn stop_session(&self, handle: &SessionHandle) {
        handle.stop();
    }

    pub fn subscribe_metrics(&self, handle: &SessionHandle) -> Option<MetricsStream> {
        handle.take_events()
    }

    pub fn provision_status(&self, backend: BackendKind) -> ProvisionState {
        self.session.provisioner().status(backend.descriptor())
    }

    /// Provision without starting a session
    pub fn provision(&self, backend: BackendKind, cancel: &CancelToken) -> ProvisionState {
        self.session.provisioner().ensure(
            backend.descriptor(),
            self.session.options().provision_timeout,
            cancel,
        )
    }
}
