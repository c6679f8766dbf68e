//! WebSocket bridge that lets an external host (e.g. a game front end)
//! drive mining sessions and receive their metrics as JSON.

use crate::backend::BackendKind;
use crate::error::{ErrorKind, SessionError};
use crate::profile::MiningProfile;
use crate::provision::ProvisionState;
use crate::session::{MiningHost, SessionHandle};
use crate::types::{SessionEvent, WorkerExit};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};

/// Message from the host application
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartSession {
        backend: Option<BackendKind>,
        pool: Option<String>,
        wallet: Option<String>,
        worker: Option<String>,
        algorithm: Option<String>,
        threads: Option<usize>,
        max_cpu_usage: Option<u8>,
    },
    StopSession,
    ProvisionStatus {
        backend: Option<BackendKind>,
    },
}

/// Message to the host application
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        version: String,
    },
    SessionStarted {
        session: String,
        backend: BackendKind,
    },
    Metrics {
        timestamp: DateTime<Utc>,
        hashrate: f64,
        accepted: u64,
        rejected: u64,
        status: Option<String>,
    },
    WorkerRestarted {
        attempt: u32,
    },
    WorkerCrashed {
        status: WorkerExit,
    },
    WorkerExited {
        status: WorkerExit,
    },
    LaunchFailed {
        reason: String,
    },
    Stopped,
    ProvisionStatus {
        backend: BackendKind,
        #[serde(flatten)]
        state: ProvisionState,
    },
    Error {
        kind: Option<ErrorKind>,
        message: String,
    },
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Metrics(m) => ServerMessage::Metrics {
                timestamp: m.timestamp,
                hashrate: m.hashrate,
                accepted: m.accepted,
                rejected: m.rejected,
                status: m.status,
            },
            SessionEvent::WorkerRestarted { attempt } => ServerMessage::WorkerRestarted { attempt },
            SessionEvent::WorkerCrashed { status } => ServerMessage::WorkerCrashed { status },
            SessionEvent::WorkerExited { status } => ServerMessage::WorkerExited { status },
            SessionEvent::LaunchFailed { reason } => ServerMessage::LaunchFailed { reason },
            SessionEvent::Stopped => ServerMessage::Stopped,
        }
    }
}

impl From<&SessionError> for ServerMessage {
    fn from(err: &SessionError) -> Self {
        ServerMessage::Error {
            kind: Some(err.kind()),
            message: err.to_string(),
        }
    }
}

/// Defaults applied to `start_session` requests
#[derive(Debug, Clone)]
pub struct ServerDefaults {
    pub backend: BackendKind,
    pub profile: MiningProfile,
}

/// The one session a connection may drive
#[derive(Debug, Default)]
enum SessionSlot {
    #[default]
    Empty,
    /// A start is in flight on a blocking thread
    Starting,
    /// Stop or disconnect arrived while starting; the starter stops what it gets
    Cancelled,
    Active(Arc<SessionHandle>),
}

impl SessionSlot {
    /// Claim the slot for a new start; false when it is taken
    fn reserve(&mut self) -> bool {
        if matches!(self, SessionSlot::Empty) {
            *self = SessionSlot::Starting;
            true
        } else {
            false
        }
    }

    /// Release the slot, returning a running session to stop
    fn release(&mut self) -> Option<Arc<SessionHandle>> {
        match std::mem::take(self) {
            SessionSlot::Active(handle) => Some(handle),
            SessionSlot::Starting | SessionSlot::Cancelled => {
                *self = SessionSlot::Cancelled;
                None
            }
            SessionSlot::Empty => None,
        }
    }

    /// Record the outcome of an in-flight start.
    ///
    /// Returns the handle back when the start was cancelled meanwhile.
    fn started(&mut self, handle: Option<Arc<SessionHandle>>) -> Option<Arc<SessionHandle>> {
        match (std::mem::take(self), handle) {
            (SessionSlot::Starting, Some(handle)) => {
                *self = SessionSlot::Active(handle);
                None
            }
            (_, handle) => handle,
        }
    }

    /// Clear the slot if it still holds `handle`
    fn finished(&mut self, handle: &Arc<SessionHandle>) {
        if matches!(self, SessionSlot::Active(active) if Arc::ptr_eq(active, handle)) {
            *self = SessionSlot::Empty;
        }
    }
}

type ActiveSession = Arc<Mutex<SessionSlot>>;

pub async fn run_server(port: u16, host: Arc<MiningHost>, defaults: ServerDefaults) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    println!("🌐 WebSocket Server listening on ws://{}", addr);
    println!("   Default backend: {}", defaults.backend);
    println!("   Connect from the host application to start a session.");
    println!("   Press Ctrl+C to stop server.\n");

    let defaults = Arc::new(defaults);

    while let Ok((stream, peer)) = listener.accept().await {
        tokio::spawn(handle_connection(stream, peer, host.clone(), defaults.clone()));
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    host: Arc<MiningHost>,
    defaults: Arc<ServerDefaults>,
) {
    info!("New connection from {}", peer);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Failed to accept WebSocket from {}: {}", peer, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let welcome = ServerMessage::Connected {
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    let active: ActiveSession = Arc::new(Mutex::new(SessionSlot::Empty));
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(100);

    // Task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let text_str: &str = &text;
                match serde_json::from_str::<ClientMessage>(text_str) {
                    Ok(ClientMessage::StartSession {
                        backend,
                        pool,
                        wallet,
                        worker,
                        algorithm,
                        threads,
                        max_cpu_usage,
                    }) => {
                        if !active.lock().reserve() {
                            let _ = out_tx
                                .send(ServerMessage::Error {
                                    kind: Some(ErrorKind::SessionBusy),
                                    message: "a session is already running or starting on this connection"
                                        .to_string(),
                                })
                                .await;
                            continue;
                        }

                        let mut profile = defaults.profile.clone();
                        if let Some(pool) = pool {
                            profile.pool = pool;
                        }
                        if let Some(wallet) = wallet {
                            profile.wallet = wallet;
                        }
                        if let Some(worker) = worker {
                            profile.worker = worker;
                        }
                        if let Some(algorithm) = algorithm {
                            profile.algorithm = algorithm;
                        }
                        if let Some(threads) = threads {
                            profile.threads = threads;
                        }
                        if let Some(cap) = max_cpu_usage {
                            profile.max_cpu_usage = cap;
                        }
                        let backend = backend.unwrap_or(defaults.backend);

                        let host = host.clone();
                        let active = active.clone();
                        let out_tx = out_tx.clone();
                        tokio::task::spawn_blocking(move || {
                            start_session(&host, profile, backend, &active, out_tx);
                        });
                    }
                    Ok(ClientMessage::StopSession) => {
                        let handle = active.lock().release();
                        if let Some(handle) = handle {
                            tokio::task::spawn_blocking(move || handle.stop());
                        }
                    }
                    Ok(ClientMessage::ProvisionStatus { backend }) => {
                        let backend = backend.unwrap_or(defaults.backend);
                        let state = host.provision_status(backend);
                        let _ = out_tx
                            .send(ServerMessage::ProvisionStatus { backend, state })
                            .await;
                    }
                    Err(e) => {
                        let _ = out_tx
                            .send(ServerMessage::Error {
                                kind: None,
                                message: format!("Invalid message: {}", e),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    let handle = active.lock().release();
    if let Some(handle) = handle {
        let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
    }
    send_task.abort();
    info!("Connection closed: {}", peer);
}

/// Blocking: provisions, starts and then forwards events on a helper thread
fn start_session(
    host: &MiningHost,
    profile: MiningProfile,
    backend: BackendKind,
    active: &ActiveSession,
    out_tx: mpsc::Sender<ServerMessage>,
) {
    let handle = match host.start_session(profile, backend) {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            error!("Failed to start {} session: {}", backend, e);
            active.lock().started(None);
            let _ = out_tx.blocking_send(ServerMessage::from(&e));
            return;
        }
    };

    let cancelled = active.lock().started(Some(handle.clone()));
    if let Some(cancelled) = cancelled {
        info!("{} stopped before it was handed out", cancelled.id());
        cancelled.stop();
        let _ = out_tx.blocking_send(ServerMessage::Stopped);
        return;
    }

    let Some(events) = host.subscribe_metrics(&handle) else {
        return;
    };
    let _ = out_tx.blocking_send(ServerMessage::SessionStarted {
        session: handle.id().to_string(),
        backend,
    });

    let active = active.clone();
    let spawned = thread::Builder::new()
        .name(format!("forward-{}", handle.id()))
        .spawn(move || {
            for event in events {
                let done = event.is_terminal();
                if out_tx.blocking_send(ServerMessage::from(event)).is_err() || done {
                    break;
                }
            }
            // session ended on its own: release this connection's slot
            active.lock().finished(&handle);
        });
    if let Err(e) = spawned {
        error!("Failed to spawn event forwarder: {}", e);
    }
}
