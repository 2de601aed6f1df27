//! ComputeProcess variant: a worker process supervised by the broker.
//!
//! Each ComputeProcess connection starts one worker through a
//! [`WorkerSpawner`].  How the worker reaches its client depends on the
//! [`WorkerTransport`]:
//!
//! | transport | client traffic                                              |
//! |-----------|-------------------------------------------------------------|
//! | Handoff   | the socket itself is passed to the worker (see `handoff`)  |
//! | Stdio     | payloads go to the worker's stdin; stdout comes back as binary messages |
//!
//! With Handoff the broker stops touching a socket once the handshake reply
//! is sent.  It only watches the worker's process and the worker's
//! `socketClosed` reports.
//!
//! # Lifetimes (for beginners)
//!
//! The worker and the logical connection end together:
//!
//! - The connection closes (clean close by the client, eviction, shutdown)
//!   → the supervisor kills the worker.
//! - The worker exits → the supervisor removes the connection, which closes
//!   the socket.
//!
//! A socket *drop* is neither: the connection goes Offline, the worker keeps
//! running, and (with Stdio) its output waits in the outbox until the client
//! reconnects.
//!
//! `kill_on_drop(true)` on the child is the backstop for paths where the
//! supervisor never ran.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Outbound, WorkerTransport};
use crate::infrastructure::connection::{BindingEnd, Outbox};
use crate::infrastructure::framed_socket::FramedSocket;
#[cfg(unix)]
use crate::infrastructure::{
    framed_socket::SocketEnd,
    handoff::{self, ControlChannel, ControlMessage},
};

/// Environment variable carrying the session's reconnection token.
pub const TOKEN_ENV: &str = "SESSION_BROKER_TOKEN";
/// Environment variable carrying the hello's `args` as JSON.
pub const ARGS_ENV: &str = "SESSION_BROKER_ARGS";
/// Environment variable carrying the logical connection id.
pub const CONNECTION_ID_ENV: &str = "SESSION_BROKER_CONNECTION_ID";

const STDOUT_CHUNK: usize = 16 * 1024;
/// How long the supervisor waits for stdout to drain after the worker exits.
const STDOUT_DRAIN: Duration = Duration::from_secs(1);
#[cfg(unix)]
const SOCKET_REPORTS: usize = 16;

/// Start parameters handed to the spawner.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerParams {
    pub connection_id: Uuid,
    pub token: String,
    pub peer_version: String,
    pub args: Map<String, Value>,
}

/// The channel a spawner must set up between the broker and the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerIo {
    /// Piped stdin and stdout.
    Stdio,
    /// Install `control_fd` as [`handoff::CONTROL_FD`] in the child.
    #[cfg(unix)]
    Handoff { control_fd: std::os::fd::RawFd },
}

/// Why a worker could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no worker command configured")]
    NotConfigured,

    #[error("failed to start '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker was started without piped stdin/stdout")]
    MissingStdio,

    #[error("could not set up the worker control channel: {0}")]
    Control(#[source] std::io::Error),

    #[error("socket handoff is not available on this platform")]
    HandoffUnsupported,
}

/// Starts worker processes for ComputeProcess connections.
///
/// With [`WorkerIo::Stdio`] the returned child must have piped stdin and
/// stdout.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, params: &WorkerParams, io: WorkerIo) -> Result<Child, SpawnError>;
}

/// Runs a fixed command line for every worker.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: Vec<String>,
}

impl CommandSpawner {
    /// `command[0]` is the program, the rest are its arguments.  An empty
    /// command makes every spawn fail with [`SpawnError::NotConfigured`].
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, params: &WorkerParams, io: WorkerIo) -> Result<Child, SpawnError> {
        let (program, args) = self.command.split_first().ok_or(SpawnError::NotConfigured)?;
        let args_json = serde_json::to_string(&params.args).unwrap_or_else(|_| "{}".to_string());

        let mut command = Command::new(program);
        command
            .args(args)
            .env(TOKEN_ENV, &params.token)
            .env(ARGS_ENV, args_json)
            .env(CONNECTION_ID_ENV, params.connection_id.to_string())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        match io {
            WorkerIo::Stdio => {
                command.stdin(Stdio::piped()).stdout(Stdio::piped());
            }
            #[cfg(unix)]
            WorkerIo::Handoff { control_fd } => {
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .env(handoff::CONTROL_FD_ENV, handoff::CONTROL_FD.to_string());
                // SAFETY: the hook only calls dup2/fcntl, which are
                // async-signal-safe.
                unsafe {
                    command.pre_exec(move || handoff::install_control_fd(control_fd));
                }
            }
        }

        let child = command.spawn().map_err(|source| SpawnError::Io {
            program: program.clone(),
            source,
        })?;
        info!(
            "worker '{program}' started (pid {:?}, {io:?}) for connection {}",
            child.id(),
            params.connection_id
        );
        Ok(child)
    }
}

/// How the broker and a running worker are connected.
enum WorkerLink {
    Stdio {
        stdin: Mutex<Option<ChildStdin>>,
        outbox: Outbox,
        stdout_done: CancellationToken,
    },
    #[cfg(unix)]
    Handoff {
        control: Arc<ControlChannel>,
        /// `socketClosed` reports, fanned out to every serving task.
        reports: tokio::sync::broadcast::Sender<SocketReport>,
    },
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
struct SocketReport {
    socket_id: Uuid,
    clean: bool,
}

pub struct ComputeConnection {
    link: WorkerLink,
    child: parking_lot::Mutex<Option<Child>>,
    pid: Option<u32>,
    /// Cancelled to ask the supervisor to kill the worker.
    stop: CancellationToken,
    /// Cancelled once the worker has exited (and, with Stdio, its stdout is
    /// drained).
    exited: CancellationToken,
}

impl ComputeConnection {
    /// Starts the worker and the task that reads from it (its stdout, or
    /// the control channel).  Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Whatever the spawner returns, [`SpawnError::MissingStdio`], or a
    /// control channel failure.
    pub fn spawn(
        spawner: &dyn WorkerSpawner,
        params: &WorkerParams,
        outbox_capacity: usize,
        transport: WorkerTransport,
    ) -> Result<Self, SpawnError> {
        match transport {
            WorkerTransport::Stdio => Self::spawn_stdio(spawner, params, outbox_capacity),
            #[cfg(unix)]
            WorkerTransport::Handoff => Self::spawn_handoff(spawner, params),
            #[cfg(not(unix))]
            WorkerTransport::Handoff => Err(SpawnError::HandoffUnsupported),
        }
    }

    fn spawn_stdio(
        spawner: &dyn WorkerSpawner,
        params: &WorkerParams,
        outbox_capacity: usize,
    ) -> Result<Self, SpawnError> {
        let mut child = spawner.spawn(params, WorkerIo::Stdio)?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(SpawnError::MissingStdio);
            }
        };

        let outbox = Outbox::new(outbox_capacity);
        let stop = CancellationToken::new();
        let stdout_done = CancellationToken::new();
        tokio::spawn(forward_stdout(
            stdout,
            outbox.sender(),
            stop.clone(),
            stdout_done.clone(),
        ));

        Ok(Self {
            link: WorkerLink::Stdio {
                stdin: Mutex::new(Some(stdin)),
                outbox,
                stdout_done,
            },
            pid: child.id(),
            child: parking_lot::Mutex::new(Some(child)),
            stop,
            exited: CancellationToken::new(),
        })
    }

    #[cfg(unix)]
    fn spawn_handoff(spawner: &dyn WorkerSpawner, params: &WorkerParams) -> Result<Self, SpawnError> {
        use std::os::fd::AsRawFd;

        let (control, worker_end) = ControlChannel::pair().map_err(SpawnError::Control)?;
        let child = spawner.spawn(
            params,
            WorkerIo::Handoff {
                control_fd: worker_end.as_raw_fd(),
            },
        )?;
        // The child holds its own copy now.
        drop(worker_end);

        let control = Arc::new(control);
        let (reports, _) = tokio::sync::broadcast::channel(SOCKET_REPORTS);
        let stop = CancellationToken::new();
        let exited = CancellationToken::new();
        tokio::spawn(read_reports(
            Arc::clone(&control),
            reports.clone(),
            stop.clone(),
            exited.clone(),
        ));

        Ok(Self {
            link: WorkerLink::Handoff { control, reports },
            pid: child.id(),
            child: parking_lot::Mutex::new(Some(child)),
            stop,
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// `true` when client sockets are passed to the worker.
    pub fn hands_off_sockets(&self) -> bool {
        match &self.link {
            WorkerLink::Stdio { .. } => false,
            #[cfg(unix)]
            WorkerLink::Handoff { .. } => true,
        }
    }

    /// Starts the supervisor task.  `on_exit` runs once if the worker exits
    /// on its own (not when it is killed by [`shutdown`](Self::shutdown)).
    ///
    /// Calling this more than once has no effect.
    pub fn supervise(&self, on_exit: impl FnOnce(Option<i32>) + Send + 'static) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let stop = self.stop.clone();
        let exited = self.exited.clone();
        let stdout_done = match &self.link {
            WorkerLink::Stdio { stdout_done, .. } => Some(stdout_done.clone()),
            #[cfg(unix)]
            WorkerLink::Handoff { .. } => None,
        };
        let pid = self.pid;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("could not kill worker {pid:?}: {e}");
                    }
                    info!("worker {pid:?} stopped");
                    exited.cancel();
                    return;
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("waiting for worker {pid:?} failed: {e}");
                    None
                }
            };
            info!("worker {pid:?} exited with code {code:?}");
            if let Some(stdout_done) = stdout_done {
                let _ = tokio::time::timeout(STDOUT_DRAIN, stdout_done.cancelled()).await;
            }
            exited.cancel();
            on_exit(code);
        });
    }

    /// Serves one binding until the socket ends or the worker exits.
    pub async fn serve(&self, socket: &Arc<FramedSocket>) -> BindingEnd {
        match &self.link {
            WorkerLink::Stdio { stdin, outbox, .. } => self.proxy(socket, stdin, outbox).await,
            #[cfg(unix)]
            WorkerLink::Handoff { control, reports } => {
                self.hand_to_worker(socket, control, reports).await
            }
        }
    }

    /// Proxies `socket` to the worker's stdio.  Output still queued when
    /// the worker exits is flushed first.
    async fn proxy(
        &self,
        socket: &Arc<FramedSocket>,
        stdin: &Mutex<Option<ChildStdin>>,
        outbox: &Outbox,
    ) -> BindingEnd {
        let inbound = async {
            loop {
                let message = match socket.recv().await {
                    Ok(message) => message,
                    Err(end) => return BindingEnd::Socket(end),
                };
                let mut stdin = stdin.lock().await;
                let Some(pipe) = stdin.as_mut() else {
                    return BindingEnd::WorkerExited;
                };
                let written = match pipe.write_all(&message).await {
                    Ok(()) => pipe.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    debug!("worker {:?} stdin closed: {e}", self.pid);
                    *stdin = None;
                    return BindingEnd::WorkerExited;
                }
            }
        };

        let end = tokio::select! {
            end = inbound => end,
            end = outbox.pump(socket) => BindingEnd::Socket(end),
            _ = self.exited.cancelled() => BindingEnd::WorkerExited,
        };
        if end == BindingEnd::WorkerExited {
            // Wait for the supervisor so the final output is queued.
            let _ = tokio::time::timeout(STDOUT_DRAIN * 2, self.exited.cancelled()).await;
            let _ = outbox.flush(socket).await;
        }
        end
    }

    /// Passes `socket` to the worker, then waits for the worker to report
    /// it closed or to exit.
    #[cfg(unix)]
    async fn hand_to_worker(
        &self,
        socket: &Arc<FramedSocket>,
        control: &ControlChannel,
        reports: &tokio::sync::broadcast::Sender<SocketReport>,
    ) -> BindingEnd {
        use tokio::sync::broadcast::error::RecvError;

        let Some(handoff) = socket.hand_off().await else {
            warn!(
                "worker {:?}: socket {} cannot be handed off",
                self.pid,
                socket.id()
            );
            let end = SocketEnd::Transport("socket cannot be handed to the worker".into());
            socket.close_because(end.clone());
            return BindingEnd::Socket(socket.end_reason().unwrap_or(end));
        };

        // Subscribe first so a report that beats us back is not missed.
        let mut closed = reports.subscribe();
        let message = ControlMessage::socket(socket.id(), &handoff);
        if let Err(e) = control.send(&message, Some(&handoff.descriptor)).await {
            warn!("worker {:?}: could not pass socket {}: {e}", self.pid, socket.id());
            return BindingEnd::Socket(SocketEnd::Transport(e.to_string()));
        }
        drop(handoff);
        debug!("worker {:?} took socket {}", self.pid, socket.id());

        loop {
            tokio::select! {
                report = closed.recv() => match report {
                    Ok(report) if report.socket_id == socket.id() => {
                        return BindingEnd::Socket(if report.clean {
                            SocketEnd::PeerClosed { code: None }
                        } else {
                            SocketEnd::Eof
                        });
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        self.exited.cancelled().await;
                        return BindingEnd::WorkerExited;
                    }
                },
                _ = self.exited.cancelled() => return BindingEnd::WorkerExited,
            }
        }
    }

    /// Kills the worker (or asks the supervisor to).  Idempotent.
    pub fn shutdown(&self) {
        self.stop.cancel();
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

/// Reads the worker's control messages until it exits or is stopped.
#[cfg(unix)]
async fn read_reports(
    control: Arc<ControlChannel>,
    reports: tokio::sync::broadcast::Sender<SocketReport>,
    stop: CancellationToken,
    exited: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            r = control.recv() => r,
            _ = stop.cancelled() => return,
            _ = exited.cancelled() => return,
        };
        match received {
            Ok((ControlMessage::SocketClosed { socket_id, clean }, _)) => {
                debug!("worker reports socket {socket_id} closed (clean={clean})");
                let _ = reports.send(SocketReport { socket_id, clean });
            }
            Ok((other, _)) => debug!("ignoring control message from worker: {other:?}"),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("malformed control message from worker: {e}");
            }
            Err(e) => {
                debug!("worker control channel failed: {e}");
                return;
            }
        }
    }
}

async fn forward_stdout(
    mut stdout: ChildStdout,
    outbox: mpsc::Sender<Outbound>,
    stop: CancellationToken,
    done: CancellationToken,
) {
    let mut buf = vec![0u8; STDOUT_CHUNK];
    loop {
        let read = tokio::select! {
            r = stdout.read(&mut buf) => r,
            _ = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let sent = tokio::select! {
                    r = outbox.send(Outbound::Binary(buf[..n].to_vec())) => r,
                    _ = stop.cancelled() => break,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("worker stdout read failed: {e}");
                break;
            }
        }
    }
    done.cancel();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
