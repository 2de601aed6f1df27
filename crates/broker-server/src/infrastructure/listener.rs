//! Listener: accept loop, HTTP dispatch, and the per-socket session task.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Reading each connection's HTTP request head.
//! 3. Handing non-upgrade requests to a [`StaticResponder`].
//! 4. Upgrading WebSocket requests and running the session handshake.
//! 5. Routing the hello through the [`ConnectionRegistry`] and serving the
//!    resulting logical connection until the socket ends.
//! 6. Deciding what the end of a socket means for its logical connection
//!    (removed, Offline, or nothing).
//! 7. Closing every connection when the shutdown token is cancelled.
//!
//! # One task per socket
//!
//! Each accepted TCP connection runs in its own Tokio task, from the first
//! byte of the request head until the socket closes.  A reconnecting client
//! gets a new task; the logical connection it resumes is shared through the
//! registry.
//!
//! # What the end of a socket means
//!
//! | how the binding ended                  | effect on the logical connection |
//! |----------------------------------------|----------------------------------|
//! | client sent a Close frame              | removed and closed               |
//! | worker exited / tunnel target closed   | removed and closed               |
//! | EOF, reset, timeout, protocol error    | Offline (Tunnel: removed)        |
//! | closed locally (rebind, eviction)      | nothing; someone else decided    |
//! | worker reported the handed-off socket closed | as for a Close frame (clean) or EOF |
//!
//! # Handing sockets to workers
//!
//! When `worker_transport` is Handoff, each accepted TCP socket is
//! duplicated up front.  A ComputeProcess session passes that duplicate to
//! its worker once the handshake reply is out; every other session drops it
//! and is served here as usual, with keepalive pings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use broker_core::protocol::handshake::HandshakeError;
use broker_core::protocol::{
    bad_request_response, compute_upgrade_response, parse_request_head, ConnectionType,
    SessionHello, UpgradeRequest,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::{
    ChannelContext, ChannelDirectory, ConnectionRegistry, ResolveOutcome, Resolved,
    SessionEntry, SessionHandshake,
};
use crate::domain::{BrokerConfig, BrokerError, ConnectionState, RedactedToken};
use crate::infrastructure::compute::{CommandSpawner, ComputeConnection, WorkerParams, WorkerSpawner};
use crate::infrastructure::connection::{BindingEnd, ConnectionVariant, LogicalConnection};
use crate::infrastructure::framed_socket::{AsyncStream, Descriptor, FramedSocket, SocketOptions};
use crate::infrastructure::management::ManagementConnection;
use crate::infrastructure::session::{perform_handshake, run_keepalive, send_reply};
use crate::infrastructure::tunnel::{TunnelConnection, TunnelTarget};

const READ_CHUNK: usize = 4096;
/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ── Static responder ──────────────────────────────────────────────────────────

/// Answers plain HTTP requests (anything that is not a WebSocket upgrade).
///
/// The returned bytes are written verbatim and the connection is closed.
pub trait StaticResponder: Send + Sync + 'static {
    fn respond(&self, request: &UpgradeRequest) -> Vec<u8>;
}

/// Default responder: `404 Not Found` for everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundResponder;

impl StaticResponder for NotFoundResponder {
    fn respond(&self, _request: &UpgradeRequest) -> Vec<u8> {
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
    }
}

// ── Broker ────────────────────────────────────────────────────────────────────

/// Everything a session task needs, shared by all of them.
pub struct Broker {
    config: Arc<BrokerConfig>,
    registry: Arc<ConnectionRegistry<LogicalConnection>>,
    channels: ChannelDirectory,
    spawner: Arc<dyn WorkerSpawner>,
    static_responder: Arc<dyn StaticResponder>,
}

impl Broker {
    /// A broker with the built-in channels, a [`CommandSpawner`] for
    /// `config.worker_command`, and the 404 responder.
    pub fn new(config: BrokerConfig) -> Self {
        let spawner = CommandSpawner::new(config.worker_command.clone());
        Self {
            registry: Arc::new(ConnectionRegistry::new(config.retention)),
            config: Arc::new(config),
            channels: ChannelDirectory::new(),
            spawner: Arc::new(spawner),
            static_responder: Arc::new(NotFoundResponder),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_static_responder(mut self, responder: Arc<dyn StaticResponder>) -> Self {
        self.static_responder = responder;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<LogicalConnection>> {
        &self.registry
    }

    /// Register server channels here before clients connect.
    pub fn channels(&self) -> &ChannelDirectory {
        &self.channels
    }

    /// Runs one accepted TCP connection to completion.
    ///
    /// Same as [`handle_connection`](Self::handle_connection), except that
    /// with the Handoff transport the socket's descriptor is kept so a
    /// ComputeProcess worker can take the connection over.
    pub async fn handle_tcp_connection(&self, stream: TcpStream, peer: String) {
        let descriptor = self.duplicate_descriptor(&stream, &peer);
        self.serve_stream(stream, peer, descriptor).await;
    }

    /// Runs one accepted connection to completion.
    ///
    /// Reads the request head (bounded by `handshake_timeout`), then either
    /// upgrades it or answers it through the static responder.  Never
    /// returns an error: failures are logged and scoped to this connection.
    pub async fn handle_connection<S: AsyncStream>(&self, stream: S, peer: String) {
        self.serve_stream(stream, peer, None).await;
    }

    #[cfg(unix)]
    fn duplicate_descriptor(&self, stream: &TcpStream, peer: &str) -> Option<Descriptor> {
        use std::os::fd::AsFd;

        if self.config.worker_transport != crate::domain::WorkerTransport::Handoff {
            return None;
        }
        match stream.as_fd().try_clone_to_owned() {
            Ok(fd) => Some(fd),
            Err(e) => {
                warn!("{peer}: could not duplicate socket descriptor: {e}");
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn duplicate_descriptor(&self, _stream: &TcpStream, _peer: &str) -> Option<Descriptor> {
        None
    }

    async fn serve_stream<S: AsyncStream>(
        &self,
        mut stream: S,
        peer: String,
        descriptor: Option<Descriptor>,
    ) {
        let head = tokio::time::timeout(
            self.config.handshake_timeout,
            read_request_head(&mut stream),
        )
        .await;
        let (request, leftover) = match head {
            Ok(Ok(head)) => head,
            Ok(Err(BrokerError::MalformedHandshake(reason))) => {
                warn!("{peer}: malformed request head: {reason}");
                let _ = stream.write_all(bad_request_response()).await;
                let _ = stream.shutdown().await;
                return;
            }
            Ok(Err(e)) => {
                debug!("{peer}: connection ended before a request head: {e}");
                return;
            }
            Err(_) => {
                debug!(
                    "{peer}: no request head within {:?}",
                    self.config.handshake_timeout
                );
                return;
            }
        };

        if !wants_upgrade(&request) {
            debug!("{peer}: {} {} handed to the static responder", request.method, request.path);
            let response = self.static_responder.respond(&request);
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
            return;
        }

        match self
            .handle_upgrade(stream, request, leftover, &peer, descriptor)
            .await
        {
            Ok(()) => debug!("{peer}: socket finished"),
            Err(e) => info!("{peer}: session rejected: {e}"),
        }
    }

    /// The single entry point for an upgrade request whose head has been
    /// read.  `leftover` holds any bytes read past the head.  `descriptor`,
    /// when given, duplicates the stream's OS socket and lets a worker take
    /// the connection over.
    ///
    /// Completes the WebSocket upgrade, runs the session handshake, routes
    /// the hello through the registry, and serves the connection until the
    /// socket ends.  The socket is closed on every path out.
    ///
    /// # Errors
    ///
    /// The reason the socket was rejected before serving started.  The
    /// client has already been told (400 or an error reply).
    pub async fn handle_upgrade<S: AsyncStream>(
        &self,
        mut stream: S,
        request: UpgradeRequest,
        leftover: Vec<u8>,
        peer: &str,
        descriptor: Option<Descriptor>,
    ) -> Result<(), BrokerError> {
        // ── Step 1: WebSocket upgrade ─────────────────────────────────────────
        let upgrade = if request.method.eq_ignore_ascii_case("GET") && request.is_websocket_upgrade()
        {
            compute_upgrade_response(&request.headers).map_err(malformed)
        } else {
            Err(BrokerError::MalformedHandshake(format!(
                "{} {} is not a WebSocket upgrade",
                request.method, request.path
            )))
        };
        let upgrade = match upgrade {
            Ok(upgrade) => upgrade,
            Err(e) => {
                let _ = stream.write_all(bad_request_response()).await;
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };
        stream
            .write_all(&upgrade.response_bytes)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let socket = FramedSocket::new(
            stream,
            SocketOptions {
                compression: upgrade.compression_enabled,
                max_message_size: self.config.max_message_size,
                peer: peer.to_string(),
            },
            leftover,
        );
        let socket = Arc::new(match descriptor {
            Some(descriptor) => socket.with_descriptor(descriptor),
            None => socket,
        });
        let _close = CloseOnExit(Arc::clone(&socket));
        debug!(
            "socket {} ({peer}) upgraded, compression={}",
            socket.id(),
            upgrade.compression_enabled
        );

        // ── Step 2: Session handshake ─────────────────────────────────────────
        let handshake = perform_handshake(&socket, &self.config).await;
        if handshake.is_err() {
            send_reply(&socket, &SessionHandshake::reply_for(&handshake)).await;
        }
        let hello = handshake?;

        // ── Step 3: Route through the registry ────────────────────────────────
        let resolved = self
            .registry
            .resolve(&hello, Arc::clone(&socket), || self.create_connection(&hello));
        send_reply(&socket, &SessionHandshake::reply_for(&resolved)).await;
        let Resolved {
            connection,
            generation,
            outcome,
        } = resolved?;

        if outcome == ResolveOutcome::Created {
            self.supervise_worker(&connection);
        }
        if !connection.hands_off_sockets() {
            socket.release_descriptor().await;
            tokio::spawn(run_keepalive(
                Arc::clone(&socket),
                self.config.keepalive_interval,
                self.config.keepalive_timeout,
            ));
        }

        // ── Step 4: Serve until the binding ends ──────────────────────────────
        let end = connection.serve(&socket).await;
        let kind = connection.connection_type();
        let shown = RedactedToken(connection.token());
        match &end {
            BindingEnd::Socket(reason) if reason.is_clean() => {
                info!("{kind} connection {shown} closed by the client");
                self.registry.remove(&connection);
            }
            BindingEnd::WorkerExited | BindingEnd::TargetClosed => {
                info!("{kind} connection {shown} ended: {end:?}");
                self.registry.remove(&connection);
            }
            BindingEnd::ConnectionClosed => {}
            BindingEnd::Socket(reason) => {
                let outcome = self.registry.mark_offline(&connection, generation);
                info!("{kind} connection {shown} socket dropped ({reason}): {outcome:?}");
                // The worker may have exited while this socket was dying; the
                // supervisor leaves an Online connection to us.
                if connection.is_finished() {
                    self.registry.remove(&connection);
                }
            }
        }
        Ok(())
    }

    /// Builds the variant for a fresh hello.  Runs inside the registry's
    /// bucket lock, so it only does quick, synchronous work.
    fn create_connection(&self, hello: &SessionHello) -> Result<LogicalConnection, BrokerError> {
        let id = Uuid::new_v4();
        let variant = match hello.connection_type {
            ConnectionType::Management => {
                let ctx = ChannelContext {
                    connection_id: id,
                    peer_version: hello.peer_version.clone(),
                    args: hello.extra_args.clone(),
                };
                ConnectionVariant::Management(ManagementConnection::new(
                    ctx,
                    &self.channels,
                    self.config.outbox_capacity,
                ))
            }
            ConnectionType::ComputeProcess => {
                let params = WorkerParams {
                    connection_id: id,
                    token: hello.reconnection_token.clone(),
                    peer_version: hello.peer_version.clone(),
                    args: hello.extra_args.clone(),
                };
                let compute = ComputeConnection::spawn(
                    self.spawner.as_ref(),
                    &params,
                    self.config.outbox_capacity,
                    self.config.worker_transport,
                )
                .map_err(|e| BrokerError::SpawnFailure(e.to_string()))?;
                debug!("connection {id} runs worker pid {:?}", compute.pid());
                ConnectionVariant::ComputeProcess(compute)
            }
            ConnectionType::Tunnel => {
                let target = TunnelTarget::from_args(&hello.extra_args)?;
                ConnectionVariant::Tunnel(TunnelConnection::new(target))
            }
        };
        Ok(LogicalConnection::new(
            id,
            hello.reconnection_token.clone(),
            variant,
        ))
    }

    /// Removes a ComputeProcess connection when its worker exits on its own.
    ///
    /// While the connection is Online its session task does the removal
    /// after flushing the worker's last output, so the supervisor only acts
    /// on an Offline connection.
    fn supervise_worker(&self, connection: &Arc<LogicalConnection>) {
        let ConnectionVariant::ComputeProcess(compute) = connection.variant() else {
            return;
        };
        let registry = Arc::downgrade(&self.registry);
        let weak = Arc::downgrade(connection);
        compute.supervise(move |code| {
            let (Some(registry), Some(connection)) = (registry.upgrade(), weak.upgrade()) else {
                return;
            };
            if connection.state() == ConnectionState::Online {
                debug!(
                    "worker for connection {} exited ({code:?}) while Online",
                    connection.id()
                );
                return;
            }
            info!(
                "worker for connection {} exited ({code:?}); removing it",
                connection.id()
            );
            registry.remove(&connection);
        });
    }
}

/// Closes the socket when the session task leaves `handle_upgrade`,
/// including by panic or cancellation.
struct CloseOnExit(Arc<FramedSocket>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn malformed(e: HandshakeError) -> BrokerError {
    match e {
        HandshakeError::MalformedHandshake(reason) => BrokerError::MalformedHandshake(reason),
        other => BrokerError::MalformedHandshake(other.to_string()),
    }
}

/// `true` when the client asked for any kind of upgrade.  Such requests
/// are answered with 400 if they are not a usable WebSocket upgrade, rather
/// than being served as static content.
fn wants_upgrade(request: &UpgradeRequest) -> bool {
    let connection_upgrade = request
        .headers
        .get("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade
        || request.headers.get("upgrade").is_some()
        || request.headers.get("sec-websocket-key").is_some()
}

/// Buffers until a complete request head has arrived.
///
/// Returns the parsed head and whatever bytes followed it.
async fn read_request_head<S: AsyncStream>(
    stream: &mut S,
) -> Result<(UpgradeRequest, Vec<u8>), BrokerError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(BrokerError::Transport(format!(
                "EOF after {} bytes of request head",
                buf.len()
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_request_head(&buf) {
            Ok((request, consumed)) => return Ok((request, buf.split_off(consumed))),
            Err(HandshakeError::InsufficientData { .. }) => continue,
            Err(e) => return Err(malformed(e)),
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Binds `broker.config().bind_addr` and runs [`run_server_on`].
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (port in use, missing
/// permission).
pub async fn run_server(broker: Arc<Broker>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = broker.config().bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind session broker listener on {addr}"))?;
    info!("session broker listening on {addr}");
    run_server_on(listener, broker, shutdown).await
}

/// Accepts connections on `listener` until `shutdown` is cancelled, then
/// closes every logical connection.
///
/// Each connection is handed to its own task so that one slow client never
/// blocks the others.
///
/// # Errors
///
/// Returns an error before accepting anything if the broker's config fails
/// [`BrokerConfig::validate`].
pub async fn run_server_on(
    listener: TcpListener,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    broker
        .config()
        .validate()
        .context("refusing to start with an invalid configuration")?;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested; stopping accept loop");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                let _ = stream.set_nodelay(true);
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    broker.handle_tcp_connection(stream, peer.to_string()).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    broker.registry().close_all();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
