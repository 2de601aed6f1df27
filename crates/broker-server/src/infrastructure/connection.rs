//! LogicalConnection: one client session, independent of its socket.
//!
//! A logical connection is a tagged union of three variants that share one
//! lifecycle (bind, go offline, close):
//!
//! | variant        | what flows over the socket                          |
//! |----------------|-----------------------------------------------------|
//! | Management     | channel-router JSON (calls, events)                 |
//! | ComputeProcess | nothing once the socket is handed to the worker, or worker stdin/stdout |
//! | Tunnel         | raw bytes relayed to a TCP target                   |
//!
//! # Binding generations (for beginners)
//!
//! Each time a socket is bound the connection's *generation* increases.
//! The task serving a socket remembers the generation it was started with.
//! When that socket later dies, the task reports "generation N went
//! offline"; if the client has already reconnected (generation N+1), the
//! report is stale and ignored.  Without this, a slow old task could mark a
//! freshly reconnected session Offline.

use std::sync::Arc;
use std::time::Instant;

use broker_core::protocol::ConnectionType;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::application::SessionEntry;
use crate::domain::{ConnectionState, Outbound};
use crate::infrastructure::compute::ComputeConnection;
use crate::infrastructure::framed_socket::{FramedSocket, SocketEnd};
use crate::infrastructure::management::ManagementConnection;
use crate::infrastructure::tunnel::TunnelConnection;

// ── Outbox ────────────────────────────────────────────────────────────────────

struct OutboxQueue {
    rx: mpsc::Receiver<Outbound>,
    /// A message whose send failed; it goes out first on the next socket.
    pending: Option<Outbound>,
}

/// Bounded outbound queue that outlives any single socket.
///
/// Producers (router tasks, the worker's stdout reader) only ever see the
/// `mpsc::Sender`.  Whichever socket is currently bound runs
/// [`pump`](Outbox::pump) to drain the queue into it.  While the connection
/// is Offline nobody pumps, the queue fills, and producers wait.
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    queue: Mutex<OutboxQueue>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            queue: Mutex::new(OutboxQueue { rx, pending: None }),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.tx.clone()
    }

    /// Drains the queue into `socket` until the socket ends.
    ///
    /// Only one pump runs at a time; a pump for a newer socket waits until
    /// the previous socket has been closed and its pump has returned.
    pub async fn pump(&self, socket: &FramedSocket) -> SocketEnd {
        let mut queue = tokio::select! {
            q = self.queue.lock() => q,
            _ = socket.closed() => return ended(socket),
        };
        loop {
            let message = match queue.pending.take() {
                Some(message) => message,
                None => tokio::select! {
                    m = queue.rx.recv() => match m {
                        Some(message) => message,
                        None => return SocketEnd::Local,
                    },
                    _ = socket.closed() => return ended(socket),
                },
            };
            if let Err(end) = send_outbound(socket, &message).await {
                queue.pending = Some(message);
                return end;
            }
        }
    }

    /// Sends whatever is queued right now, then returns.
    pub async fn flush(&self, socket: &FramedSocket) -> Result<(), SocketEnd> {
        let mut queue = self.queue.lock().await;
        loop {
            let message = match queue.pending.take() {
                Some(message) => message,
                None => match queue.rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => return Ok(()),
                },
            };
            if let Err(end) = send_outbound(socket, &message).await {
                queue.pending = Some(message);
                return Err(end);
            }
        }
    }
}

fn ended(socket: &FramedSocket) -> SocketEnd {
    socket.end_reason().unwrap_or(SocketEnd::Local)
}

async fn send_outbound(socket: &FramedSocket, message: &Outbound) -> Result<(), SocketEnd> {
    match message {
        Outbound::Text(text) => socket.send_text(text).await,
        Outbound::Binary(bytes) => socket.send(bytes).await,
    }
}

// ── Variants ──────────────────────────────────────────────────────────────────

/// Variant-specific state of a logical connection.
pub enum ConnectionVariant {
    Management(ManagementConnection),
    ComputeProcess(ComputeConnection),
    Tunnel(TunnelConnection),
}

impl ConnectionVariant {
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            ConnectionVariant::Management(_) => ConnectionType::Management,
            ConnectionVariant::ComputeProcess(_) => ConnectionType::ComputeProcess,
            ConnectionVariant::Tunnel(_) => ConnectionType::Tunnel,
        }
    }
}

/// Why serving one binding stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEnd {
    /// The socket ended; see [`SocketEnd::is_clean`].
    Socket(SocketEnd),
    /// The ComputeProcess worker exited.
    WorkerExited,
    /// The Tunnel target closed or could not be reached.
    TargetClosed,
    /// The logical connection was closed from elsewhere.
    ConnectionClosed,
}

struct Binding {
    state: ConnectionState,
    socket: Option<Arc<FramedSocket>>,
    generation: u64,
    last_seen_online_at: Option<Instant>,
}

/// One client session.
pub struct LogicalConnection {
    id: Uuid,
    token: String,
    kind: ConnectionType,
    created_at: Instant,
    binding: parking_lot::Mutex<Binding>,
    variant: ConnectionVariant,
}

impl LogicalConnection {
    /// A new connection in state Connecting.
    pub fn new(id: Uuid, token: impl Into<String>, variant: ConnectionVariant) -> Self {
        Self {
            id,
            token: token.into(),
            kind: variant.connection_type(),
            created_at: Instant::now(),
            binding: parking_lot::Mutex::new(Binding {
                state: ConnectionState::Connecting,
                socket: None,
                generation: 0,
                last_seen_online_at: None,
            }),
            variant,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn variant(&self) -> &ConnectionVariant {
        &self.variant
    }

    /// The socket bound right now, if any.
    pub fn current_socket(&self) -> Option<Arc<FramedSocket>> {
        self.binding.lock().socket.clone()
    }

    pub fn generation(&self) -> u64 {
        self.binding.lock().generation
    }

    /// When the connection was last Online (bound or going Offline).
    pub fn last_seen_online_at(&self) -> Option<Instant> {
        self.binding.lock().last_seen_online_at
    }

    /// `true` once the variant can no longer serve anyone: its worker has
    /// exited.  Such a connection is removed rather than kept Offline.
    pub fn is_finished(&self) -> bool {
        match &self.variant {
            ConnectionVariant::ComputeProcess(c) => c.has_exited(),
            ConnectionVariant::Management(_) | ConnectionVariant::Tunnel(_) => false,
        }
    }

    /// `true` when bound sockets are passed to a worker process instead of
    /// being served here.  The broker then sends no keepalive pings.
    pub fn hands_off_sockets(&self) -> bool {
        match &self.variant {
            ConnectionVariant::ComputeProcess(c) => c.hands_off_sockets(),
            ConnectionVariant::Management(_) | ConnectionVariant::Tunnel(_) => false,
        }
    }

    /// Serves `socket` until it ends or the variant stops.
    pub async fn serve(&self, socket: &Arc<FramedSocket>) -> BindingEnd {
        match &self.variant {
            ConnectionVariant::Management(m) => m.serve(socket).await,
            ConnectionVariant::ComputeProcess(c) => c.serve(socket).await,
            ConnectionVariant::Tunnel(t) => t.serve(socket).await,
        }
    }
}

impl SessionEntry for LogicalConnection {
    type Socket = Arc<FramedSocket>;

    fn token(&self) -> &str {
        &self.token
    }

    fn connection_type(&self) -> ConnectionType {
        self.kind
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn state(&self) -> ConnectionState {
        self.binding.lock().state
    }

    fn bind(&self, socket: Arc<FramedSocket>) -> u64 {
        let mut binding = self.binding.lock();
        if !binding.state.can_transition_to(ConnectionState::Online) {
            debug!("connection {}: bind refused in state {}", self.id, binding.state);
            socket.close();
            return binding.generation;
        }
        if let Some(old) = binding.socket.replace(socket) {
            old.close();
        }
        binding.generation += 1;
        binding.state = ConnectionState::Online;
        binding.last_seen_online_at = Some(Instant::now());
        binding.generation
    }

    fn go_offline(&self, generation: u64) -> bool {
        let mut binding = self.binding.lock();
        if binding.generation != generation || binding.state != ConnectionState::Online {
            return false;
        }
        binding.state = ConnectionState::Offline;
        binding.last_seen_online_at = Some(Instant::now());
        if let Some(socket) = binding.socket.take() {
            socket.close();
        }
        true
    }

    fn close(&self) {
        let socket = {
            let mut binding = self.binding.lock();
            if binding.state == ConnectionState::Closed {
                return;
            }
            binding.state = ConnectionState::Closed;
            binding.socket.take()
        };
        if let Some(socket) = socket {
            socket.close();
        }
        match &self.variant {
            ConnectionVariant::Management(m) => m.shutdown(),
            ConnectionVariant::ComputeProcess(c) => c.shutdown(),
            ConnectionVariant::Tunnel(t) => t.shutdown(),
        }
        debug!("connection {} released", self.id);
    }

    fn supports_reconnection(&self) -> bool {
        !matches!(self.variant, ConnectionVariant::Tunnel(_))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use broker_core::protocol::{decode_frame, Frame, FrameError, Opcode};
    use serde_json::Map;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::application::{ChannelContext, ChannelDirectory};
    use crate::infrastructure::framed_socket::SocketOptions;
    use crate::infrastructure::tunnel::TunnelTarget;

    fn socket() -> (Arc<FramedSocket>, DuplexStream) {
        let (server, client) = tokio::io::duplex(16 * 1024);
        (
            Arc::new(FramedSocket::new(server, SocketOptions::default(), Vec::new())),
            client,
        )
    }

    async fn read_frame(client: &mut DuplexStream, buf: &mut Vec<u8>) -> Option<Frame> {
        loop {
            match decode_frame(buf) {
                Ok((frame, n)) => {
                    buf.drain(..n);
                    return Some(frame);
                }
                Err(FrameError::InsufficientData { .. }) => {}
                Err(e) => panic!("invalid server frame: {e}"),
            }
            let mut tmp = [0u8; 1024];
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut tmp))
                .await
                .expect("server output within 2s")
                .unwrap();
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    fn management() -> LogicalConnection {
        let ctx = ChannelContext {
            connection_id: Uuid::new_v4(),
            peer_version: "abc".into(),
            args: Map::new(),
        };
        let variant = ManagementConnection::new(ctx, &ChannelDirectory::new(), 16);
        LogicalConnection::new(Uuid::new_v4(), "t1", ConnectionVariant::Management(variant))
    }

    #[tokio::test]
    async fn test_bind_moves_to_online_and_closes_previous_socket() {
        // Arrange
        let conn = management();
        let (first, _c1) = socket();
        let (second, _c2) = socket();

        // Act
        let g1 = conn.bind(Arc::clone(&first));
        let g2 = conn.bind(Arc::clone(&second));

        // Assert
        assert_eq!((g1, g2), (1, 2));
        assert_eq!(conn.state(), ConnectionState::Online);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(conn.current_socket().unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_go_offline_requires_current_generation() {
        let conn = management();
        let (first, _c1) = socket();
        let (second, _c2) = socket();
        let g1 = conn.bind(first);
        let g2 = conn.bind(second);

        assert!(!conn.go_offline(g1), "stale generation");
        assert!(conn.go_offline(g2));
        assert!(!conn.go_offline(g2), "already offline");
        assert_eq!(conn.state(), ConnectionState::Offline);
        assert!(conn.current_socket().is_none());
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        // Arrange
        let conn = management();
        let (s, _c) = socket();
        conn.bind(Arc::clone(&s));

        // Act
        conn.close();
        conn.close();
        let (late, _c2) = socket();
        conn.bind(Arc::clone(&late));

        // Assert
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(s.is_closed());
        assert!(late.is_closed(), "a closed connection refuses new sockets");
        let ConnectionVariant::Management(m) = conn.variant() else {
            unreachable!()
        };
        assert_eq!(m.router().subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_tunnel_is_not_reconnectable() {
        let target = TunnelTarget {
            host: "127.0.0.1".into(),
            port: 1,
        };
        let conn = LogicalConnection::new(
            Uuid::new_v4(),
            "tun",
            ConnectionVariant::Tunnel(TunnelConnection::new(target)),
        );
        assert_eq!(conn.connection_type(), ConnectionType::Tunnel);
        assert!(!conn.supports_reconnection());
        assert!(management().supports_reconnection());
    }

    #[tokio::test]
    async fn test_outbox_survives_socket_swap() {
        // Arrange: a message queued while no socket is bound.
        let outbox = Outbox::new(8);
        outbox
            .sender()
            .send(Outbound::Text("queued".into()))
            .await
            .unwrap();
        let (first, _c1) = socket();
        first.close();
        assert_eq!(outbox.pump(&first).await, SocketEnd::Local);

        // Act: the next socket drains it.
        let (second, mut client) = socket();
        let pump = {
            let second = Arc::clone(&second);
            async move { outbox.pump(&second).await }
        };
        let pump = tokio::spawn(pump);

        // Assert
        let mut buf = Vec::new();
        let frame = read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"queued");
        second.close();
        assert_eq!(pump.await.unwrap(), SocketEnd::Local);
    }

    #[tokio::test]
    async fn test_outbox_flush_sends_only_what_is_queued() {
        let outbox = Outbox::new(8);
        let tx = outbox.sender();
        tx.send(Outbound::Binary(vec![1])).await.unwrap();
        tx.send(Outbound::Binary(vec![2])).await.unwrap();
        let (s, mut client) = socket();

        outbox.flush(&s).await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(read_frame(&mut client, &mut buf).await.unwrap().payload, vec![1]);
        assert_eq!(read_frame(&mut client, &mut buf).await.unwrap().payload, vec![2]);
    }
}
