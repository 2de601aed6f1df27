//! WebSocket message framing over any async byte stream.
//!
//! [`FramedSocket`] turns an upgraded TCP stream (or, in tests, an in-memory
//! duplex pipe) into whole messages in both directions.
//!
//! # Binary streaming (for beginners)
//!
//! TCP is a *stream* protocol: a single `read()` may return half a frame, or
//! three frames at once.  The socket appends every read to a receive buffer
//! and asks [`decode_frame_limited`] for the first complete frame.  When the
//! decoder answers `InsufficientData`, the socket reads again; it never hands
//! out a partial message.
//!
//! Messages split across several frames (fragmentation) are reassembled
//! before they are returned.  Control frames are answered inline:
//!
//! | frame  | reaction                                                    |
//! |--------|-------------------------------------------------------------|
//! | Ping   | reply with a Pong carrying the same payload                 |
//! | Pong   | only refreshes the activity timestamp                       |
//! | Close  | echo a Close and end the socket with [`SocketEnd::PeerClosed`] |
//!
//! # Concurrency
//!
//! Reading and writing use separate locks, so one task can wait in
//! [`recv`](FramedSocket::recv) while others call [`send`](FramedSocket::send).
//! Closing cancels a `CancellationToken` that every pending read and write
//! also waits on, so nothing stays blocked on a socket that is going away.
//!
//! # Handing a socket to another process
//!
//! A socket built [`with_descriptor`](FramedSocket::with_descriptor) keeps a
//! duplicate of its OS descriptor.  [`hand_off`](FramedSocket::hand_off)
//! then stops all local I/O without sending a Close frame and returns the
//! descriptor together with the undecoded bytes and the inflate history, so
//! a worker process can continue the same WebSocket connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use broker_core::protocol::frame::{decode_frame_limited, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use broker_core::protocol::{encode_frame, Frame, FrameError, MessageDeflater, MessageInflater, Opcode};
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// How long a closing socket may spend delivering its Close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Anything the socket can run over: TCP streams, duplex pipes, mocks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

/// Type-erased stream so that one `FramedSocket` type serves every transport.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Why a socket stopped.  Every `recv`/`send` on an ended socket returns the
/// first reason recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketEnd {
    /// The client sent a Close frame: an explicit, clean close.
    #[error("peer closed the connection (code {code:?})")]
    PeerClosed { code: Option<u16> },

    /// The stream reached EOF without a Close frame.
    #[error("connection reset or EOF")]
    Eof,

    #[error("transport error: {0}")]
    Transport(String),

    /// The client broke the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Keepalive saw no inbound traffic for this long.
    #[error("no traffic for {0:?}")]
    Timeout(Duration),

    /// Closed by this process (rebind, eviction, shutdown).
    #[error("closed locally")]
    Local,

    /// Given to a worker process; the connection itself is still open.
    #[error("handed off to a worker")]
    HandedOff,
}

impl SocketEnd {
    /// `true` only for an explicit close by the client.
    pub fn is_clean(&self) -> bool {
        matches!(self, SocketEnd::PeerClosed { .. })
    }

    /// Whether a Close frame can still be written in reply.
    fn peer_reachable(&self) -> bool {
        !matches!(self, SocketEnd::Eof | SocketEnd::Transport(_))
    }
}

/// Duplicate of the OS socket behind a stream.
#[cfg(unix)]
pub type Descriptor = std::os::fd::OwnedFd;

/// Descriptors cannot be passed between processes on this platform.
#[cfg(not(unix))]
#[derive(Debug)]
pub enum Descriptor {}

/// What a worker needs to continue a socket this process let go of.
#[derive(Debug)]
pub struct SocketHandoff {
    pub descriptor: Descriptor,
    /// Bytes read from the stream but not decoded yet.
    pub buffered: Vec<u8>,
    /// permessage-deflate was negotiated.
    pub compression: bool,
    /// Compressed client messages inflated so far, oldest first.  Feeding
    /// them through a fresh inflater rebuilds the client's deflate context.
    pub inflate_history: Vec<Vec<u8>>,
}

/// Per-socket settings decided during the upgrade.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// permessage-deflate was negotiated.
    pub compression: bool,
    /// Largest reassembled (and inflated) message accepted.
    pub max_message_size: usize,
    /// Remote address, for logs.
    pub peer: String,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            compression: false,
            max_message_size: 16 * 1024 * 1024,
            peer: "unknown".to_string(),
        }
    }
}

struct PartialMessage {
    compressed: bool,
    data: Vec<u8>,
}

struct FrameReader {
    /// `None` once the socket has been handed off.
    half: Option<ReadHalf<BoxedStream>>,
    buf: Vec<u8>,
    inflater: Option<MessageInflater>,
    partial: Option<PartialMessage>,
    /// Recorded only while a descriptor is kept for a hand-off.
    inflate_history: Option<Vec<Vec<u8>>>,
}

struct FrameWriter {
    half: Option<WriteHalf<BoxedStream>>,
    deflater: Option<MessageDeflater>,
    /// A write was cancelled part-way; the frame stream is no longer valid.
    interrupted: bool,
}

/// A WebSocket connection that sends and receives whole messages.
pub struct FramedSocket {
    id: Uuid,
    peer: String,
    max_message_size: usize,
    compression: bool,
    reader: Mutex<FrameReader>,
    writer: Arc<Mutex<FrameWriter>>,
    closed: CancellationToken,
    closing: AtomicBool,
    end: parking_lot::Mutex<Option<SocketEnd>>,
    last_activity: parking_lot::Mutex<Instant>,
    descriptor: parking_lot::Mutex<Option<Descriptor>>,
}

impl FramedSocket {
    /// Wraps an already-upgraded stream.
    ///
    /// `leftover` holds bytes read together with the HTTP request head; they
    /// are the start of the WebSocket stream and are decoded first.
    pub fn new(stream: impl AsyncStream, options: SocketOptions, leftover: Vec<u8>) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let SocketOptions {
            compression,
            max_message_size,
            peer,
        } = options;

        Self {
            id: Uuid::new_v4(),
            peer,
            max_message_size,
            compression,
            reader: Mutex::new(FrameReader {
                half: Some(read_half),
                buf: leftover,
                inflater: compression.then(|| MessageInflater::new(max_message_size)),
                partial: None,
                inflate_history: None,
            }),
            writer: Arc::new(Mutex::new(FrameWriter {
                half: Some(write_half),
                deflater: compression.then(MessageDeflater::new),
                interrupted: false,
            })),
            closed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            end: parking_lot::Mutex::new(None),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            descriptor: parking_lot::Mutex::new(None),
        }
    }

    /// Keeps `descriptor` (a duplicate of the stream's OS socket) so the
    /// connection can be given away later with [`hand_off`](Self::hand_off).
    /// Until then every compressed client message is remembered.
    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        *self.descriptor.get_mut() = Some(descriptor);
        self.reader.get_mut().inflate_history = Some(Vec::new());
        self
    }

    /// Drops the kept descriptor and stops recording; this socket stays
    /// with the broker for good.
    pub async fn release_descriptor(&self) {
        self.descriptor.lock().take();
        self.reader.lock().await.inflate_history = None;
    }

    /// Lets go of the socket without closing the connection.
    ///
    /// Nothing more is read or written here, no Close frame is sent, and
    /// the local stream is dropped; the returned descriptor keeps the
    /// connection alive.  The socket ends with [`SocketEnd::HandedOff`].
    ///
    /// Returns `None` when no descriptor was kept, the socket has already
    /// ended, or a message is half received or half sent.
    pub async fn hand_off(&self) -> Option<SocketHandoff> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if self.closed.is_cancelled() || reader.partial.is_some() || writer.interrupted {
            return None;
        }
        let descriptor = self.descriptor.lock().take()?;

        self.closing.store(true, Ordering::SeqCst);
        self.record_end(SocketEnd::HandedOff);
        self.closed.cancel();
        reader.half = None;
        writer.half = None;
        debug!("socket {} ({}) handed off", self.id, self.peer);

        Some(SocketHandoff {
            descriptor,
            buffered: std::mem::take(&mut reader.buf),
            compression: self.compression,
            inflate_history: reader.inflate_history.take().unwrap_or_default(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Sends one binary message.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SocketEnd> {
        self.write_frame(Frame::new(Opcode::Binary, payload.to_vec()), true)
            .await
    }

    /// Sends one text message.
    pub async fn send_text(&self, text: &str) -> Result<(), SocketEnd> {
        self.write_frame(Frame::text(text), true).await
    }

    /// Sends a Ping control frame.
    pub async fn ping(&self) -> Result<(), SocketEnd> {
        self.write_frame(Frame::ping(Vec::new()), false).await
    }

    async fn write_frame(&self, mut frame: Frame, compressible: bool) -> Result<(), SocketEnd> {
        if self.closed.is_cancelled() {
            return Err(self.end_or_local());
        }
        let mut writer = tokio::select! {
            w = self.writer.lock() => w,
            _ = self.closed.cancelled() => return Err(self.end_or_local()),
        };

        if compressible {
            if let Some(deflater) = writer.deflater.as_mut() {
                match deflater.compress(&frame.payload) {
                    Ok(compressed) => {
                        frame.payload = compressed;
                        frame.rsv1 = true;
                    }
                    Err(e) => {
                        drop(writer);
                        return Err(self.finish(SocketEnd::Protocol(e.to_string())));
                    }
                }
            }
        }
        let bytes = encode_frame(&frame);

        let FrameWriter {
            half, interrupted, ..
        } = &mut *writer;
        let Some(half) = half.as_mut() else {
            return Err(self.end_or_local());
        };
        *interrupted = true;
        let result = tokio::select! {
            r = async {
                match half.write_all(&bytes).await {
                    Ok(()) => half.flush().await,
                    Err(e) => Err(e),
                }
            } => r,
            _ = self.closed.cancelled() => return Err(self.end_or_local()),
        };
        match result {
            Ok(()) => {
                writer.interrupted = false;
                trace!("socket {}: sent {:?} ({} bytes)", self.id, frame.opcode, bytes.len());
                Ok(())
            }
            Err(e) => {
                drop(writer);
                Err(self.finish(SocketEnd::Transport(e.to_string())))
            }
        }
    }

    // ── Receiving ─────────────────────────────────────────────────────────────

    /// Waits for the next complete message.
    ///
    /// Returns `Err` once the socket has ended, and keeps returning the same
    /// reason on every later call.
    pub async fn recv(&self) -> Result<Vec<u8>, SocketEnd> {
        if self.closed.is_cancelled() {
            return Err(self.end_or_local());
        }
        let mut guard = tokio::select! {
            g = self.reader.lock() => g,
            _ = self.closed.cancelled() => return Err(self.end_or_local()),
        };
        let reader = &mut *guard;

        loop {
            match decode_frame_limited(&reader.buf, self.max_message_size) {
                Ok((frame, consumed)) => {
                    reader.buf.drain(..consumed);
                    self.touch();
                    if let Some(message) = self.handle_frame(reader, frame).await? {
                        return Ok(message);
                    }
                    continue;
                }
                Err(FrameError::InsufficientData { .. }) => {}
                Err(e) => {
                    return Err(self.fail(SocketEnd::Protocol(e.to_string()), CLOSE_PROTOCOL_ERROR))
                }
            }

            let FrameReader { half, buf, .. } = &mut *reader;
            let Some(half) = half.as_mut() else {
                return Err(self.end_or_local());
            };
            let read = tokio::select! {
                r = half.read_buf(buf) => r,
                _ = self.closed.cancelled() => return Err(self.end_or_local()),
            };
            match read {
                Ok(0) => return Err(self.finish(SocketEnd::Eof)),
                Ok(_) => {}
                Err(e) => return Err(self.finish(SocketEnd::Transport(e.to_string()))),
            }
        }
    }

    /// Processes one decoded frame.  Returns a message when one is complete.
    async fn handle_frame(
        &self,
        reader: &mut FrameReader,
        frame: Frame,
    ) -> Result<Option<Vec<u8>>, SocketEnd> {
        if !frame.masked {
            return Err(self.protocol_error("client frame not masked"));
        }

        match frame.opcode {
            Opcode::Ping => {
                // A failed pong surfaces on the next read or write.
                let _ = self.write_frame(Frame::pong(frame.payload), false).await;
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                let code = frame.close_code();
                debug!("socket {}: peer sent close (code {:?})", self.id, code);
                Err(self.fail(SocketEnd::PeerClosed { code }, code.unwrap_or(CLOSE_NORMAL)))
            }
            Opcode::Text | Opcode::Binary => {
                if reader.partial.is_some() {
                    return Err(self.protocol_error("new message before previous one finished"));
                }
                if frame.rsv1 && reader.inflater.is_none() {
                    return Err(self.protocol_error("compressed frame without negotiation"));
                }
                if frame.fin {
                    return self.complete(reader, frame.rsv1, frame.payload).map(Some);
                }
                reader.partial = Some(PartialMessage {
                    compressed: frame.rsv1,
                    data: frame.payload,
                });
                Ok(None)
            }
            Opcode::Continuation => {
                let Some(partial) = reader.partial.as_mut() else {
                    return Err(self.protocol_error("continuation without a message"));
                };
                if partial.data.len() + frame.payload.len() > self.max_message_size {
                    return Err(self.protocol_error("message too large"));
                }
                partial.data.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                match reader.partial.take() {
                    Some(done) => self.complete(reader, done.compressed, done.data).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn complete(
        &self,
        reader: &mut FrameReader,
        compressed: bool,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, SocketEnd> {
        if !compressed {
            return Ok(data);
        }
        if let Some(history) = reader.inflate_history.as_mut() {
            history.push(data.clone());
        }
        match reader.inflater.as_mut() {
            Some(inflater) => inflater
                .decompress(&data)
                .map_err(|e| self.protocol_error(&e.to_string())),
            None => Err(self.protocol_error("compressed frame without negotiation")),
        }
    }

    /// All remaining messages as a lazy stream.  The stream ends when the
    /// socket does and cannot be restarted.
    pub fn messages(self: &Arc<Self>) -> BoxStream<'static, Vec<u8>> {
        stream::unfold(Arc::clone(self), |socket| async move {
            match socket.recv().await {
                Ok(message) => Some((message, socket)),
                Err(_) => None,
            }
        })
        .boxed()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Closes the socket.  Safe to call any number of times from any task.
    pub fn close(&self) {
        self.record_end(SocketEnd::Local);
        self.shutdown(CLOSE_NORMAL);
    }

    /// Ends the socket with a specific reason (e.g. keepalive timeout).
    pub fn close_because(&self, end: SocketEnd) {
        self.record_end(end);
        self.shutdown(CLOSE_NORMAL);
    }

    /// Resolves once the socket has been closed for any reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// The reason the socket ended, or `None` while it is open.
    pub fn end_reason(&self) -> Option<SocketEnd> {
        self.end.lock().clone()
    }

    /// Time since the last frame of any kind arrived.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Stores `end` unless a reason was already recorded; returns the
    /// reason that is in effect.
    fn record_end(&self, end: SocketEnd) -> SocketEnd {
        self.end.lock().get_or_insert(end).clone()
    }

    fn end_or_local(&self) -> SocketEnd {
        self.record_end(SocketEnd::Local)
    }

    fn finish(&self, end: SocketEnd) -> SocketEnd {
        let end = self.record_end(end);
        self.shutdown(CLOSE_NORMAL);
        end
    }

    fn fail(&self, end: SocketEnd, code: u16) -> SocketEnd {
        let end = self.record_end(end);
        self.shutdown(code);
        end
    }

    fn protocol_error(&self, reason: &str) -> SocketEnd {
        debug!("socket {} ({}): {reason}", self.id, self.peer);
        self.fail(SocketEnd::Protocol(reason.to_string()), CLOSE_PROTOCOL_ERROR)
    }

    /// Cancels pending I/O once, then writes a Close frame (when the peer
    /// can still receive one) and shuts the write half down in the
    /// background.
    fn shutdown(&self, code: u16) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        let send_close = self
            .end
            .lock()
            .as_ref()
            .map_or(true, SocketEnd::peer_reachable);
        let writer = Arc::clone(&self.writer);
        let id = self.id;
        let task = async move {
            let mut w = writer.lock().await;
            let interrupted = w.interrupted;
            let Some(half) = w.half.as_mut() else {
                return;
            };
            if send_close && !interrupted {
                let bytes = encode_frame(&Frame::close(code, ""));
                let _ = tokio::time::timeout(CLOSE_GRACE, half.write_all(&bytes)).await;
            }
            let _ = tokio::time::timeout(CLOSE_GRACE, half.shutdown()).await;
            debug!("socket {id} shut down");
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => debug!("socket {id} closed outside a runtime; stream dropped with the socket"),
        }
    }
}

impl std::fmt::Debug for FramedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("compression", &self.compression)
            .field("end", &self.end_reason())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::protocol::{decode_frame, encode_frame_masked};
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn masked(frame: &Frame) -> Vec<u8> {
        encode_frame_masked(frame, MASK)
    }

    fn fragment(opcode: Opcode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            rsv1: false,
            opcode,
            masked: false,
            payload: payload.to_vec(),
        }
    }

    fn pair(options: SocketOptions) -> (Arc<FramedSocket>, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        (Arc::new(FramedSocket::new(server, options, Vec::new())), client)
    }

    /// Reads one server frame from the client end, or `None` on EOF.
    async fn read_frame(client: &mut DuplexStream, buf: &mut Vec<u8>) -> Option<Frame> {
        loop {
            match decode_frame(buf) {
                Ok((frame, n)) => {
                    buf.drain(..n);
                    return Some(frame);
                }
                Err(FrameError::InsufficientData { .. }) => {}
                Err(e) => panic!("server sent an invalid frame: {e}"),
            }
            let mut tmp = [0u8; 4096];
            let n = timeout(Duration::from_secs(2), client.read(&mut tmp))
                .await
                .expect("server output within 2s")
                .unwrap();
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    #[tokio::test]
    async fn test_partial_reads_yield_one_whole_message() {
        // Arrange: one 300-byte message delivered in three uneven reads.
        let payload = vec![7u8; 300];
        let wire = masked(&Frame::binary(payload.clone()));
        let mock = tokio_test::io::Builder::new()
            .read(&wire[..1])
            .read(&wire[1..5])
            .read(&wire[5..])
            .build();
        let socket = FramedSocket::new(mock, SocketOptions::default(), Vec::new());

        // Act
        let message = socket.recv().await.unwrap();

        // Assert
        assert_eq!(message, payload);
    }

    #[tokio::test]
    async fn test_coalesced_frames_yield_separate_messages() {
        // Arrange: two messages arrive in a single read.
        let mut wire = masked(&Frame::text("first"));
        wire.extend(masked(&Frame::binary(b"second".to_vec())));
        let mock = tokio_test::io::Builder::new().read(&wire).build();
        let socket = FramedSocket::new(mock, SocketOptions::default(), Vec::new());

        // Act / Assert
        assert_eq!(socket.recv().await.unwrap(), b"first");
        assert_eq!(socket.recv().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_leftover_bytes_are_decoded_first() {
        // Arrange: the first frame was read together with the HTTP head.
        let leftover = masked(&Frame::text("early"));
        let rest = masked(&Frame::text("late"));
        let mock = tokio_test::io::Builder::new().read(&rest).build();
        let socket = FramedSocket::new(mock, SocketOptions::default(), leftover);

        // Act / Assert
        assert_eq!(socket.recv().await.unwrap(), b"early");
        assert_eq!(socket.recv().await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_fragments_are_reassembled_around_a_ping() {
        // Arrange
        let (socket, mut client) = pair(SocketOptions::default());
        let mut wire = masked(&fragment(Opcode::Text, false, b"hel"));
        wire.extend(masked(&Frame::ping(b"mid".to_vec())));
        wire.extend(masked(&fragment(Opcode::Continuation, true, b"lo")));
        client.write_all(&wire).await.unwrap();

        // Act
        let message = socket.recv().await.unwrap();

        // Assert
        assert_eq!(message, b"hello");
        let mut buf = Vec::new();
        let pong = read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"mid");
    }

    #[tokio::test]
    async fn test_sent_messages_are_unmasked_binary_frames() {
        let (socket, mut client) = pair(SocketOptions::default());

        socket.send(b"payload").await.unwrap();
        socket.send_text("{\"type\":\"ok\"}").await.unwrap();

        let mut buf = Vec::new();
        let first = read_frame(&mut client, &mut buf).await.unwrap();
        let second = read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!((first.opcode, first.masked), (Opcode::Binary, false));
        assert_eq!(first.payload, b"payload");
        assert_eq!(second.opcode, Opcode::Text);
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed_and_reported_clean() {
        // Arrange
        let (socket, mut client) = pair(SocketOptions::default());
        client
            .write_all(&masked(&Frame::close(1000, "bye")))
            .await
            .unwrap();

        // Act
        let end = socket.recv().await.unwrap_err();

        // Assert
        assert_eq!(end, SocketEnd::PeerClosed { code: Some(1000) });
        assert!(end.is_clean());
        let mut buf = Vec::new();
        let echo = read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(echo.close_code(), Some(1000));
    }

    #[tokio::test]
    async fn test_eof_is_a_drop_and_recv_is_not_restartable() {
        // Arrange
        let (socket, client) = pair(SocketOptions::default());
        drop(client);

        // Act
        let first = socket.recv().await.unwrap_err();
        let second = socket.recv().await.unwrap_err();

        // Assert
        assert_eq!(first, SocketEnd::Eof);
        assert!(!first.is_clean());
        assert_eq!(second, SocketEnd::Eof);
        assert!(socket.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_is_a_protocol_error() {
        let (socket, mut client) = pair(SocketOptions::default());
        client
            .write_all(&encode_frame(&Frame::text("plain")))
            .await
            .unwrap();

        let end = socket.recv().await.unwrap_err();

        assert!(matches!(end, SocketEnd::Protocol(_)));
        let mut buf = Vec::new();
        let close = read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(close.close_code(), Some(CLOSE_PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let (socket, mut client) = pair(SocketOptions {
            max_message_size: 16,
            ..SocketOptions::default()
        });
        client
            .write_all(&masked(&Frame::binary(vec![0; 17])))
            .await
            .unwrap();

        let end = socket.recv().await.unwrap_err();

        assert!(matches!(end, SocketEnd::Protocol(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_one_close_frame() {
        // Arrange
        let (socket, mut client) = pair(SocketOptions::default());

        // Act
        socket.close();
        socket.close();
        socket.close_because(SocketEnd::Timeout(Duration::from_secs(1)));

        // Assert
        timeout(Duration::from_secs(1), socket.closed()).await.unwrap();
        assert!(socket.is_closed());
        assert_eq!(socket.end_reason(), Some(SocketEnd::Local));
        let mut buf = Vec::new();
        let close = read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(close.close_code(), Some(CLOSE_NORMAL));
        assert!(read_frame(&mut client, &mut buf).await.is_none(), "then EOF");
    }

    #[tokio::test]
    async fn test_close_wakes_a_pending_recv() {
        let (socket, _client) = pair(SocketOptions::default());
        let reader = Arc::clone(&socket);
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;

        socket.close();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert_eq!(result, Err(SocketEnd::Local));
    }

    #[tokio::test]
    async fn test_compressed_round_trip_with_context_takeover() {
        // Arrange
        let options = SocketOptions {
            compression: true,
            ..SocketOptions::default()
        };
        let (socket, mut client) = pair(options);
        let mut client_deflater = MessageDeflater::new();
        let mut client_inflater = MessageInflater::new(1 << 20);
        let text = br#"{"type":"call","id":1,"channel":"ping","command":"ping"}"#;

        // Act: client → server, twice, sharing one deflate context.
        for _ in 0..2 {
            let mut frame = Frame::text(std::str::from_utf8(text).unwrap());
            frame.payload = client_deflater.compress(text).unwrap();
            frame.rsv1 = true;
            client.write_all(&masked(&frame)).await.unwrap();
            assert_eq!(socket.recv().await.unwrap(), text);
        }
        // server → client
        socket.send(b"reply reply reply").await.unwrap();

        // Assert
        let mut buf = Vec::new();
        let frame = read_frame(&mut client, &mut buf).await.unwrap();
        assert!(frame.rsv1);
        assert_eq!(
            client_inflater.decompress(&frame.payload).unwrap(),
            b"reply reply reply"
        );
    }

    #[tokio::test]
    async fn test_compressed_frame_without_negotiation_is_rejected() {
        let (socket, mut client) = pair(SocketOptions::default());
        let mut frame = Frame::binary(vec![1, 2, 3]);
        frame.rsv1 = true;
        client.write_all(&masked(&frame)).await.unwrap();

        assert!(matches!(
            socket.recv().await.unwrap_err(),
            SocketEnd::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_messages_stream_ends_with_socket() {
        // Arrange
        let (socket, mut client) = pair(SocketOptions::default());
        let mut wire = masked(&Frame::text("a"));
        wire.extend(masked(&Frame::text("b")));
        wire.extend(masked(&Frame::close(1000, "")));
        client.write_all(&wire).await.unwrap();

        // Act
        let collected: Vec<Vec<u8>> = socket.messages().collect().await;

        // Assert
        assert_eq!(collected, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(
            socket.messages().next().await,
            None,
            "an ended stream cannot be restarted"
        );
    }

    #[tokio::test]
    async fn test_pong_refreshes_activity() {
        let (socket, mut client) = pair(SocketOptions::default());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(socket.idle_for() >= Duration::from_millis(30));

        client
            .write_all(&masked(&Frame::pong(Vec::new())))
            .await
            .unwrap();
        client.write_all(&masked(&Frame::text("x"))).await.unwrap();
        socket.recv().await.unwrap();

        assert!(socket.idle_for() < Duration::from_millis(30));
    }

    #[cfg(unix)]
    fn spare_descriptor() -> Descriptor {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hand_off_returns_undecoded_bytes_without_closing() {
        // Arrange
        let (server, mut client) = tokio::io::duplex(64 * 1024);
        let socket = Arc::new(
            FramedSocket::new(server, SocketOptions::default(), Vec::new())
                .with_descriptor(spare_descriptor()),
        );
        let second = masked(&Frame::binary(b"second".to_vec()));
        let mut wire = masked(&Frame::binary(b"first".to_vec()));
        wire.extend_from_slice(&second[..3]);
        client.write_all(&wire).await.unwrap();
        assert_eq!(socket.recv().await.unwrap(), b"first");

        // Act
        let handoff = socket.hand_off().await.expect("socket can be handed off");

        // Assert
        assert_eq!(handoff.buffered, &second[..3]);
        assert!(!handoff.compression);
        assert!(handoff.inflate_history.is_empty());
        assert_eq!(socket.end_reason(), Some(SocketEnd::HandedOff));
        assert!(socket.is_closed());
        socket.close();
        let mut buf = Vec::new();
        assert!(
            read_frame(&mut client, &mut buf).await.is_none(),
            "no Close frame after a hand-off"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hand_off_carries_inflate_history() {
        // Arrange
        let options = SocketOptions {
            compression: true,
            ..SocketOptions::default()
        };
        let (server, mut client) = tokio::io::duplex(64 * 1024);
        let socket = FramedSocket::new(server, options, Vec::new()).with_descriptor(spare_descriptor());
        let mut client_deflater = MessageDeflater::new();
        let mut sent = Vec::new();
        for text in ["hello hello", "hello again"] {
            let mut frame = Frame::text(text);
            frame.payload = client_deflater.compress(text.as_bytes()).unwrap();
            frame.rsv1 = true;
            sent.push(frame.payload.clone());
            client.write_all(&masked(&frame)).await.unwrap();
            assert_eq!(socket.recv().await.unwrap(), text.as_bytes());
        }

        // Act
        let handoff = socket.hand_off().await.unwrap();

        // Assert: replaying the history rebuilds the client's context.
        assert!(handoff.compression);
        assert_eq!(handoff.inflate_history, sent);
        let mut inflater = MessageInflater::new(1 << 20);
        for compressed in &handoff.inflate_history {
            inflater.decompress(compressed).unwrap();
        }
        let next = client_deflater.compress(b"hello once more").unwrap();
        assert_eq!(inflater.decompress(&next).unwrap(), b"hello once more");
    }

    #[tokio::test]
    async fn test_hand_off_requires_a_kept_descriptor() {
        let (socket, _client) = pair(SocketOptions::default());

        assert!(socket.hand_off().await.is_none());
        assert!(!socket.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_released_socket_can_no_longer_be_handed_off() {
        // Arrange
        let (server, _client) = tokio::io::duplex(1024);
        let socket = FramedSocket::new(server, SocketOptions::default(), Vec::new())
            .with_descriptor(spare_descriptor());

        // Act
        socket.release_descriptor().await;

        // Assert
        assert!(socket.hand_off().await.is_none());
    }
}
