//! # broker-core
//!
//! Shared protocol library for the session broker: everything that turns raw
//! bytes into typed values and back, with no sockets, tasks, or processes.
//!
//! # Architecture overview (for beginners)
//!
//! A thin client (a browser tab or a remote terminal) talks to the broker over
//! a single TCP connection.  That connection goes through three layers before
//! the broker knows what the client wants:
//!
//! ```text
//! raw TCP bytes
//!     │  HTTP Upgrade request  ──►  handshake::compute_upgrade_response
//!     ▼
//! WebSocket frames             ──►  frame::decode_frame / encode_frame
//!     │  (optionally deflated) ──►  deflate::MessageInflater / MessageDeflater
//!     ▼
//! JSON handshake messages      ──►  messages::SessionHello, HandshakeReply
//! ```
//!
//! - **`protocol::handshake`** – Parses the HTTP request head and computes the
//!   literal `101` response, including the `Sec-WebSocket-Accept` hash and the
//!   permessage-deflate extension line.
//!
//! - **`protocol::frame`** – RFC 6455 frame codec.  Like any stream decoder it
//!   reports `InsufficientData` until a whole frame is buffered, so callers
//!   never observe a partial message.
//!
//! - **`protocol::deflate`** – Per-connection compression contexts for the
//!   permessage-deflate extension.
//!
//! - **`protocol::messages`** – The application-level handshake: the server's
//!   identification message, the client's hello, and the ok/error reply.

pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `broker_core::SessionHello` instead of the full module path.
pub use protocol::frame::{decode_frame, encode_frame, Frame, FrameError, Opcode};
pub use protocol::handshake::{compute_upgrade_response, HandshakeError, HandshakeResult};
pub use protocol::messages::{ConnectionType, HandshakeReply, ServerIdentification, SessionHello};
