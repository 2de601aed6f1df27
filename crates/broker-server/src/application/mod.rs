//! Application layer for broker-server.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure types and rules) and the infrastructure (sockets, processes).  It
//! makes the decisions; the infrastructure carries them out.
//!
//! # Sub-modules
//!
//! - **`registry`** – The central decision point.  Given a validated hello it
//!   decides whether to create a connection, resume one, or reject the
//!   attempt, and it applies the Offline retention policy.
//!
//! - **`session_protocol`** – The handshake state machine: validates the
//!   client hello and builds the replies.  No I/O; the infrastructure's
//!   `session` module drives it over a socket.
//!
//! - **`channel_router`** – Multiplexes named request/response and event
//!   channels over one Management connection.

pub mod channel_router;
pub mod registry;
pub mod session_protocol;

pub use channel_router::{
    ChannelContext, ChannelDirectory, ChannelError, ChannelRouter, PingChannel, ServerChannel,
};
pub use registry::{ConnectionRegistry, OfflineOutcome, ResolveOutcome, Resolved, SessionEntry};
pub use session_protocol::{HandshakeState, SessionHandshake};
