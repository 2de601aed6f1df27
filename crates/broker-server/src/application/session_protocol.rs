//! Session handshake state machine.
//!
//! After the WebSocket upgrade the server and client exchange three
//! messages before any application traffic flows:
//!
//! ```text
//! server ──► {"type":"hello","commit":"…","version":"…"}
//! client ──► {"commit":"…","desiredConnectionType":1,"reconnectionToken":"…","reconnection":false}
//! server ──► {"type":"ok"}  or  {"type":"error","code":"staleSession","reason":"…"}
//! ```
//!
//! [`SessionHandshake`] owns the decisions (is the hello acceptable, what is
//! the reply) and the state transitions.  It performs no I/O, so every path
//! through it is unit-testable; `infrastructure::session` drives it over a
//! real socket.

use std::time::Duration;

use broker_core::protocol::{HandshakeReply, ServerIdentification, SessionHello};
use tracing::{debug, warn};

use crate::domain::BrokerError;

/// Handshake progress for one physical socket.
///
/// ```text
/// AwaitingHello ──► Validating ──► Accepted
///       │                └───────► Rejected
///       └──────(timeout / drop)──► Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingHello,
    Validating,
    Accepted,
    Rejected,
}

/// Validates one client hello against this server's build.
#[derive(Debug)]
pub struct SessionHandshake {
    state: HandshakeState,
    commit: String,
    version: String,
}

impl SessionHandshake {
    pub fn new(commit: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::AwaitingHello,
            commit: commit.into(),
            version: version.into(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The first message the server sends on a fresh socket.
    pub fn identification(&self) -> ServerIdentification {
        ServerIdentification {
            commit: self.commit.clone(),
            version: self.version.clone(),
        }
    }

    /// Validates the client's hello payload.
    ///
    /// A `commit` that differs from the server's is logged and accepted.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::UnknownConnectionType`] – missing or unknown type.
    /// - [`BrokerError::InvalidHello`] – not JSON, no token, or a second hello.
    pub fn on_hello(&mut self, payload: &[u8]) -> Result<SessionHello, BrokerError> {
        if self.state != HandshakeState::AwaitingHello {
            return Err(BrokerError::InvalidHello(format!(
                "hello received in state {:?}",
                self.state
            )));
        }
        self.state = HandshakeState::Validating;

        let hello = match SessionHello::decode(payload) {
            Ok(hello) => hello,
            Err(e) => {
                self.state = HandshakeState::Rejected;
                return Err(e.into());
            }
        };

        if hello.peer_version != self.commit {
            warn!(
                "client build {:?} differs from server build {:?}; continuing",
                hello.peer_version, self.commit
            );
        }
        debug!(
            "hello accepted: type={} reconnection={}",
            hello.connection_type, hello.is_reconnection_attempt
        );
        self.state = HandshakeState::Accepted;
        Ok(hello)
    }

    /// Records that no hello arrived within `waited`.
    pub fn timed_out(&mut self, waited: Duration) -> BrokerError {
        self.state = HandshakeState::Rejected;
        BrokerError::HandshakeTimeout(waited)
    }

    /// Records that the socket ended before a hello arrived.
    pub fn transport_failed(&mut self, reason: impl std::fmt::Display) -> BrokerError {
        self.state = HandshakeState::Rejected;
        BrokerError::Transport(reason.to_string())
    }

    /// The final handshake message for a routing outcome.
    pub fn reply_for<T>(result: &Result<T, BrokerError>) -> HandshakeReply {
        match result {
            Ok(_) => HandshakeReply::Ok,
            Err(e) => HandshakeReply::error(e.code(), e.to_string()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
