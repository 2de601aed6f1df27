//! Error taxonomy for connection attempts and logical connections.
//!
//! Every variant is scoped to one connection attempt or one logical
//! connection; nothing here terminates the process.  Variants that reject a
//! handshake carry a stable camelCase [`code`](BrokerError::code) that is sent
//! to the client in the `{"type":"error"}` reply, so clients can tell a
//! `staleSession` (discard local state, start over) from other failures.

use std::time::Duration;

use broker_core::protocol::{ConnectionType, HelloError};
use thiserror::Error;

/// Why a connection attempt or a logical connection failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Bad or missing upgrade headers.  Rejected at the HTTP level with
    /// `400 Bad Request`; no socket is retained.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    /// No hello arrived within the handshake timeout.
    #[error("no hello received within {0:?}")]
    HandshakeTimeout(Duration),

    /// `desiredConnectionType` is missing or not a known value.
    #[error("unknown connection type: {0}")]
    UnknownConnectionType(String),

    /// The hello is not valid JSON, lacks a token, or carries unusable
    /// variant arguments.
    #[error("invalid hello: {0}")]
    InvalidHello(String),

    /// A reconnection hello named a token the server no longer knows.
    #[error("no {kind} session for token {token}")]
    StaleSession {
        kind: ConnectionType,
        /// Redacted token prefix.
        token: String,
    },

    /// A fresh hello reused a token that is already held.
    #[error("token {token} is already held by a {holder} session")]
    TokenCollision {
        holder: ConnectionType,
        /// Redacted token prefix.
        token: String,
    },

    /// The worker process for a ComputeProcess connection could not start.
    #[error("worker failed to start: {0}")]
    SpawnFailure(String),

    /// Socket reset, EOF, or write failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Stable machine-readable code sent to clients.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use broker_server::domain::BrokerError;
    ///
    /// assert_eq!(BrokerError::SpawnFailure("x".into()).code(), "spawnFailure");
    /// ```
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::MalformedHandshake(_) => "malformedHandshake",
            BrokerError::HandshakeTimeout(_) => "handshakeTimeout",
            BrokerError::UnknownConnectionType(_) => "unknownConnectionType",
            BrokerError::InvalidHello(_) => "invalidHello",
            BrokerError::StaleSession { .. } => "staleSession",
            BrokerError::TokenCollision { .. } => "tokenCollision",
            BrokerError::SpawnFailure(_) => "spawnFailure",
            BrokerError::Transport(_) => "transport",
        }
    }
}

impl From<HelloError> for BrokerError {
    fn from(e: HelloError) -> Self {
        match e {
            HelloError::Invalid(reason) => BrokerError::InvalidHello(reason),
            HelloError::UnknownConnectionType(value) => BrokerError::UnknownConnectionType(value),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
