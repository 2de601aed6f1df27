//! Session handshake messages exchanged right after the WebSocket upgrade.
//!
//! # Message flow
//!
//! ```text
//! Server → Client:  {"type":"hello","commit":"abc","version":"0.1.0"}
//! Client → Server:  {"commit":"abc","desiredConnectionType":1,
//!                    "reconnectionToken":"t1","reconnection":false,"args":{}}
//! Server → Client:  {"type":"ok"}
//!              or:  {"type":"error","code":"staleSession","reason":"..."}
//! ```
//!
//! Every message is one JSON text frame.  The client's hello is decoded in
//! two steps: serde reads a permissive [`HelloWire`] (every field optional),
//! then [`SessionHello::from_wire`] decides which missing fields are fatal.
//! That keeps the error for an unknown connection type distinct from the
//! error for plain garbage.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ── Connection type ───────────────────────────────────────────────────────────

/// The kind of logical connection a client asks for.
///
/// The discriminants are the integers used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionType {
    /// Control/IPC channel hosting the channel router.
    Management = 1,
    /// Interactive channel proxied to a spawned worker process.
    ComputeProcess = 2,
    /// Raw byte relay to a second TCP endpoint.
    Tunnel = 3,
}

impl ConnectionType {
    /// All variants, in wire order.
    pub const ALL: [ConnectionType; 3] = [
        ConnectionType::Management,
        ConnectionType::ComputeProcess,
        ConnectionType::Tunnel,
    ];

    /// Lowercase label used in logs and configuration keys.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Management => "management",
            ConnectionType::ComputeProcess => "compute-process",
            ConnectionType::Tunnel => "tunnel",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for ConnectionType {
    type Error = HelloError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConnectionType::Management),
            2 => Ok(ConnectionType::ComputeProcess),
            3 => Ok(ConnectionType::Tunnel),
            other => Err(HelloError::UnknownConnectionType(other.to_string())),
        }
    }
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// First message the server sends on a fresh WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "hello")]
pub struct ServerIdentification {
    /// Build identifier the client compares against its own.
    pub commit: String,
    /// Human-readable server version.
    pub version: String,
}

/// Final handshake message: the connection was accepted or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandshakeReply {
    Ok,
    Error {
        /// Stable machine-readable code, e.g. `"staleSession"`.
        code: String,
        /// Human-readable explanation.
        reason: String,
    },
}

impl HandshakeReply {
    pub fn error(code: &str, reason: impl Into<String>) -> Self {
        HandshakeReply::Error {
            code: code.to_string(),
            reason: reason.into(),
        }
    }
}

// ── Client → Server ───────────────────────────────────────────────────────────

/// Errors raised while turning the client's hello into a [`SessionHello`].
#[derive(Debug, Error, PartialEq)]
pub enum HelloError {
    /// Not JSON, not an object, or a required field is missing.
    #[error("invalid hello: {0}")]
    Invalid(String),

    /// `desiredConnectionType` is missing or not a known value.
    #[error("unknown connection type: {0}")]
    UnknownConnectionType(String),
}

/// The hello exactly as it appears on the wire, with every field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_connection_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnection_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

/// A validated client hello.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHello {
    /// The client's build identifier (empty when the client sent none).
    pub peer_version: String,
    pub connection_type: ConnectionType,
    /// Opaque, client-chosen, unique per session.
    pub reconnection_token: String,
    pub is_reconnection_attempt: bool,
    /// Variant-specific arguments (e.g. the tunnel target).
    pub extra_args: Map<String, Value>,
}

impl SessionHello {
    /// Decodes and validates a hello from one message payload.
    ///
    /// # Errors
    ///
    /// - [`HelloError::Invalid`] – not a JSON object, or no token.
    /// - [`HelloError::UnknownConnectionType`] – missing or unknown type.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use broker_core::protocol::messages::{ConnectionType, SessionHello};
    ///
    /// let raw = br#"{"commit":"abc","desiredConnectionType":1,"reconnectionToken":"t1","reconnection":false}"#;
    /// let hello = SessionHello::decode(raw).unwrap();
    /// assert_eq!(hello.connection_type, ConnectionType::Management);
    /// assert!(!hello.is_reconnection_attempt);
    /// ```
    pub fn decode(payload: &[u8]) -> Result<Self, HelloError> {
        let wire: HelloWire =
            serde_json::from_slice(payload).map_err(|e| HelloError::Invalid(e.to_string()))?;
        Self::from_wire(wire)
    }

    /// Validates an already-parsed [`HelloWire`].
    pub fn from_wire(wire: HelloWire) -> Result<Self, HelloError> {
        let connection_type = match wire.desired_connection_type {
            Some(Value::Number(n)) => match n.as_i64() {
                Some(v) => ConnectionType::try_from(v)?,
                None => return Err(HelloError::UnknownConnectionType(n.to_string())),
            },
            Some(other) => return Err(HelloError::UnknownConnectionType(other.to_string())),
            None => return Err(HelloError::UnknownConnectionType("<missing>".into())),
        };

        let reconnection_token = wire
            .reconnection_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HelloError::Invalid("missing reconnectionToken".into()))?;

        Ok(Self {
            peer_version: wire.commit.unwrap_or_default(),
            connection_type,
            reconnection_token,
            is_reconnection_attempt: wire.reconnection.unwrap_or(false),
            extra_args: wire.args.unwrap_or_default(),
        })
    }

    /// Converts back to the wire shape (used by clients and tests).
    pub fn to_wire(&self) -> HelloWire {
        HelloWire {
            commit: Some(self.peer_version.clone()),
            desired_connection_type: Some(Value::from(self.connection_type as u8)),
            reconnection_token: Some(self.reconnection_token.clone()),
            reconnection: Some(self.is_reconnection_attempt),
            args: if self.extra_args.is_empty() {
                None
            } else {
                Some(self.extra_args.clone())
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
