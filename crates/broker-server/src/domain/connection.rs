//! Logical connection state machine and the retention rule.
//!
//! A *logical connection* is one client session.  It outlives any single
//! physical socket: when the socket drops, the connection goes Offline and
//! waits for the client to come back with the same reconnection token.
//!
//! # State diagram
//!
//! ```text
//!   Connecting ──bind──► Online ──drop──► Offline
//!                          ▲                │
//!                          └─────rebind─────┘
//!
//!   any state ──close/evict──► Closed   (terminal)
//! ```

use std::fmt;
use std::time::Instant;

use broker_core::protocol::ConnectionType;

/// Lifecycle state of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created by the registry but no socket bound yet.
    Connecting,
    /// A live socket is bound.
    Online,
    /// The socket dropped; the session waits for a reconnection.
    Offline,
    /// Released for good.  Never leaves this state.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is allowed.
    ///
    /// `Online → Online` is allowed: a client may reconnect before the
    /// server has noticed that the previous socket died.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Online) => true,
            (Online, Online) | (Online, Offline) => true,
            (Offline, Online) => true,
            _ => false,
        }
    }

    /// Returns `true` if a reconnection hello may rebind this connection.
    pub fn accepts_reconnection(self) -> bool {
        matches!(self, ConnectionState::Online | ConnectionState::Offline)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Displays only a short prefix of a reconnection token.
///
/// Tokens are bearer credentials: whoever presents one can resume the
/// session.  Log lines and error reasons use this wrapper so full tokens
/// never leave the process.
///
/// ```rust
/// use broker_server::domain::RedactedToken;
///
/// assert_eq!(RedactedToken("0123456789abcdef").to_string(), "012345…");
/// assert_eq!(RedactedToken("t1").to_string(), "t1");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RedactedToken<'a>(pub &'a str);

impl fmt::Display for RedactedToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const VISIBLE: usize = 6;
        match self.0.char_indices().nth(VISIBLE) {
            Some((cut, _)) => write!(f, "{}…", &self.0[..cut]),
            None => f.write_str(self.0),
        }
    }
}

/// Diagnostic view of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub token: String,
    pub kind: ConnectionType,
    pub state: ConnectionState,
    pub created_at: Instant,
}

/// Lifecycle notifications published by the connection registry.
///
/// Subscribers receive these through a `tokio::sync::broadcast` channel and
/// unsubscribe simply by dropping their receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A fresh hello created a new logical connection.
    Connected { kind: ConnectionType, token: String },
    /// A reconnection hello rebound an existing connection.
    Reconnected { kind: ConnectionType, token: String },
    /// The connection's socket dropped; the session is retained.
    Offline { kind: ConnectionType, token: String },
    /// The connection was removed from the registry and released.
    Closed {
        kind: ConnectionType,
        token: String,
        /// `true` when the retention policy closed it.
        evicted: bool,
    },
}

/// Picks the Offline entries to close so that at most `keep` remain.
///
/// `candidates` are `(key, created_at)` pairs in any order.  The returned
/// keys are ordered oldest-created first, which is also the order they
/// should be closed in.
///
/// # Examples
///
/// ```rust
/// use std::time::{Duration, Instant};
/// use broker_server::domain::connection::select_evictions;
///
/// let t0 = Instant::now();
/// let candidates = vec![
///     ("b", t0 + Duration::from_secs(2)),
///     ("a", t0 + Duration::from_secs(1)),
///     ("c", t0 + Duration::from_secs(3)),
/// ];
/// assert_eq!(select_evictions(candidates, 1), vec!["a", "b"]);
/// ```
pub fn select_evictions<K>(mut candidates: Vec<(K, Instant)>, keep: usize) -> Vec<K> {
    if candidates.len() <= keep {
        return Vec::new();
    }
    candidates.sort_by_key(|(_, created_at)| *created_at);
    let surplus = candidates.len() - keep;
    candidates
        .into_iter()
        .take(surplus)
        .map(|(key, _)| key)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
