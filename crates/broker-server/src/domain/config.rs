//! Broker configuration types.
//!
//! [`BrokerConfig`] is the single source of truth for all runtime settings.
//! It can be populated from CLI arguments and an optional TOML file (see
//! `infrastructure::config_file`) or from the defaults below, which are
//! suitable for local development and tests.
//!
//! Keeping configuration as a plain struct (no global state, no environment
//! variable reads inside the domain) makes the broker easy to embed in tests.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use broker_core::protocol::ConnectionType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a ComputeProcess worker exchanges messages with its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTransport {
    /// The client's socket is passed to the worker, which then speaks
    /// WebSocket to the client itself.  Unix only.
    Handoff,
    /// The broker keeps the socket and proxies message payloads through
    /// the worker's stdin and stdout.
    Stdio,
}

impl Default for WorkerTransport {
    /// [`Handoff`](Self::Handoff) where descriptors can be passed,
    /// [`Stdio`](Self::Stdio) elsewhere.
    fn default() -> Self {
        if cfg!(unix) {
            WorkerTransport::Handoff
        } else {
            WorkerTransport::Stdio
        }
    }
}

impl fmt::Display for WorkerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerTransport::Handoff => "handoff",
            WorkerTransport::Stdio => "stdio",
        })
    }
}

impl FromStr for WorkerTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "handoff" => Ok(WorkerTransport::Handoff),
            "stdio" => Ok(WorkerTransport::Stdio),
            other => Err(format!("unknown worker transport '{other}' (expected handoff or stdio)")),
        }
    }
}

/// A [`BrokerConfig`] the broker cannot run with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigInvalid {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("keepalive timeout ({timeout:?}) must be longer than the ping interval ({interval:?})")]
    TimeoutNotAfterInterval { timeout: Duration, interval: Duration },

    #[error("the handoff worker transport needs Unix descriptor passing")]
    HandoffUnsupported,
}

/// How many Offline connections of each type may linger beyond the one that
/// most recently dropped.
///
/// # How eviction works (for beginners)
///
/// When a connection's socket drops, the connection is *not* destroyed: it
/// waits (Offline) so the client can reconnect with the same token.  Every
/// time a connection goes Offline, the registry looks at the *other* Offline
/// connections of the same type and keeps only the `extra_offline` most
/// recently created ones.  Older ones are closed, oldest first.
///
/// With the default of `0`, only the connection that just dropped survives,
/// which matches a single client reconnecting after a network hiccup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub management: usize,
    pub compute_process: usize,
    pub tunnel: usize,
}

impl RetentionPolicy {
    /// Same limit for every connection type.
    pub fn uniform(extra: usize) -> Self {
        Self {
            management: extra,
            compute_process: extra,
            tunnel: extra,
        }
    }

    /// Number of additional Offline entries of `kind` that may be retained.
    pub fn extra_offline(&self, kind: ConnectionType) -> usize {
        match kind {
            ConnectionType::Management => self.management,
            ConnectionType::ComputeProcess => self.compute_process,
            ConnectionType::Tunnel => self.tunnel,
        }
    }
}

/// All runtime configuration for the broker.
///
/// Build this struct once at startup and wrap it in an `Arc` so it can be
/// shared cheaply across all connection tasks.
///
/// # Example
///
/// ```rust
/// use broker_server::domain::BrokerConfig;
///
/// let cfg = BrokerConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 8000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Address and port the HTTP/WebSocket listener binds to.
    ///
    /// Defaults to loopback; set to `0.0.0.0` to accept remote clients.
    pub bind_addr: SocketAddr,

    /// Build identifier sent in the server identification message and
    /// compared against the client's `commit`.  A mismatch is only logged.
    pub commit: String,

    /// Human-readable version sent alongside `commit`.
    pub version: String,

    /// How long a client has to send its hello after the upgrade (and how
    /// long the HTTP request head may take to arrive).
    pub handshake_timeout: Duration,

    /// How often the server pings an Online socket.
    pub keepalive_interval: Duration,

    /// A socket with no inbound traffic for this long is treated as dropped.
    pub keepalive_timeout: Duration,

    /// Upper bound on one reassembled (and inflated) message.
    pub max_message_size: usize,

    /// Capacity of each connection's outbound queue.  Producers wait when
    /// it is full, which is what happens while a connection is Offline.
    pub outbox_capacity: usize,

    /// Extra Offline connections to retain per type.
    pub retention: RetentionPolicy,

    /// Program and arguments launched for each ComputeProcess connection.
    /// Empty means ComputeProcess connections are rejected with
    /// `spawnFailure`.
    pub worker_command: Vec<String>,

    /// Whether workers receive the client socket or are proxied over stdio.
    pub worker_transport: WorkerTransport,
}

impl Default for BrokerConfig {
    /// Returns a `BrokerConfig` suitable for local development.
    ///
    /// | Field              | Default            |
    /// |--------------------|--------------------|
    /// | bind_addr          | `127.0.0.1:8000`   |
    /// | commit             | `"dev"`            |
    /// | version            | crate version      |
    /// | handshake_timeout  | 10 seconds         |
    /// | keepalive_interval | 5 seconds          |
    /// | keepalive_timeout  | 20 seconds         |
    /// | max_message_size   | 16 MiB             |
    /// | outbox_capacity    | 1024 messages      |
    /// | retention          | 0 extra per type   |
    /// | worker_command     | none               |
    /// | worker_transport   | handoff (Unix)     |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8000)),
            commit: "dev".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(20),
            max_message_size: 16 * 1024 * 1024,
            outbox_capacity: 1024,
            retention: RetentionPolicy::default(),
            worker_command: Vec::new(),
            worker_transport: WorkerTransport::default(),
        }
    }
}

impl BrokerConfig {
    /// Checks the settings that would otherwise fail later, inside a
    /// connection task (a zero ping interval panics `tokio::time::interval`).
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        let non_zero = [
            ("handshake timeout", self.handshake_timeout.is_zero()),
            ("keepalive interval", self.keepalive_interval.is_zero()),
            ("keepalive timeout", self.keepalive_timeout.is_zero()),
            ("max message size", self.max_message_size == 0),
            ("outbox capacity", self.outbox_capacity == 0),
        ];
        if let Some((name, _)) = non_zero.into_iter().find(|(_, zero)| *zero) {
            return Err(ConfigInvalid::Zero(name));
        }
        if self.keepalive_timeout <= self.keepalive_interval {
            return Err(ConfigInvalid::TimeoutNotAfterInterval {
                timeout: self.keepalive_timeout,
                interval: self.keepalive_interval,
            });
        }
        if cfg!(not(unix)) && self.worker_transport == WorkerTransport::Handoff {
            return Err(ConfigInvalid::HandoffUnsupported);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
