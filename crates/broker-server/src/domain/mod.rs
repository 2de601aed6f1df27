//! Domain layer for broker-server.
//!
//! Types in this layer describe *what* a session is and *how it may change*,
//! without knowing anything about sockets or processes.
//!
//! # What belongs in the domain layer?
//!
//! - Configuration structures
//! - The connection state machine and the retention (eviction) rule
//! - The error taxonomy and its wire codes
//! - The JSON envelope spoken by the channel router
//!
//! # What does NOT belong here?
//!
//! - Any `tokio` socket, task, or process type
//! - File I/O or environment variable reading

pub mod config;
pub mod connection;
pub mod error;
pub mod messages;

pub use config::{BrokerConfig, ConfigInvalid, RetentionPolicy, WorkerTransport};
pub use connection::{ConnectionEvent, ConnectionInfo, ConnectionState, RedactedToken};
pub use error::BrokerError;
pub use messages::{Outbound, RouterRequest, RouterResponse};
