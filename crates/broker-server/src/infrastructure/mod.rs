//! Infrastructure layer for broker-server.
//!
//! The infrastructure layer handles all I/O: accepting TCP connections,
//! speaking WebSocket frames, running worker processes, and relaying tunnel
//! traffic.
//!
//! # Responsibilities
//!
//! - Binding the listener and spawning one task per accepted socket
//! - Reading the HTTP request head and completing the WebSocket upgrade
//! - Framing, reassembly, compression, and keepalive on each socket
//! - Driving the session handshake and applying the registry's decision
//! - Owning worker processes and tunnel streams for their connections
//! - Passing client sockets to workers over a Unix control channel
//! - Loading the optional TOML configuration file
//!
//! # What does NOT belong here?
//!
//! - Deciding create vs. resume vs. reject (that is the application layer)
//! - Connection states and error codes (that is the domain layer)

pub mod compute;
pub mod config_file;
pub mod connection;
pub mod framed_socket;
#[cfg(unix)]
pub mod handoff;
pub mod listener;
pub mod management;
pub mod session;
pub mod tunnel;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use compute::{CommandSpawner, SpawnError, WorkerIo, WorkerParams, WorkerSpawner};
pub use config_file::{ConfigError, FileConfig};
pub use connection::{BindingEnd, ConnectionVariant, LogicalConnection};
pub use framed_socket::{Descriptor, FramedSocket, SocketEnd, SocketHandoff, SocketOptions};
#[cfg(unix)]
pub use handoff::{ControlChannel, ControlMessage};
pub use listener::{run_server, run_server_on, Broker, NotFoundResponder, StaticResponder};
