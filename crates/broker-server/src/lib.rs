//! broker-server library crate.
//!
//! This crate accepts raw TCP sockets, upgrades them to WebSocket, runs the
//! session handshake, and owns every logical connection's lifecycle,
//! including reconnection after a network drop and eviction of abandoned
//! sessions.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Client (WebSocket frames, JSON handshake)
//!         ↕
//! [broker-server]
//!   ├── domain/           Pure types: BrokerConfig, ConnectionState, BrokerError,
//!   │                     retention policy, router envelope
//!   ├── application/      Decisions: ConnectionRegistry, SessionHandshake,
//!   │                     ChannelRouter
//!   └── infrastructure/
//!         ├── listener/       Accept loop and the handle_upgrade entry point
//!         ├── framed_socket/  WebSocket framing over any async byte stream
//!         ├── session/        Handshake driver and keepalive
//!         ├── connection/     LogicalConnection (tagged union of variants)
//!         ├── management/     Channel-router variant
//!         ├── compute/        Worker-process variant
//!         ├── handoff/        Socket passing to workers (Unix)
//!         ├── tunnel/         Raw TCP relay variant
//!         └── config_file/    Optional TOML configuration file
//! ```
//!
//! # Layer rules
//!
//! - `domain` performs no I/O and spawns nothing.
//! - `application` depends on `domain` and `broker-core`; it may use
//!   `tokio::sync` primitives and spawn router tasks, but never touches a
//!   socket or a process directly.
//! - `infrastructure` depends on all other layers and owns every socket,
//!   child process, and long-lived task.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: registry, handshake state machine, channel router.
pub mod application;

/// Infrastructure layer: sockets, processes, and the accept loop.
pub mod infrastructure;
