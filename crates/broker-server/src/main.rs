//! Session broker entry point.
//!
//! This binary accepts WebSocket connections, runs the session handshake,
//! and keeps each client's logical connection alive across network drops so
//! the client can reconnect with its token.
//!
//! # Usage
//!
//! ```text
//! session-broker [OPTIONS] [-- <WORKER COMMAND>...]
//!
//! Options:
//!   --config <PATH>              Optional TOML configuration file
//!   --bind <ADDR>                Listener address [default: 127.0.0.1:8000]
//!   --commit <ID>                Build identifier sent to clients
//!   --handshake-timeout <SECS>   Time allowed for the client hello [default: 10]
//!   --keepalive-interval <SECS>  Ping interval [default: 5]
//!   --keepalive-timeout <SECS>   Silence before a socket counts as dropped [default: 20]
//!   --retain-offline <N>         Extra Offline connections kept per type [default: 0]
//!   --worker-transport <KIND>    handoff | stdio [default: handoff on Unix]
//! ```
//!
//! Everything after `--` is the command started for each ComputeProcess
//! connection, e.g. `session-broker -- python3 worker.py`.
//!
//! # Precedence
//!
//! Built-in defaults < config file < environment variables < flags.
//!
//! | Variable                            | Flag                   |
//! |-------------------------------------|------------------------|
//! | `SESSION_BROKER_CONFIG`             | `--config`             |
//! | `SESSION_BROKER_BIND`               | `--bind`               |
//! | `SESSION_BROKER_COMMIT`             | `--commit`             |
//! | `SESSION_BROKER_HANDSHAKE_TIMEOUT`  | `--handshake-timeout`  |
//! | `SESSION_BROKER_KEEPALIVE_INTERVAL` | `--keepalive-interval` |
//! | `SESSION_BROKER_KEEPALIVE_TIMEOUT`  | `--keepalive-timeout`  |
//! | `SESSION_BROKER_RETAIN_OFFLINE`     | `--retain-offline`     |
//! | `SESSION_BROKER_WORKER_TRANSPORT`   | `--worker-transport`   |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use broker_server::domain::{BrokerConfig, RetentionPolicy, WorkerTransport};
use broker_server::infrastructure::{run_server, Broker, FileConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Reconnectable WebSocket session broker.
///
/// Every flag is optional; unset flags fall back to the config file and then
/// to the built-in defaults.
#[derive(Debug, Parser)]
#[command(
    name = "session-broker",
    about = "Reconnectable WebSocket session broker",
    version
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "SESSION_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.  Use `0.0.0.0:PORT` to accept remote clients.
    #[arg(long, env = "SESSION_BROKER_BIND")]
    bind: Option<SocketAddr>,

    /// Build identifier sent in the server identification message.
    #[arg(long, env = "SESSION_BROKER_COMMIT")]
    commit: Option<String>,

    /// Seconds a client has to send its hello after the upgrade.
    #[arg(long, env = "SESSION_BROKER_HANDSHAKE_TIMEOUT")]
    handshake_timeout: Option<u64>,

    /// Seconds between keepalive pings.
    #[arg(long, env = "SESSION_BROKER_KEEPALIVE_INTERVAL")]
    keepalive_interval: Option<u64>,

    /// Seconds without inbound traffic before a socket counts as dropped.
    #[arg(long, env = "SESSION_BROKER_KEEPALIVE_TIMEOUT")]
    keepalive_timeout: Option<u64>,

    /// Extra Offline connections retained per connection type.
    #[arg(long, env = "SESSION_BROKER_RETAIN_OFFLINE")]
    retain_offline: Option<usize>,

    /// How ComputeProcess workers reach their clients: `handoff` passes the
    /// socket itself, `stdio` proxies messages through the worker's pipes.
    #[arg(long, env = "SESSION_BROKER_WORKER_TRANSPORT")]
    worker_transport: Option<WorkerTransport>,

    /// Worker command for ComputeProcess connections.
    #[arg(last = true)]
    worker: Vec<String>,
}

impl Cli {
    /// Builds the effective [`BrokerConfig`]: defaults, then the config
    /// file, then these arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the merged settings fail [`BrokerConfig::validate`] (a zero interval
    /// or timeout, or a keepalive timeout not longer than the ping interval).
    fn into_broker_config(self) -> anyhow::Result<BrokerConfig> {
        let mut config = BrokerConfig::default();

        if let Some(path) = &self.config {
            FileConfig::load(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?
                .apply_to(&mut config);
        }

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(commit) = self.commit {
            config.commit = commit;
        }
        if let Some(secs) = self.handshake_timeout {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.keepalive_interval {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.keepalive_timeout {
            config.keepalive_timeout = Duration::from_secs(secs);
        }
        if let Some(extra) = self.retain_offline {
            config.retention = RetentionPolicy::uniform(extra);
        }
        if let Some(transport) = self.worker_transport {
            config.worker_transport = transport;
        }
        if !self.worker.is_empty() {
            config.worker_command = self.worker;
        }

        config.validate()?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. `tracing_subscriber` is initialised; `RUST_LOG` controls the level
///    (default `info`).
/// 2. CLI arguments are parsed and merged with the config file.
/// 3. A Ctrl+C handler cancels the shutdown token.
/// 4. [`run_server`] accepts connections until the token is cancelled, then
///    closes every logical connection (killing workers, stopping tunnels).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_broker_config()?;
    info!(
        "session broker starting: bind={}, commit={}, worker={:?} ({})",
        config.bind_addr, config.commit, config.worker_command, config.worker_transport
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                on_signal.cancel();
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    run_server(Arc::new(Broker::new(config)), shutdown).await?;

    info!("session broker stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
