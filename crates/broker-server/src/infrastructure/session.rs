//! Drives the session handshake and the keepalive over a [`FramedSocket`].
//!
//! The decisions live in [`SessionHandshake`]; this module only moves the
//! messages and applies the timeouts.

use std::sync::Arc;
use std::time::Duration;

use broker_core::protocol::{HandshakeReply, SessionHello};
use tracing::{debug, info, warn};

use crate::application::SessionHandshake;
use crate::domain::{BrokerConfig, BrokerError};
use crate::infrastructure::framed_socket::{FramedSocket, SocketEnd};

/// Sends the server identification and waits for the client's hello.
///
/// The caller suspends until the hello is accepted or rejected; other
/// sockets' handshakes are unaffected.  On error the caller is responsible
/// for replying and closing the socket (see [`send_reply`]).
///
/// # Errors
///
/// - [`BrokerError::HandshakeTimeout`] – nothing arrived in time.
/// - [`BrokerError::Transport`] – the socket ended first.
/// - [`BrokerError::UnknownConnectionType`] / [`BrokerError::InvalidHello`].
pub async fn perform_handshake(
    socket: &FramedSocket,
    config: &BrokerConfig,
) -> Result<SessionHello, BrokerError> {
    let mut handshake = SessionHandshake::new(&config.commit, &config.version);

    let ident = serde_json::to_string(&handshake.identification())
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    socket
        .send_text(&ident)
        .await
        .map_err(|end| handshake.transport_failed(end))?;

    let payload = match tokio::time::timeout(config.handshake_timeout, socket.recv()).await {
        Err(_) => {
            warn!(
                "socket {} ({}): no hello within {:?}",
                socket.id(),
                socket.peer(),
                config.handshake_timeout
            );
            return Err(handshake.timed_out(config.handshake_timeout));
        }
        Ok(Err(end)) => return Err(handshake.transport_failed(end)),
        Ok(Ok(payload)) => payload,
    };

    handshake.on_hello(&payload)
}

/// Sends the final handshake message.  A socket that is already gone is
/// not an error worth reporting.
pub async fn send_reply(socket: &FramedSocket, reply: &HandshakeReply) {
    match serde_json::to_string(reply) {
        Ok(text) => {
            if let Err(end) = socket.send_text(&text).await {
                debug!("socket {}: handshake reply not delivered: {end}", socket.id());
            }
        }
        Err(e) => warn!("could not encode handshake reply: {e}"),
    }
}

/// Pings `socket` every `interval` and closes it with
/// [`SocketEnd::Timeout`] once nothing has arrived for `timeout`.
///
/// Returns when the socket closes for any reason.
pub async fn run_keepalive(socket: Arc<FramedSocket>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = socket.closed() => return,
        }

        let idle = socket.idle_for();
        if idle >= timeout {
            info!(
                "socket {} ({}): no traffic for {:?}, dropping",
                socket.id(),
                socket.peer(),
                idle
            );
            socket.close_because(SocketEnd::Timeout(idle));
            return;
        }
        if socket.ping().await.is_err() {
            return;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
