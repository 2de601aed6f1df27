//! Tunnel variant: relays message payloads to and from a TCP target.
//!
//! The client names the target in the hello's `args`:
//!
//! ```json
//! {"desiredConnectionType":3,"reconnectionToken":"…","args":{"host":"127.0.0.1","port":5432}}
//! ```
//!
//! Every binary or text message from the client is written verbatim to the
//! target; every chunk read from the target is sent back as one binary
//! message.  Tunnels are not reconnectable: when either side ends, the
//! relay stops and the logical connection is removed.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::BrokerError;
use crate::infrastructure::connection::BindingEnd;
use crate::infrastructure::framed_socket::FramedSocket;

const DEFAULT_HOST: &str = "127.0.0.1";
const RELAY_CHUNK: usize = 16 * 1024;

/// Where a tunnel connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// Reads `host` (default `127.0.0.1`) and `port` from the hello's args.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidHello`] when `port` is missing, not an integer,
    /// or out of range, or when `host` is not a string.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_json::json;
    /// use broker_server::infrastructure::tunnel::TunnelTarget;
    ///
    /// let args = json!({"port": 5432}).as_object().cloned().unwrap();
    /// let target = TunnelTarget::from_args(&args).unwrap();
    /// assert_eq!(target.host, "127.0.0.1");
    /// assert_eq!(target.port, 5432);
    /// ```
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, BrokerError> {
        let host = match args.get("host") {
            None | Some(Value::Null) => DEFAULT_HOST.to_string(),
            Some(Value::String(h)) if !h.is_empty() => h.clone(),
            Some(other) => {
                return Err(BrokerError::InvalidHello(format!(
                    "tunnel host must be a non-empty string, got {other}"
                )))
            }
        };
        let port = args
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| BrokerError::InvalidHello("tunnel requires a valid 'port'".into()))?;
        Ok(Self { host, port })
    }
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct TunnelConnection {
    target: TunnelTarget,
    stop: CancellationToken,
}

impl TunnelConnection {
    pub fn new(target: TunnelTarget) -> Self {
        Self {
            target,
            stop: CancellationToken::new(),
        }
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Connects to the target and relays bytes both ways until one side
    /// ends or the connection is shut down.
    pub async fn serve(&self, socket: &Arc<FramedSocket>) -> BindingEnd {
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let stream = tokio::select! {
            r = connect => r,
            _ = self.stop.cancelled() => return BindingEnd::ConnectionClosed,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("tunnel to {} failed: {e}", self.target);
                return BindingEnd::TargetClosed;
            }
        };
        let _ = stream.set_nodelay(true);
        info!("tunnel relaying to {}", self.target);
        let (mut target_rd, mut target_wr) = stream.into_split();

        let upstream = async {
            loop {
                match socket.recv().await {
                    Ok(bytes) => {
                        if let Err(e) = target_wr.write_all(&bytes).await {
                            debug!("tunnel write to {} failed: {e}", self.target);
                            return BindingEnd::TargetClosed;
                        }
                    }
                    Err(end) => return BindingEnd::Socket(end),
                }
            }
        };
        let downstream = async {
            let mut buf = vec![0u8; RELAY_CHUNK];
            loop {
                match target_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => return BindingEnd::TargetClosed,
                    Ok(n) => {
                        if let Err(end) = socket.send(&buf[..n]).await {
                            return BindingEnd::Socket(end);
                        }
                    }
                }
            }
        };

        let end = tokio::select! {
            end = upstream => end,
            end = downstream => end,
            _ = self.stop.cancelled() => BindingEnd::ConnectionClosed,
        };
        debug!("tunnel to {} ended: {end:?}", self.target);
        end
    }

    /// Stops the relay; the target stream is dropped with it.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
