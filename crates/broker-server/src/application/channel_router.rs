//! Channel router: named request/response and event channels multiplexed
//! over one Management connection.
//!
//! # How it fits together (for beginners)
//!
//! Other subsystems register *server channels* in a shared
//! [`ChannelDirectory`] before any client connects.  Each Management
//! connection gets its own [`ChannelRouter`], built from a snapshot of that
//! directory.  The router:
//!
//! 1. Parses each incoming text message as a [`RouterRequest`].
//! 2. Dispatches `call` to the named channel on its own task and queues the
//!    `result` / `error` reply.
//! 3. Turns `listen` into a long-lived subscription task that forwards every
//!    event item until the client sends `dispose` or the connection closes.
//!
//! Replies and events go into the connection's *outbox*, not straight to a
//! socket.  That is what lets subscriptions survive a reconnect: the socket
//! underneath is swapped, the router and its tasks are untouched, and events
//! produced while Offline wait in the outbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Outbound, RouterRequest, RouterResponse};

/// Name of the channel every directory starts with.
pub const PING_CHANNEL: &str = "ping";

/// Errors a channel reports back to the caller as `{"type":"error"}`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("{0}")]
    Failed(String),
}

/// What a channel knows about the connection calling it.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Stable for the lifetime of the logical connection, across reconnects.
    pub connection_id: Uuid,
    /// The client's build identifier from its hello.
    pub peer_version: String,
    /// The hello's `args` mapping.
    pub args: Map<String, Value>,
}

/// A named handler that clients reach through the router.
#[async_trait]
pub trait ServerChannel: Send + Sync + 'static {
    /// Handles one `call` request.
    async fn call(
        &self,
        ctx: &ChannelContext,
        command: &str,
        arg: Value,
    ) -> Result<Value, ChannelError>;

    /// Opens an event stream for one `listen` request.
    fn listen(
        &self,
        _ctx: &ChannelContext,
        event: &str,
        _arg: Value,
    ) -> Result<BoxStream<'static, Value>, ChannelError> {
        Err(ChannelError::UnknownEvent(event.to_string()))
    }

    /// A Management connection that can reach this channel was created.
    fn on_connect(&self, _ctx: &ChannelContext) {}

    /// That connection was closed for good.  Release per-connection state.
    fn on_disconnect(&self, _ctx: &ChannelContext) {}
}

/// Registry of named channels shared by every Management connection.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct ChannelDirectory {
    channels: Arc<RwLock<HashMap<String, Arc<dyn ServerChannel>>>>,
}

impl ChannelDirectory {
    /// Creates a directory holding only the built-in [`PingChannel`].
    pub fn new() -> Self {
        let directory = Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        };
        directory.register(PING_CHANNEL, Arc::new(PingChannel));
        directory
    }

    /// Registers (or replaces) `name`.  Connections created afterwards see it;
    /// existing routers keep the snapshot they were built with.
    pub fn register(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        let name = name.into();
        debug!("channel '{name}' registered");
        self.channels.write().insert(name, channel);
    }

    /// Removes `name`.  Returns `true` if it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.channels.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn snapshot(&self) -> HashMap<String, Arc<dyn ServerChannel>> {
        self.channels.read().clone()
    }
}

impl Default for ChannelDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in health-check channel.
///
/// `call ping <arg>` answers with `<arg>`.
pub struct PingChannel;

#[async_trait]
impl ServerChannel for PingChannel {
    async fn call(
        &self,
        _ctx: &ChannelContext,
        command: &str,
        arg: Value,
    ) -> Result<Value, ChannelError> {
        match command {
            "ping" => Ok(arg),
            other => Err(ChannelError::UnknownCommand(other.to_string())),
        }
    }
}

/// A running `listen` forwarder.  `serial` tells a finished task whether
/// the entry under its id is still its own or a later replacement.
struct Subscription {
    serial: u64,
    task: JoinHandle<()>,
}

/// Per-connection request dispatcher.
pub struct ChannelRouter {
    ctx: Arc<ChannelContext>,
    channels: HashMap<String, Arc<dyn ServerChannel>>,
    outbox: mpsc::Sender<Outbound>,
    subscriptions: Arc<Mutex<HashMap<u64, Subscription>>>,
    next_serial: AtomicU64,
    shutdown: CancellationToken,
}

impl ChannelRouter {
    /// Builds a router from the directory's current channels and notifies
    /// each of them with `on_connect`.
    pub fn new(
        ctx: ChannelContext,
        directory: &ChannelDirectory,
        outbox: mpsc::Sender<Outbound>,
    ) -> Self {
        let channels = directory.snapshot();
        for channel in channels.values() {
            channel.on_connect(&ctx);
        }
        Self {
            ctx: Arc::new(ctx),
            channels,
            outbox,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    /// Parses and dispatches one text message.  Malformed messages are
    /// logged and dropped; they never close the connection.
    pub fn handle_message(&self, payload: &[u8]) {
        match serde_json::from_slice::<RouterRequest>(payload) {
            Ok(request) => self.handle_request(request),
            Err(e) => warn!(
                "connection {}: ignoring malformed router message: {e}",
                self.ctx.connection_id
            ),
        }
    }

    /// Dispatches one parsed request.  Never blocks: calls and
    /// subscriptions run on their own tasks.
    pub fn handle_request(&self, request: RouterRequest) {
        if self.shutdown.is_cancelled() {
            return;
        }
        match request {
            RouterRequest::Call {
                id,
                channel,
                command,
                arg,
            } => self.spawn_call(id, channel, command, arg),
            RouterRequest::Listen {
                id,
                channel,
                event,
                arg,
            } => self.start_subscription(id, &channel, &event, arg),
            RouterRequest::Dispose { id } => {
                if let Some(subscription) = self.subscriptions.lock().remove(&id) {
                    debug!("subscription {id} disposed");
                    subscription.task.abort();
                }
            }
        }
    }

    fn spawn_call(&self, id: u64, channel: String, command: String, arg: Value) {
        let target = self.channels.get(&channel).cloned();
        let ctx = Arc::clone(&self.ctx);
        let outbox = self.outbox.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let result = match target {
                Some(target) => {
                    tokio::select! {
                        r = target.call(&ctx, &command, arg) => r,
                        _ = shutdown.cancelled() => return,
                    }
                }
                None => Err(ChannelError::UnknownChannel(channel)),
            };
            let response = match result {
                Ok(data) => RouterResponse::Result { id, data },
                Err(e) => RouterResponse::Error {
                    id,
                    message: e.to_string(),
                },
            };
            let _ = outbox.send(response.to_outbound()).await;
        });
    }

    fn start_subscription(&self, id: u64, channel: &str, event: &str, arg: Value) {
        let stream = match self.channels.get(channel) {
            Some(target) => target.listen(&self.ctx, event, arg),
            None => Err(ChannelError::UnknownChannel(channel.to_string())),
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let response = RouterResponse::Error {
                    id,
                    message: e.to_string(),
                };
                // Reply from the caller's context so the error is queued
                // in order with everything else.
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let _ = outbox.send(response.to_outbound()).await;
                });
                return;
            }
        };

        let outbox = self.outbox.clone();
        let shutdown = self.shutdown.clone();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let table = Arc::downgrade(&self.subscriptions);

        // The lock is held across the spawn so a stream that ends at once
        // cannot unregister itself before it is inserted.
        let mut subscriptions = self.subscriptions.lock();
        let task = tokio::spawn(async move {
            forward_events(id, &mut stream, &outbox, &shutdown).await;
            if let Some(table) = table.upgrade() {
                let mut table = table.lock();
                if table.get(&id).is_some_and(|s| s.serial == serial) {
                    table.remove(&id);
                }
            }
        });
        if let Some(previous) = subscriptions.insert(id, Subscription { serial, task }) {
            debug!("subscription {id} replaced");
            previous.task.abort();
        }
    }

    /// Number of subscriptions whose task is still running.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| !s.task.is_finished())
            .count()
    }

    /// Cancels every call and subscription and notifies each channel with
    /// `on_disconnect`.  Idempotent.
    pub fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for (_, subscription) in self.subscriptions.lock().drain() {
            subscription.task.abort();
        }
        for channel in self.channels.values() {
            channel.on_disconnect(&self.ctx);
        }
        info!("connection {}: channel router disposed", self.ctx.connection_id);
    }
}

/// Forwards one event stream into the outbox until it ends, the outbox
/// closes, or the router shuts down.  A natural end is followed by
/// `eventEnd`.
async fn forward_events(
    id: u64,
    stream: &mut BoxStream<'static, Value>,
    outbox: &mpsc::Sender<Outbound>,
    shutdown: &CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = shutdown.cancelled() => return,
        };
        let response = match item {
            Some(data) => RouterResponse::Event { id, data },
            None => {
                let _ = outbox.send(RouterResponse::EventEnd { id }.to_outbound()).await;
                return;
            }
        };
        if outbox.send(response.to_outbound()).await.is_err() {
            return;
        }
    }
}

impl Drop for ChannelRouter {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::stream;
    use serde_json::json;
    use tokio::time::timeout;

    /// Counts connect/disconnect notifications and serves an endless
    /// `ticks` stream plus a finite `three` stream.
    #[derive(Default)]
    struct Recorder {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl ServerChannel for Recorder {
        async fn call(
            &self,
            ctx: &ChannelContext,
            command: &str,
            _arg: Value,
        ) -> Result<Value, ChannelError> {
            match command {
                "whoami" => Ok(json!(ctx.peer_version)),
                "fail" => Err(ChannelError::Failed("boom".into())),
                other => Err(ChannelError::UnknownCommand(other.into())),
            }
        }

        fn listen(
            &self,
            _ctx: &ChannelContext,
            event: &str,
            _arg: Value,
        ) -> Result<BoxStream<'static, Value>, ChannelError> {
            match event {
                "ticks" => Ok(stream::unfold(0u64, |n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((json!(n), n + 1))
                })
                .boxed()),
                "three" => Ok(stream::iter(vec![json!(1), json!(2), json!(3)]).boxed()),
                other => Err(ChannelError::UnknownEvent(other.into())),
            }
        }

        fn on_connect(&self, _ctx: &ChannelContext) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _ctx: &ChannelContext) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ctx() -> ChannelContext {
        ChannelContext {
            connection_id: Uuid::new_v4(),
            peer_version: "abc".into(),
            args: Map::new(),
        }
    }

    fn router_with_recorder() -> (ChannelRouter, Arc<Recorder>, mpsc::Receiver<Outbound>) {
        let directory = ChannelDirectory::new();
        let recorder = Arc::new(Recorder::default());
        directory.register("rec", recorder.clone());
        let (tx, rx) = mpsc::channel(64);
        (ChannelRouter::new(ctx(), &directory, tx), recorder, rx)
    }

    async fn next_response(rx: &mut mpsc::Receiver<Outbound>) -> RouterResponse {
        let msg = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("response within 2s")
            .expect("outbox open");
        match msg {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Binary(_) => panic!("router replies are text"),
        }
    }

    #[test]
    fn test_directory_starts_with_ping_channel() {
        assert_eq!(ChannelDirectory::new().names(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_directory_unregister() {
        let directory = ChannelDirectory::new();
        assert!(directory.unregister("ping"));
        assert!(!directory.unregister("ping"));
        assert!(directory.names().is_empty());
    }

    #[tokio::test]
    async fn test_ping_call_echoes_argument() {
        // Arrange
        let (router, _rec, mut rx) = router_with_recorder();

        // Act
        router.handle_message(
            br#"{"type":"call","id":1,"channel":"ping","command":"ping","arg":{"n":5}}"#,
        );

        // Assert
        assert_eq!(
            next_response(&mut rx).await,
            RouterResponse::Result {
                id: 1,
                data: json!({"n": 5})
            }
        );
    }

    #[tokio::test]
    async fn test_call_sees_connection_context() {
        let (router, _rec, mut rx) = router_with_recorder();

        router.handle_request(RouterRequest::Call {
            id: 2,
            channel: "rec".into(),
            command: "whoami".into(),
            arg: Value::Null,
        });

        assert_eq!(
            next_response(&mut rx).await,
            RouterResponse::Result {
                id: 2,
                data: json!("abc")
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_channel_replies_with_error() {
        let (router, _rec, mut rx) = router_with_recorder();

        router.handle_request(RouterRequest::Call {
            id: 3,
            channel: "nope".into(),
            command: "x".into(),
            arg: Value::Null,
        });

        assert_eq!(
            next_response(&mut rx).await,
            RouterResponse::Error {
                id: 3,
                message: "unknown channel: nope".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_call_replies_with_error_message() {
        let (router, _rec, mut rx) = router_with_recorder();

        router.handle_request(RouterRequest::Call {
            id: 4,
            channel: "rec".into(),
            command: "fail".into(),
            arg: Value::Null,
        });

        assert_eq!(
            next_response(&mut rx).await,
            RouterResponse::Error {
                id: 4,
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let (router, _rec, mut rx) = router_with_recorder();

        router.handle_message(b"{not json");

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_finite_stream_ends_with_event_end() {
        // Arrange
        let (router, _rec, mut rx) = router_with_recorder();

        // Act
        router.handle_request(RouterRequest::Listen {
            id: 9,
            channel: "rec".into(),
            event: "three".into(),
            arg: Value::Null,
        });

        // Assert
        for n in 1..=3 {
            assert_eq!(
                next_response(&mut rx).await,
                RouterResponse::Event {
                    id: 9,
                    data: json!(n)
                }
            );
        }
        assert_eq!(next_response(&mut rx).await, RouterResponse::EventEnd { id: 9 });
    }

    #[tokio::test]
    async fn test_finished_subscriptions_are_unregistered() {
        // Arrange
        let (router, _rec, mut rx) = router_with_recorder();
        let listens = 200u64;

        // Act
        for id in 0..listens {
            router.handle_request(RouterRequest::Listen {
                id,
                channel: "rec".into(),
                event: "three".into(),
                arg: Value::Null,
            });
        }
        let mut ended = 0;
        while ended < listens {
            if let RouterResponse::EventEnd { .. } = next_response(&mut rx).await {
                ended += 1;
            }
        }

        // Assert
        timeout(Duration::from_secs(2), async {
            while !router.subscriptions.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("finished subscriptions left in the table");
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_reused_id_keeps_the_newer_subscription() {
        // Arrange
        let (router, _rec, mut rx) = router_with_recorder();
        router.handle_request(RouterRequest::Listen {
            id: 4,
            channel: "rec".into(),
            event: "three".into(),
            arg: Value::Null,
        });
        while next_response(&mut rx).await != (RouterResponse::EventEnd { id: 4 }) {}

        // Act
        router.handle_request(RouterRequest::Listen {
            id: 4,
            channel: "rec".into(),
            event: "ticks".into(),
            arg: Value::Null,
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Assert
        assert_eq!(router.subscription_count(), 1);
        assert!(router.subscriptions.lock().contains_key(&4));
    }

    #[tokio::test]
    async fn test_dispose_request_stops_subscription() {
        // Arrange
        let (router, _rec, mut rx) = router_with_recorder();
        router.handle_request(RouterRequest::Listen {
            id: 5,
            channel: "rec".into(),
            event: "ticks".into(),
            arg: Value::Null,
        });
        assert!(matches!(
            next_response(&mut rx).await,
            RouterResponse::Event { id: 5, .. }
        ));

        // Act
        router.handle_request(RouterRequest::Dispose { id: 5 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        while rx.try_recv().is_ok() {}

        // Assert
        assert_eq!(router.subscription_count(), 0);
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_event_replies_with_error() {
        let (router, _rec, mut rx) = router_with_recorder();

        router.handle_request(RouterRequest::Listen {
            id: 6,
            channel: "rec".into(),
            event: "nope".into(),
            arg: Value::Null,
        });

        assert_eq!(
            next_response(&mut rx).await,
            RouterResponse::Error {
                id: 6,
                message: "unknown event: nope".into()
            }
        );
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_router_notifies_connect_and_disconnect_once() {
        // Arrange
        let (router, recorder, _rx) = router_with_recorder();
        router.handle_request(RouterRequest::Listen {
            id: 1,
            channel: "rec".into(),
            event: "ticks".into(),
            arg: Value::Null,
        });
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);

        // Act
        router.dispose();
        router.dispose();

        // Assert
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_requests_after_dispose_are_ignored() {
        let (router, _rec, mut rx) = router_with_recorder();
        router.dispose();

        router.handle_message(br#"{"type":"call","id":1,"channel":"ping","command":"ping"}"#);

        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_subscriptions_keep_running_while_outbox_is_not_drained() {
        // Events produced while nobody drains the outbox wait there; the
        // subscription is not dropped.
        let (router, _rec, mut rx) = router_with_recorder();
        router.handle_request(RouterRequest::Listen {
            id: 8,
            channel: "rec".into(),
            event: "ticks".into(),
            arg: Value::Null,
        });

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(router.subscription_count(), 1);
        let mut seen = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            seen.push(serde_json::from_str::<RouterResponse>(&text).unwrap());
        }
        assert!(seen.len() >= 2, "events accumulated while undrained: {seen:?}");
        assert_eq!(seen[0], RouterResponse::Event { id: 8, data: json!(0) });
    }
}
