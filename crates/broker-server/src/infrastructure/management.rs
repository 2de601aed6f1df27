//! Management variant: the channel router bound to a socket.
//!
//! The router is created once, when the logical connection is created, and
//! lives until the connection closes.  A reconnect only changes which
//! socket [`ManagementConnection::serve`] reads from and pumps into; the
//! router's subscriptions and in-flight calls are untouched.

use std::sync::Arc;

use crate::application::{ChannelContext, ChannelDirectory, ChannelRouter};
use crate::infrastructure::connection::{BindingEnd, Outbox};
use crate::infrastructure::framed_socket::FramedSocket;

pub struct ManagementConnection {
    router: ChannelRouter,
    outbox: Outbox,
}

impl ManagementConnection {
    /// Builds the router from the directory's current channels.  Each
    /// channel is notified through `on_connect`.
    pub fn new(ctx: ChannelContext, directory: &ChannelDirectory, outbox_capacity: usize) -> Self {
        let outbox = Outbox::new(outbox_capacity);
        let router = ChannelRouter::new(ctx, directory, outbox.sender());
        Self { router, outbox }
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Feeds incoming messages to the router and drains the outbox into
    /// `socket` until the socket ends.
    pub async fn serve(&self, socket: &Arc<FramedSocket>) -> BindingEnd {
        let inbound = async {
            loop {
                match socket.recv().await {
                    Ok(message) => self.router.handle_message(&message),
                    Err(end) => return end,
                }
            }
        };
        tokio::select! {
            end = inbound => BindingEnd::Socket(end),
            end = self.outbox.pump(socket) => BindingEnd::Socket(end),
        }
    }

    /// Disposes the router: subscriptions stop, channels get
    /// `on_disconnect`.
    pub fn shutdown(&self) {
        self.router.dispose();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
