//! ConnectionRegistry: the map from `(type, token)` to logical connection.
//!
//! Every handshake that reaches the routing step calls
//! [`ConnectionRegistry::resolve`], which decides between four outcomes:
//!
//! | hello              | entry for token | outcome                      |
//! |--------------------|-----------------|------------------------------|
//! | fresh              | absent          | create, bind, `Connected`    |
//! | reconnection       | Online/Offline  | rebind, `Reconnected`        |
//! | reconnection       | absent          | `StaleSession`               |
//! | fresh              | present         | `TokenCollision`             |
//!
//! # Locking (for beginners)
//!
//! Each connection type has its own bucket behind its own
//! `parking_lot::Mutex`, so a Management handshake never waits for a Tunnel
//! handshake.  A second table (`claims`) records which type holds each
//! token so a fresh token cannot be claimed by two types at once.  It is
//! split into [`CLAIM_SHARDS`] mutexes picked by token hash: two handshakes
//! only meet there when their tokens land in the same shard, and a token
//! shared by two types always does.  The lock order is always *bucket, then
//! claim shard*; no code path takes them the other way round or holds two
//! shards at once, which rules out deadlock.
//!
//! None of these locks is ever held across an `.await`.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Instant;

use broker_core::protocol::{ConnectionType, SessionHello};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::domain::connection::select_evictions;
use crate::domain::{
    BrokerError, ConnectionEvent, ConnectionInfo, ConnectionState, RedactedToken, RetentionPolicy,
};

/// Capacity of the lifecycle event channel.  Slow subscribers observe
/// `RecvError::Lagged` rather than slowing the registry down.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Number of independently locked shards in the token claim table.
pub const CLAIM_SHARDS: usize = 16;

/// The lifecycle operations the registry needs from a logical connection.
///
/// The production implementation is `infrastructure::LogicalConnection`;
/// tests use a lightweight fake.
pub trait SessionEntry: Send + Sync + 'static {
    /// Handle to the physical socket bound to this connection.
    type Socket: Send;

    fn token(&self) -> &str;
    fn connection_type(&self) -> ConnectionType;
    fn created_at(&self) -> Instant;
    fn state(&self) -> ConnectionState;

    /// Binds `socket`, closing any previously bound socket, and moves the
    /// connection to Online.  Returns the new binding generation.
    fn bind(&self, socket: Self::Socket) -> u64;

    /// Moves Online → Offline if `generation` is still the current binding.
    /// Returns `false` when a newer socket has been bound since, or the
    /// connection is not Online.
    fn go_offline(&self, generation: u64) -> bool;

    /// Releases everything the connection owns.  Idempotent.
    fn close(&self);

    /// Whether a dropped socket leaves the session waiting for a reconnection.
    fn supports_reconnection(&self) -> bool {
        true
    }
}

/// How a successful [`ConnectionRegistry::resolve`] was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Created,
    Reconnected,
}

/// The connection a hello was routed to.
pub struct Resolved<C> {
    pub connection: Arc<C>,
    /// Binding generation of the socket passed to `resolve`.
    pub generation: u64,
    pub outcome: ResolveOutcome,
}

impl<C> std::fmt::Debug for Resolved<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("generation", &self.generation)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// Result of [`ConnectionRegistry::mark_offline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineOutcome {
    /// The connection is Offline; `evicted` older entries were closed.
    Offline { evicted: usize },
    /// The variant does not support reconnection, so it was removed.
    Removed,
    /// A newer socket was bound in the meantime; nothing changed.
    Superseded,
    /// The connection is no longer in the registry.
    NotTracked,
}

/// Which type holds each token, sharded by token hash.
struct ClaimTable {
    shards: [Mutex<HashMap<String, ConnectionType>>; CLAIM_SHARDS],
    hasher: RandomState,
}

impl ClaimTable {
    fn new() -> Self {
        Self {
            shards: Default::default(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, token: &str) -> &Mutex<HashMap<String, ConnectionType>> {
        let index = self.hasher.hash_one(token) as usize % CLAIM_SHARDS;
        &self.shards[index]
    }

    /// Claims `token` for `kind`, or returns the type already holding it.
    fn claim(&self, token: &str, kind: ConnectionType) -> Result<(), ConnectionType> {
        let mut shard = self.shard(token).lock();
        if let Some(holder) = shard.get(token) {
            return Err(*holder);
        }
        shard.insert(token.to_string(), kind);
        Ok(())
    }

    fn release(&self, token: &str) {
        self.shard(token).lock().remove(token);
    }
}

/// Per-type map of logical connections.
pub struct ConnectionRegistry<C: SessionEntry> {
    buckets: [Mutex<HashMap<String, Arc<C>>>; 3],
    claims: ClaimTable,
    retention: RetentionPolicy,
    events: broadcast::Sender<ConnectionEvent>,
}

impl<C: SessionEntry> ConnectionRegistry<C> {
    pub fn new(retention: RetentionPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            buckets: Default::default(),
            claims: ClaimTable::new(),
            retention,
            events,
        }
    }

    fn bucket(&self, kind: ConnectionType) -> &Mutex<HashMap<String, Arc<C>>> {
        match kind {
            ConnectionType::Management => &self.buckets[0],
            ConnectionType::ComputeProcess => &self.buckets[1],
            ConnectionType::Tunnel => &self.buckets[2],
        }
    }

    fn publish(&self, event: ConnectionEvent) {
        // An error only means nobody is subscribed.
        let _ = self.events.send(event);
    }

    /// Routes a validated hello to a logical connection.
    ///
    /// `create` builds the connection for the fresh-token path.  It runs with
    /// the type's bucket locked, so it must not block for long; if it fails
    /// the token claim is released and nothing is inserted.
    ///
    /// On success `socket` is bound to the returned connection.  On failure
    /// it is dropped; callers that still need to send an error reply keep
    /// their own handle to it.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::StaleSession`] – reconnection to an unknown token.
    /// - [`BrokerError::TokenCollision`] – fresh hello for a held token.
    /// - Whatever `create` returns (e.g. `SpawnFailure`).
    pub fn resolve<F>(
        &self,
        hello: &SessionHello,
        socket: C::Socket,
        create: F,
    ) -> Result<Resolved<C>, BrokerError>
    where
        F: FnOnce() -> Result<C, BrokerError>,
    {
        let kind = hello.connection_type;
        let token = hello.reconnection_token.as_str();
        let shown = RedactedToken(token);

        let mut bucket = self.bucket(kind).lock();
        let existing = bucket.get(token).cloned();

        match (hello.is_reconnection_attempt, existing) {
            (false, None) => {
                if let Err(holder) = self.claims.claim(token, kind) {
                    error!(
                        "token collision: fresh {kind} hello for token {shown} held by a {holder} session"
                    );
                    return Err(BrokerError::TokenCollision {
                        holder,
                        token: shown.to_string(),
                    });
                }

                let connection = match create() {
                    Ok(c) => Arc::new(c),
                    Err(e) => {
                        self.claims.release(token);
                        warn!("could not create {kind} connection {shown}: {e}");
                        return Err(e);
                    }
                };
                let generation = connection.bind(socket);
                bucket.insert(token.to_string(), Arc::clone(&connection));
                drop(bucket);

                info!("{kind} connection {shown} created");
                self.publish(ConnectionEvent::Connected {
                    kind,
                    token: token.to_string(),
                });
                Ok(Resolved {
                    connection,
                    generation,
                    outcome: ResolveOutcome::Created,
                })
            }

            (true, Some(connection)) => {
                let state = connection.state();
                if !state.accepts_reconnection() {
                    warn!("reconnection to {kind} connection {shown} in state {state} refused");
                    return Err(BrokerError::StaleSession {
                        kind,
                        token: shown.to_string(),
                    });
                }
                let generation = connection.bind(socket);
                drop(bucket);

                info!("{kind} connection {shown} reconnected (was {state})");
                self.publish(ConnectionEvent::Reconnected {
                    kind,
                    token: token.to_string(),
                });
                Ok(Resolved {
                    connection,
                    generation,
                    outcome: ResolveOutcome::Reconnected,
                })
            }

            (true, None) => {
                warn!("reconnection for unknown {kind} token {shown}");
                Err(BrokerError::StaleSession {
                    kind,
                    token: shown.to_string(),
                })
            }

            (false, Some(_)) => {
                error!("token collision: fresh {kind} hello for live token {shown}");
                Err(BrokerError::TokenCollision {
                    holder: kind,
                    token: shown.to_string(),
                })
            }
        }
    }

    /// Records that `connection`'s socket (binding `generation`) dropped
    /// without a clean close.
    ///
    /// Reconnectable connections go Offline and the retention policy closes
    /// surplus Offline entries of the same type.  Other connections are
    /// removed.
    pub fn mark_offline(&self, connection: &Arc<C>, generation: u64) -> OfflineOutcome {
        if !connection.supports_reconnection() {
            return if self.remove(connection) {
                OfflineOutcome::Removed
            } else {
                OfflineOutcome::NotTracked
            };
        }

        let kind = connection.connection_type();
        let token = connection.token();
        let shown = RedactedToken(token);

        let victims: Vec<Arc<C>> = {
            let mut bucket = self.bucket(kind).lock();
            match bucket.get(token) {
                Some(current) if Arc::ptr_eq(current, connection) => {}
                _ => return OfflineOutcome::NotTracked,
            }
            if !connection.go_offline(generation) {
                debug!("{kind} connection {shown}: stale offline notification ignored");
                return OfflineOutcome::Superseded;
            }

            let candidates: Vec<(String, Instant)> = bucket
                .iter()
                .filter(|(_, c)| {
                    !Arc::ptr_eq(c, connection) && c.state() == ConnectionState::Offline
                })
                .map(|(t, c)| (t.clone(), c.created_at()))
                .collect();
            let doomed = select_evictions(candidates, self.retention.extra_offline(kind));

            doomed
                .into_iter()
                .filter_map(|t| {
                    self.claims.release(&t);
                    bucket.remove(&t)
                })
                .collect()
        };

        info!("{kind} connection {shown} offline");
        self.publish(ConnectionEvent::Offline {
            kind,
            token: token.to_string(),
        });

        let evicted = victims.len();
        for victim in victims {
            info!(
                "evicting offline {kind} connection {}",
                RedactedToken(victim.token())
            );
            victim.close();
            self.publish(ConnectionEvent::Closed {
                kind,
                token: victim.token().to_string(),
                evicted: true,
            });
        }
        OfflineOutcome::Offline { evicted }
    }

    /// Removes `connection` (if it is still the registered entry for its
    /// token) and closes it.  Returns `true` if an entry was removed.
    ///
    /// The connection is closed even when it is no longer registered.
    pub fn remove(&self, connection: &Arc<C>) -> bool {
        let kind = connection.connection_type();
        let token = connection.token();

        let removed = {
            let mut bucket = self.bucket(kind).lock();
            match bucket.get(token) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    bucket.remove(token);
                    self.claims.release(token);
                    true
                }
                _ => false,
            }
        };

        connection.close();
        if removed {
            info!("{kind} connection {} closed", RedactedToken(token));
            self.publish(ConnectionEvent::Closed {
                kind,
                token: token.to_string(),
                evicted: false,
            });
        }
        removed
    }

    /// Looks up a connection without changing it.
    pub fn get(&self, kind: ConnectionType, token: &str) -> Option<Arc<C>> {
        self.bucket(kind).lock().get(token).cloned()
    }

    /// Subscribes to lifecycle events.  Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Diagnostic snapshot of every entry, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = ConnectionType::ALL
            .iter()
            .flat_map(|kind| {
                self.bucket(*kind)
                    .lock()
                    .values()
                    .map(|c| ConnectionInfo {
                        token: c.token().to_string(),
                        kind: *kind,
                        state: c.state(),
                        created_at: c.created_at(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        infos.sort_by_key(|i| i.created_at);
        infos
    }

    /// Number of entries of `kind`.
    pub fn len(&self, kind: ConnectionType) -> usize {
        self.bucket(kind).lock().len()
    }

    /// Returns `true` when no connection of any type is registered.
    pub fn is_empty(&self) -> bool {
        ConnectionType::ALL.iter().all(|k| self.len(*k) == 0)
    }

    /// Removes and closes every connection.  Used on shutdown.
    pub fn close_all(&self) {
        for kind in ConnectionType::ALL {
            let drained: Vec<Arc<C>> = {
                let mut bucket = self.bucket(kind).lock();
                bucket
                    .drain()
                    .map(|(token, c)| {
                        self.claims.release(&token);
                        c
                    })
                    .collect()
            };
            for connection in drained {
                connection.close();
                self.publish(ConnectionEvent::Closed {
                    kind,
                    token: connection.token().to_string(),
                    evicted: false,
                });
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
