//! HigherSockd — rooms by key.
//!
//! Rooms are created on first use through a [`LazyRegistry`] and evicted
//! once they have had no sessions for the configured idle TTL. Dropping a
//! room from the registry drops its last handle, which ends its loop.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info};

use spacegrid_core::UserId;
use spacegrid_core::config::SockdConfig;

use crate::error::CapabilityResult;
use crate::registry::LazyRegistry;
use crate::room::{Room, Session, SocketConn};

pub struct HigherSockd {
    rooms: LazyRegistry<String, Room>,
    config: SockdConfig,
}

impl HigherSockd {
    pub fn new(config: SockdConfig) -> Self {
        Self {
            rooms: LazyRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &SockdConfig {
        &self.config
    }

    /// The room for `key`, started on first use. Counts as activity.
    pub async fn get_room(&self, key: &str) -> Arc<Room> {
        let config = &self.config;
        let result = self
            .rooms
            .get_or_try_init(key.to_string(), || async {
                Ok::<_, std::convert::Infallible>(Arc::new(Room::spawn(key, config)))
            })
            .await;
        let room = match result {
            Ok(room) => room,
            Err(never) => match never {},
        };
        room.touch();
        room
    }

    /// Join a connection to the live room for `room_key`.
    ///
    /// The room is leased before the registry is re-checked, so the room
    /// the session lands in is the one later sends will reach.
    pub async fn add_conn(
        &self,
        room_key: &str,
        user_id: UserId,
        conn: Box<dyn SocketConn>,
        conn_id: &str,
    ) -> CapabilityResult<Arc<Session>> {
        let key = room_key.to_string();
        loop {
            let room = self.get_room(room_key).await;
            let lease = room.lease();
            let live = self.rooms.get(&key).await;
            if live.is_some_and(|live| Arc::ptr_eq(&live, &room)) {
                let session = room.add_conn(user_id, conn, conn_id).await;
                drop(lease);
                return session;
            }
            debug!(room = %room_key, "room evicted during join, retrying");
        }
    }

    pub async fn broadcast(&self, room_key: &str, msg: Bytes) -> CapabilityResult<()> {
        self.get_room(room_key).await.broadcast(msg).await
    }

    pub async fn publish(&self, room_key: &str, topic: &str, msg: Bytes) -> CapabilityResult<()> {
        self.get_room(room_key).await.publish(topic, msg).await
    }

    pub async fn direct_message(&self, room_key: &str, conn_id: &str, msg: Bytes) -> CapabilityResult<()> {
        self.get_room(room_key).await.direct_message(conn_id, msg).await
    }

    pub async fn subscribe(&self, room_key: &str, conn_id: &str, topic: &str) -> CapabilityResult<()> {
        self.get_room(room_key).await.subscribe(conn_id, topic).await
    }

    pub async fn unsubscribe(&self, room_key: &str, conn_id: &str, topic: &str) -> CapabilityResult<()> {
        self.get_room(room_key).await.unsubscribe(conn_id, topic).await
    }

    /// Drop the room for `key` and close its sessions, e.g. when its
    /// capability is disabled. Returns how many sessions were closed.
    pub async fn close_room(&self, key: &str) -> usize {
        match self.rooms.remove(&key.to_string()).await {
            Some(room) => room.close_sessions().await,
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.len().await
    }

    /// Drop rooms with no sessions that have been idle for at least `ttl`.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let evicted = self.rooms.retain(|_, room| !room.is_idle(ttl)).await;
        if evicted > 0 {
            info!(evicted, "idle rooms evicted");
        }
        evicted
    }

    /// Periodically evict idle rooms until `shutdown` flips.
    pub async fn run_evictor(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.evict_interval());
        let ttl = self.config.idle_room_ttl();
        debug!(?ttl, "room evictor starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evict_idle(ttl).await;
                }
                _ = shutdown.changed() => {
                    debug!("room evictor shutting down");
                    break;
                }
            }
        }
    }
}
