//! Room — multiplexes many socket sessions for one capability instance.
//!
//! All deliveries and disconnect cleanups are serialized through a single
//! loop task per room. Deliveries snapshot the target sessions under the
//! read lock, then send without holding it. Each per-session send races a
//! timer; a session that cannot keep up loses the message, never the room.
//!
//! The loop ends once every [`Room`] handle and every session writer has
//! been dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{debug, info, warn};

use spacegrid_core::UserId;
use spacegrid_core::config::SockdConfig;

use crate::error::{CapabilityError, CapabilityResult};

/// Write half of a client connection.
#[async_trait]
pub trait SocketConn: Send {
    async fn send(&mut self, msg: Bytes) -> anyhow::Result<()>;
    async fn close(&mut self);
}

/// One connected client.
pub struct Session {
    pub conn_id: String,
    pub user_id: UserId,
    send: mpsc::Sender<Bytes>,
    close: Notify,
    teardown: Once,
    closed_and_cleaned: AtomicBool,
}

impl Session {
    fn new(conn_id: String, user_id: UserId, send: mpsc::Sender<Bytes>) -> Self {
        Self {
            conn_id,
            user_id,
            send,
            close: Notify::new(),
            teardown: Once::new(),
            closed_and_cleaned: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_and_cleaned.load(Ordering::SeqCst)
    }

    /// Stop the writer and close the connection. Only the first call acts.
    pub fn teardown(&self) {
        self.teardown.call_once(|| {
            self.closed_and_cleaned.store(true, Ordering::SeqCst);
            self.close.notify_one();
        });
    }

    /// Queue `msg` for the writer, giving up after `wait`.
    async fn deliver(&self, msg: Bytes, wait: Duration) -> bool {
        matches!(tokio::time::timeout(wait, self.send.send(msg)).await, Ok(Ok(())))
    }
}

#[derive(Default)]
struct RoomState {
    sessions: HashMap<String, Arc<Session>>,
    topics: HashMap<String, HashSet<String>>,
}

struct RoomInner {
    key: String,
    state: RwLock<RoomState>,
    session_count: AtomicUsize,
    /// Joins in flight; a leased room is never idle.
    leases: AtomicUsize,
    last_activity: Mutex<Instant>,
    broadcast_wait: Duration,
    publish_wait: Duration,
    session_buffer: usize,
}

#[derive(Clone)]
struct RoomSenders {
    broadcast: mpsc::Sender<Bytes>,
    publish: mpsc::Sender<(String, Bytes)>,
    direct: mpsc::Sender<(String, Bytes)>,
    disconnect: mpsc::Sender<String>,
}

struct RoomReceivers {
    broadcast: mpsc::Receiver<Bytes>,
    publish: mpsc::Receiver<(String, Bytes)>,
    direct: mpsc::Receiver<(String, Bytes)>,
    disconnect: mpsc::Receiver<String>,
}

/// Handle to a running room.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
    tx: RoomSenders,
}

impl Room {
    /// Create a room and spawn its loop. Must be called within a tokio runtime.
    pub fn spawn(key: impl Into<String>, config: &SockdConfig) -> Self {
        let capacity = config.room_channel_capacity.max(1);
        let (broadcast, broadcast_rx) = mpsc::channel(capacity);
        let (publish, publish_rx) = mpsc::channel(capacity);
        let (direct, direct_rx) = mpsc::channel(capacity);
        let (disconnect, disconnect_rx) = mpsc::channel(capacity);

        let inner = Arc::new(RoomInner {
            key: key.into(),
            state: RwLock::new(RoomState::default()),
            session_count: AtomicUsize::new(0),
            leases: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            broadcast_wait: config.broadcast_wait(),
            publish_wait: config.publish_wait(),
            session_buffer: config.session_buffer.max(1),
        });

        tokio::spawn(run_room(
            inner.clone(),
            RoomReceivers {
                broadcast: broadcast_rx,
                publish: publish_rx,
                direct: direct_rx,
                disconnect: disconnect_rx,
            },
        ));

        debug!(room = %inner.key, "room started");
        Self {
            inner,
            tx: RoomSenders {
                broadcast,
                publish,
                direct,
                disconnect,
            },
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Register a connection and start its writer.
    pub async fn add_conn(
        &self,
        user_id: UserId,
        conn: Box<dyn SocketConn>,
        conn_id: impl Into<String>,
    ) -> CapabilityResult<Arc<Session>> {
        let conn_id = conn_id.into();
        let (tx, rx) = mpsc::channel(self.inner.session_buffer);
        let session = Arc::new(Session::new(conn_id.clone(), user_id, tx));
        {
            let mut state = self.inner.state.write().await;
            if state.sessions.contains_key(&conn_id) {
                return Err(CapabilityError::DuplicateConn(conn_id));
            }
            state.sessions.insert(conn_id.clone(), session.clone());
            self.inner.session_count.store(state.sessions.len(), Ordering::SeqCst);
        }
        self.inner.touch();

        tokio::spawn(write_pump(
            session.clone(),
            rx,
            conn,
            self.tx.disconnect.clone(),
        ));
        debug!(room = %self.inner.key, %conn_id, user_id, "session added");
        Ok(session)
    }

    pub async fn broadcast(&self, msg: Bytes) -> CapabilityResult<()> {
        self.inner.touch();
        self.tx.broadcast.send(msg).await.map_err(|_| self.closed())
    }

    pub async fn publish(&self, topic: impl Into<String>, msg: Bytes) -> CapabilityResult<()> {
        self.inner.touch();
        self.tx
            .publish
            .send((topic.into(), msg))
            .await
            .map_err(|_| self.closed())
    }

    pub async fn direct_message(&self, conn_id: impl Into<String>, msg: Bytes) -> CapabilityResult<()> {
        self.inner.touch();
        self.tx
            .direct
            .send((conn_id.into(), msg))
            .await
            .map_err(|_| self.closed())
    }

    /// Queue cleanup of a session. Safe to call more than once.
    pub async fn disconnect(&self, conn_id: impl Into<String>) -> CapabilityResult<()> {
        self.tx
            .disconnect
            .send(conn_id.into())
            .await
            .map_err(|_| self.closed())
    }

    /// Add a live session to a topic. Unknown sessions are rejected.
    pub async fn subscribe(&self, conn_id: &str, topic: &str) -> CapabilityResult<()> {
        {
            let mut state = self.inner.state.write().await;
            if !state.sessions.contains_key(conn_id) {
                return Err(CapabilityError::NotFound(format!("connection {conn_id}")));
            }
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .insert(conn_id.to_string());
        }
        self.inner.touch();
        debug!(room = %self.inner.key, %conn_id, %topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, conn_id: &str, topic: &str) -> CapabilityResult<()> {
        let mut state = self.inner.state.write().await;
        if let Some(members) = state.topics.get_mut(topic) {
            members.remove(conn_id);
            if members.is_empty() {
                state.topics.remove(topic);
            }
        }
        drop(state);
        self.inner.touch();
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.inner.session_count.load(Ordering::SeqCst)
    }

    pub async fn topic_members(&self, topic: &str) -> Vec<String> {
        let state = self.inner.state.read().await;
        state
            .topics
            .get(topic)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// No sessions, no join in flight, and no activity for at least `ttl`.
    pub fn is_idle(&self, ttl: Duration) -> bool {
        self.session_count() == 0
            && self.inner.leases.load(Ordering::SeqCst) == 0
            && self.inner.idle_for() >= ttl
    }

    /// Tear down every session and forget all topics. Returns how many
    /// sessions were closed.
    pub async fn close_sessions(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.inner.state.write().await;
            state.topics.clear();
            let drained = state.sessions.drain().map(|(_, session)| session).collect();
            self.inner.session_count.store(0, Ordering::SeqCst);
            drained
        };
        for session in &sessions {
            session.teardown();
        }
        debug!(room = %self.inner.key, closed = sessions.len(), "room sessions closed");
        sessions.len()
    }

    /// Keep the room from going idle until the lease drops.
    pub fn lease(&self) -> RoomLease {
        self.inner.leases.fetch_add(1, Ordering::SeqCst);
        RoomLease {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn touch(&self) {
        self.inner.touch();
    }

    fn closed(&self) -> CapabilityError {
        CapabilityError::RoomClosed(self.inner.key.clone())
    }
}

/// Held across a join; see [`Room::lease`].
pub struct RoomLease {
    inner: Arc<RoomInner>,
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        self.inner.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RoomInner {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    async fn on_broadcast(&self, msg: Bytes) {
        let targets: Vec<Arc<Session>> = {
            let state = self.state.read().await;
            state.sessions.values().cloned().collect()
        };
        self.deliver(targets, msg, self.broadcast_wait).await;
    }

    async fn on_publish(&self, topic: &str, msg: Bytes) {
        let targets = self.topic_sessions(topic).await;
        self.deliver(targets, msg, self.publish_wait).await;
    }

    async fn on_direct(&self, conn_id: &str, msg: Bytes) {
        let target = self.state.read().await.sessions.get(conn_id).cloned();
        match target {
            Some(session) => self.deliver(vec![session], msg, self.publish_wait).await,
            None => debug!(room = %self.key, %conn_id, "direct message to unknown connection dropped"),
        }
    }

    async fn topic_sessions(&self, topic: &str) -> Vec<Arc<Session>> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| state.sessions.get(id).cloned())
            .collect()
    }

    async fn deliver(&self, targets: Vec<Arc<Session>>, msg: Bytes, wait: Duration) {
        let sends = targets.iter().map(|session| {
            let msg = msg.clone();
            async move {
                if !session.deliver(msg, wait).await {
                    warn!(
                        room = %self.key,
                        conn_id = %session.conn_id,
                        "session too slow, message dropped"
                    );
                }
            }
        });
        join_all(sends).await;
    }

    /// Remove a session, scrub its topics, tear it down and tell the former
    /// topics it left.
    async fn cleanup(&self, conn_id: &str) {
        let (session, notices) = {
            let mut state = self.state.write().await;
            let Some(session) = state.sessions.remove(conn_id) else {
                return;
            };
            self.session_count.store(state.sessions.len(), Ordering::SeqCst);

            let mut former = Vec::new();
            state.topics.retain(|topic, members| {
                if members.remove(conn_id) {
                    former.push(topic.clone());
                }
                !members.is_empty()
            });

            let notices: Vec<(String, Vec<Arc<Session>>)> = former
                .into_iter()
                .map(|topic| {
                    let members = state
                        .topics
                        .get(&topic)
                        .into_iter()
                        .flatten()
                        .filter_map(|id| state.sessions.get(id).cloned())
                        .collect();
                    (topic, members)
                })
                .collect();
            (session, notices)
        };

        session.teardown();
        self.touch();

        for (topic, members) in notices {
            if members.is_empty() {
                continue;
            }
            let notice = serde_json::json!({
                "type": "presence",
                "action": "leave",
                "topic": topic,
                "conn_id": session.conn_id,
                "user_id": session.user_id,
            });
            self.deliver(members, Bytes::from(notice.to_string()), self.publish_wait)
                .await;
        }

        info!(room = %self.key, %conn_id, "session cleaned up");
    }
}

async fn run_room(inner: Arc<RoomInner>, mut rx: RoomReceivers) {
    loop {
        tokio::select! {
            Some(msg) = rx.broadcast.recv() => inner.on_broadcast(msg).await,
            Some((topic, msg)) = rx.publish.recv() => inner.on_publish(&topic, msg).await,
            Some((conn_id, msg)) = rx.direct.recv() => inner.on_direct(&conn_id, msg).await,
            Some(conn_id) = rx.disconnect.recv() => inner.cleanup(&conn_id).await,
            else => break,
        }
    }
    debug!(room = %inner.key, "room loop stopped");
}

/// Move queued messages onto the connection until the session is torn
/// down or a write fails.
async fn write_pump(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Bytes>,
    mut conn: Box<dyn SocketConn>,
    disconnect: mpsc::Sender<String>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = conn.send(msg).await {
                        debug!(conn_id = %session.conn_id, error = %e, "socket write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = session.close.notified() => break,
        }
    }

    conn.close().await;
    if !session.is_closed() {
        let _ = disconnect.send(session.conn_id.clone()).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Connection that forwards every frame to a test channel.
    pub(crate) struct ChannelConn {
        pub tx: mpsc::UnboundedSender<Bytes>,
        pub closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SocketConn for ChannelConn {
        async fn send(&mut self, msg: Bytes) -> anyhow::Result<()> {
            self.tx.send(msg).map_err(|_| anyhow::anyhow!("receiver gone"))
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connection whose writes never complete.
    struct StuckConn;

    #[async_trait]
    impl SocketConn for StuckConn {
        async fn send(&mut self, _msg: Bytes) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Connection whose first write fails.
    struct BrokenConn;

    #[async_trait]
    impl SocketConn for BrokenConn {
        async fn send(&mut self, _msg: Bytes) -> anyhow::Result<()> {
            anyhow::bail!("broken pipe")
        }

        async fn close(&mut self) {}
    }

    pub(crate) fn channel_conn() -> (Box<dyn SocketConn>, mpsc::UnboundedReceiver<Bytes>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Box::new(ChannelConn {
                tx,
                closed: closed.clone(),
            }),
            rx,
            closed,
        )
    }

    pub(crate) fn fast_config() -> SockdConfig {
        SockdConfig {
            session_buffer: 1,
            broadcast_wait_ms: 30,
            publish_wait_ms: 30,
            ..Default::default()
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        let (a, mut a_rx, _) = channel_conn();
        let (b, mut b_rx, _) = channel_conn();
        room.add_conn(1, a, "a").await.unwrap();
        room.add_conn(2, b, "b").await.unwrap();

        room.broadcast(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(recv(&mut a_rx).await, "hello");
        assert_eq!(recv(&mut b_rx).await, "hello");
    }

    #[tokio::test]
    async fn publish_only_reaches_subscribers() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        let (a, mut a_rx, _) = channel_conn();
        let (b, mut b_rx, _) = channel_conn();
        room.add_conn(1, a, "a").await.unwrap();
        room.add_conn(2, b, "b").await.unwrap();
        room.subscribe("a", "chat").await.unwrap();

        room.publish("chat", Bytes::from_static(b"m1")).await.unwrap();
        room.direct_message("b", Bytes::from_static(b"dm")).await.unwrap();

        assert_eq!(recv(&mut a_rx).await, "m1");
        assert_eq!(recv(&mut b_rx).await, "dm");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_requires_session() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        assert!(matches!(
            room.subscribe("ghost", "chat").await,
            Err(CapabilityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_conn_id_rejected() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        let (a, _a_rx, _) = channel_conn();
        let (b, _b_rx, _) = channel_conn();
        room.add_conn(1, a, "same").await.unwrap();
        assert!(matches!(
            room.add_conn(1, b, "same").await,
            Err(CapabilityError::DuplicateConn(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_scrubs_topics_and_notifies() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        let (a, _a_rx, a_closed) = channel_conn();
        let (b, mut b_rx, _) = channel_conn();
        let a_session = room.add_conn(1, a, "a").await.unwrap();
        room.add_conn(2, b, "b").await.unwrap();
        room.subscribe("a", "chat").await.unwrap();
        room.subscribe("b", "chat").await.unwrap();
        room.subscribe("a", "solo").await.unwrap();

        room.disconnect("a").await.unwrap();
        room.disconnect("a").await.unwrap();

        let notice: serde_json::Value = serde_json::from_slice(&recv(&mut b_rx).await).unwrap();
        assert_eq!(notice["action"], "leave");
        assert_eq!(notice["topic"], "chat");
        assert_eq!(notice["conn_id"], "a");

        assert_eq!(room.session_count(), 1);
        assert_eq!(room.topic_members("chat").await, vec!["b".to_string()]);
        assert!(room.topic_members("solo").await.is_empty());
        assert!(a_session.is_closed());
        wait_until(|| a_closed.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn write_failure_triggers_cleanup() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        room.add_conn(1, Box::new(BrokenConn), "x").await.unwrap();
        room.broadcast(Bytes::from_static(b"boom")).await.unwrap();
        wait_until(|| room.session_count() == 0).await;
    }

    #[tokio::test]
    async fn stuck_session_does_not_block_others() {
        let room = Room::spawn("cap-1", &fast_config());
        room.add_conn(1, Box::new(StuckConn), "stuck").await.unwrap();
        let (good, mut good_rx, _) = channel_conn();
        room.add_conn(2, good, "good").await.unwrap();

        for i in 0..5 {
            room.broadcast(Bytes::from(format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(recv(&mut good_rx).await, format!("m{i}"));
        }
        assert_eq!(room.session_count(), 2);
    }

    #[tokio::test]
    async fn idle_only_without_sessions() {
        let room = Room::spawn("cap-1", &SockdConfig::default());
        assert!(room.is_idle(Duration::ZERO));
        let (a, _rx, _) = channel_conn();
        room.add_conn(1, a, "a").await.unwrap();
        assert!(!room.is_idle(Duration::ZERO));
        assert!(!room.is_idle(Duration::from_secs(3600)));
    }
}
