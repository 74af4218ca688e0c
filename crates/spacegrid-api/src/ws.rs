//! WebSocket bridge into capability rooms.
//!
//! `GET /ws/{space_id}/{capability}` upgrades the connection, joins it to
//! the capability's room, and turns each client text frame into a room
//! operation:
//!
//! ```json
//! {"action": "publish", "topic": "lobby", "message": {"text": "hi"}}
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use spacegrid_capability::{CapabilityError, CapabilityResult, HigherSockd, SocketConn};
use spacegrid_core::{SpaceId, UserId};

use crate::ApiState;
use crate::auth::AuthUser;
use crate::error::ApiResult;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameAction {
    Subscribe,
    Unsubscribe,
    Publish,
    DirectMessage,
    Broadcast,
}

/// One client frame.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub action: FrameAction,
    #[serde(default)]
    pub topic: Option<String>,
    /// Connection id for `direct_message`.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub message: Value,
}

/// Write half of an upgraded socket.
struct WsConn(SplitSink<WebSocket, Message>);

#[async_trait]
impl SocketConn for WsConn {
    async fn send(&mut self, msg: Bytes) -> anyhow::Result<()> {
        let frame = match String::from_utf8(msg.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(msg),
        };
        self.0.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

/// GET /ws/{space_id}/{capability}
pub async fn connect(
    State(state): State<ApiState>,
    AuthUser(claims): AuthUser,
    Path((space_id, capability)): Path<(SpaceId, String)>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    // Reject before upgrading so the client sees a proper status.
    state.engine.authorize_space(claims.user_id, space_id)?;
    state.engine.capabilities().find(space_id, &capability)?;

    Ok(upgrade.on_upgrade(move |socket| run_socket(state, claims.user_id, space_id, capability, socket)))
}

async fn run_socket(state: ApiState, user_id: UserId, space_id: SpaceId, capability: String, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let conn_id = format!("{user_id}-{}", NEXT_CONN.fetch_add(1, Ordering::Relaxed));

    let (room_key, session) = match state
        .engine
        .connect_socket(user_id, space_id, &capability, Box::new(WsConn(sink)), &conn_id)
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            warn!(space_id, %capability, error = %e, "socket join failed");
            return;
        }
    };
    debug!(room = %room_key, %conn_id, user_id, "socket connected");

    let sockd = state.engine.sockd();
    while let Some(next) = stream.next().await {
        if session.is_closed() {
            break;
        }
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let frame: ClientFrame = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%conn_id, error = %e, "ignoring malformed frame");
                continue;
            }
        };
        if let Err(e) = apply_frame(sockd, &room_key, &conn_id, frame).await {
            debug!(%conn_id, error = %e, "frame rejected");
        }
    }

    let _ = sockd.get_room(&room_key).await.disconnect(conn_id.as_str()).await;
    debug!(room = %room_key, %conn_id, "socket disconnected");
}

/// Apply one client frame to a room on behalf of `conn_id`.
pub async fn apply_frame(
    sockd: &HigherSockd,
    room_key: &str,
    conn_id: &str,
    frame: ClientFrame,
) -> CapabilityResult<()> {
    let topic = || {
        frame
            .topic
            .clone()
            .ok_or_else(|| CapabilityError::InvalidParams("topic is required".to_string()))
    };
    match frame.action {
        FrameAction::Subscribe => sockd.subscribe(room_key, conn_id, &topic()?).await,
        FrameAction::Unsubscribe => sockd.unsubscribe(room_key, conn_id, &topic()?).await,
        FrameAction::Publish => sockd.publish(room_key, &topic()?, message_bytes(&frame.message)).await,
        FrameAction::Broadcast => sockd.broadcast(room_key, message_bytes(&frame.message)).await,
        FrameAction::DirectMessage => {
            let target = frame
                .target
                .as_deref()
                .ok_or_else(|| CapabilityError::InvalidParams("target is required".to_string()))?;
            sockd.direct_message(room_key, target, message_bytes(&frame.message)).await
        }
    }
}

fn message_bytes(message: &Value) -> Bytes {
    match message {
        Value::String(s) => Bytes::from(s.clone()),
        other => Bytes::from(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use spacegrid_core::config::SockdConfig;
    use tokio::sync::mpsc;

    struct ChannelConn(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl SocketConn for ChannelConn {
        async fn send(&mut self, msg: Bytes) -> anyhow::Result<()> {
            self.0.send(msg)?;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn frame(json: &str) -> ClientFrame {
        serde_json::from_str(json).unwrap()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn frames_drive_the_room() {
        let sockd = HigherSockd::new(SockdConfig::default());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        sockd.add_conn("cap-1", 1, Box::new(ChannelConn(a_tx)), "a").await.unwrap();
        sockd.add_conn("cap-1", 2, Box::new(ChannelConn(b_tx)), "b").await.unwrap();

        apply_frame(&sockd, "cap-1", "b", frame(r#"{"action":"subscribe","topic":"lobby"}"#))
            .await
            .unwrap();
        apply_frame(&sockd, "cap-1", "a", frame(r#"{"action":"publish","topic":"lobby","message":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(&recv(&mut b_rx).await[..], b"hi");

        apply_frame(&sockd, "cap-1", "b", frame(r#"{"action":"direct_message","target":"a","message":{"n":1}}"#))
            .await
            .unwrap();
        assert_eq!(&recv(&mut a_rx).await[..], br#"{"n":1}"#);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let sockd = HigherSockd::new(SockdConfig::default());
        assert!(matches!(
            apply_frame(&sockd, "cap-1", "a", frame(r#"{"action":"subscribe"}"#)).await,
            Err(CapabilityError::InvalidParams(_))
        ));
        assert!(matches!(
            apply_frame(&sockd, "cap-1", "a", frame(r#"{"action":"direct_message","message":"x"}"#)).await,
            Err(CapabilityError::InvalidParams(_))
        ));
        assert!(serde_json::from_str::<ClientFrame>(r#"{"action":"shout"}"#).is_err());
    }
}
