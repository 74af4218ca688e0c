//! The `sockd` capability: HTTP-side access to a capability room.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use spacegrid_core::{CapabilityId, LazyData};

use crate::error::{CapabilityError, CapabilityResult};
use crate::hub::Capability;
use crate::sockd::HigherSockd;

/// Room key for a capability instance.
pub fn room_key(capability_id: CapabilityId) -> String {
    format!("cap-{capability_id}")
}

pub struct SockdCapability {
    room_key: String,
    sockd: Arc<HigherSockd>,
}

#[derive(Deserialize)]
struct BroadcastParams {
    message: Value,
}

#[derive(Deserialize)]
struct PublishParams {
    topic: String,
    message: Value,
}

#[derive(Deserialize)]
struct DirectParams {
    conn_id: String,
    message: Value,
}

#[derive(Deserialize)]
struct TopicParams {
    conn_id: String,
    topic: String,
}

impl SockdCapability {
    pub fn new(capability_id: CapabilityId, sockd: Arc<HigherSockd>) -> Self {
        Self {
            room_key: room_key(capability_id),
            sockd,
        }
    }
}

#[async_trait]
impl Capability for SockdCapability {
    fn name(&self) -> &str {
        "sockd"
    }

    async fn execute(&self, method: &str, params: LazyData) -> CapabilityResult<Value> {
        let key = self.room_key.as_str();
        match method {
            "broadcast" => {
                let p: BroadcastParams = params.as_json()?;
                self.sockd.broadcast(key, message_bytes(p.message)).await?;
            }
            "publish" => {
                let p: PublishParams = params.as_json()?;
                self.sockd.publish(key, &p.topic, message_bytes(p.message)).await?;
            }
            "direct_message" => {
                let p: DirectParams = params.as_json()?;
                self.sockd
                    .direct_message(key, &p.conn_id, message_bytes(p.message))
                    .await?;
            }
            "subscribe" => {
                let p: TopicParams = params.as_json()?;
                self.sockd.subscribe(key, &p.conn_id, &p.topic).await?;
            }
            "unsubscribe" => {
                let p: TopicParams = params.as_json()?;
                self.sockd.unsubscribe(key, &p.conn_id, &p.topic).await?;
            }
            other => {
                return Err(CapabilityError::UnknownMethod {
                    capability: "sockd".to_string(),
                    method: other.to_string(),
                });
            }
        }
        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Strings go out verbatim, anything else as JSON text.
pub(crate) fn message_bytes(message: Value) -> Bytes {
    match message {
        Value::String(s) => Bytes::from(s),
        other => Bytes::from(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use spacegrid_core::config::SockdConfig;

    use crate::room::tests::channel_conn;

    #[tokio::test]
    async fn methods_map_onto_the_room() {
        let sockd = Arc::new(HigherSockd::new(SockdConfig::default()));
        let cap = SockdCapability::new(5, sockd.clone());
        let (conn, mut rx, _) = channel_conn();
        sockd.add_conn("cap-5", 1, conn, "c1").await.unwrap();

        cap.execute(
            "subscribe",
            LazyData::from_value(serde_json::json!({"conn_id": "c1", "topic": "t"})),
        )
        .await
        .unwrap();
        cap.execute(
            "publish",
            LazyData::from_bytes(r#"{"topic":"t","message":{"n":1}}"#),
        )
        .await
        .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, r#"{"n":1}"#);

        cap.execute(
            "direct_message",
            LazyData::from_bytes(r#"{"conn_id":"c1","message":"hey"}"#),
        )
        .await
        .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "hey");
    }

    #[tokio::test]
    async fn bad_params_and_methods() {
        let sockd = Arc::new(HigherSockd::new(SockdConfig::default()));
        let cap = SockdCapability::new(1, sockd);
        assert!(matches!(
            cap.execute("publish", LazyData::from_bytes("{}")).await,
            Err(CapabilityError::InvalidParams(_))
        ));
        assert!(matches!(
            cap.execute("explode", LazyData::from_bytes("{}")).await,
            Err(CapabilityError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn room_key_format() {
        assert_eq!(room_key(42), "cap-42");
    }
}
