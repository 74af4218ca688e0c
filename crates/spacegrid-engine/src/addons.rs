//! Add-ons that need the engine's event hub.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use spacegrid_capability::{AddOn, AddOnRegistry, CapabilityError, CapabilityResult};
use spacegrid_core::{InstallId, LazyData};
use spacegrid_eventhub::{EventHub, EventHubError, EventOptions};

/// Lets package scripts publish events for their own install.
pub struct EventsAddOn {
    hub: Arc<EventHub>,
    install_id: InstallId,
}

#[derive(Deserialize)]
struct PublishParams {
    name: String,
    #[serde(default)]
    payload: Value,
}

impl EventsAddOn {
    pub fn new(hub: Arc<EventHub>, install_id: InstallId) -> Self {
        Self { hub, install_id }
    }
}

#[async_trait]
impl AddOn for EventsAddOn {
    fn name(&self) -> &str {
        "events"
    }

    async fn handle(&self, method: &str, params: LazyData) -> CapabilityResult<Value> {
        match method {
            "publish" => {
                let p: PublishParams = params.as_json()?;
                if p.name.is_empty() {
                    return Err(CapabilityError::InvalidParams("event name is empty".to_string()));
                }
                let payload = match p.payload {
                    Value::Null => Bytes::new(),
                    Value::String(s) => Bytes::from(s),
                    other => Bytes::from(serde_json::to_vec(&other)?),
                };
                let event_id = self
                    .hub
                    .publish(EventOptions {
                        install_id: self.install_id,
                        name: p.name,
                        payload,
                    })
                    .await
                    .map_err(|e| match e {
                        EventHubError::State(e) => CapabilityError::State(e),
                        other => CapabilityError::InvalidParams(other.to_string()),
                    })?;
                Ok(serde_json::json!({ "event_id": event_id }))
            }
            other => Err(CapabilityError::UnknownMethod {
                capability: "events".to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Register the hub-backed add-ons.
pub fn register_addons(registry: &mut AddOnRegistry, hub: Arc<EventHub>) {
    registry.register("events", move |ctx| {
        Ok(Arc::new(EventsAddOn::new(hub.clone(), ctx.install_id)) as Arc<dyn AddOn>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacegrid_core::UnconfiguredRuntime;
    use spacegrid_core::config::EventsConfig;
    use spacegrid_eventhub::TargetExecutors;
    use spacegrid_state::{EventSubscription, StateStore};

    fn hub(store: &StateStore) -> Arc<EventHub> {
        Arc::new(EventHub::new(
            store.clone(),
            EventsConfig::default(),
            TargetExecutors::with_defaults(store.clone(), Arc::new(UnconfiguredRuntime)),
        ))
    }

    #[tokio::test]
    async fn publish_is_gated_by_subscriptions() {
        let store = StateStore::open_in_memory().unwrap();
        let hub = hub(&store);
        let addon = EventsAddOn::new(hub.clone(), 3);

        let params = LazyData::from_bytes(r#"{"name":"post.created","payload":{"id":1}}"#);
        let out = addon.handle("publish", params.clone()).await.unwrap();
        assert!(out["event_id"].is_null());

        store
            .create_event_subscription(&EventSubscription {
                id: 0,
                install_id: 3,
                space_id: 0,
                event_key: "post.created".to_string(),
                target_type: "log".to_string(),
                target_endpoint: String::new(),
                target_options: Value::Null,
                rules: String::new(),
                transform: String::new(),
                delay_start: 0,
                retry_delay: 0,
                max_retries: 0,
                disabled: false,
                created_by: 1,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        hub.build_active_events_index().unwrap();

        let out = addon.handle("publish", params).await.unwrap();
        let event_id = out["event_id"].as_i64().unwrap();
        let event = store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.payload, br#"{"id":1}"#.to_vec());
    }

    #[tokio::test]
    async fn rejects_unknown_method_and_empty_name() {
        let store = StateStore::open_in_memory().unwrap();
        let addon = EventsAddOn::new(hub(&store), 1);
        assert!(matches!(
            addon.handle("drain", LazyData::from_bytes("{}")).await,
            Err(CapabilityError::UnknownMethod { .. })
        ));
        assert!(matches!(
            addon.handle("publish", LazyData::from_bytes(r#"{"name":""}"#)).await,
            Err(CapabilityError::InvalidParams(_))
        ));
    }
}
