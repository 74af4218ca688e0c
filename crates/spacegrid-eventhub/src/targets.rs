//! Delivery executors by subscription `target_type`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use spacegrid_core::{EventInvocation, ExecuteOptions, Runtime, net};
use spacegrid_state::{EventSubscription, MqEvent, MqEventTarget, StateStore};

const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;

/// Everything an executor needs for one delivery attempt.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: MqEvent,
    pub target: MqEventTarget,
    pub subscription: EventSubscription,
}

#[async_trait]
pub trait TargetExecutor: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

#[derive(Default, Clone)]
pub struct TargetExecutors {
    executors: HashMap<String, Arc<dyn TargetExecutor>>,
}

impl TargetExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    /// `log`, `script`, and `webhook`.
    pub fn with_defaults(store: StateStore, runtime: Arc<dyn Runtime>) -> Self {
        let mut executors = Self::new();
        executors
            .register("log", Arc::new(LogTarget))
            .register("script", Arc::new(ScriptTarget { store, runtime }))
            .register("webhook", Arc::new(WebhookTarget));
        executors
    }

    pub fn register(&mut self, target_type: &str, executor: Arc<dyn TargetExecutor>) -> &mut Self {
        self.executors.insert(target_type.to_string(), executor);
        self
    }

    pub fn get(&self, target_type: &str) -> Option<&Arc<dyn TargetExecutor>> {
        self.executors.get(target_type)
    }
}

/// Records the delivery in the log and nothing else.
pub struct LogTarget;

#[async_trait]
impl TargetExecutor for LogTarget {
    async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()> {
        info!(
            event_id = delivery.event.id,
            target_id = delivery.target.id,
            subscription_id = delivery.subscription.id,
            event = %delivery.event.name,
            bytes = delivery.event.payload.len(),
            "event delivered to log target"
        );
        Ok(())
    }
}

/// Runs the package script named by the subscription's endpoint.
pub struct ScriptTarget {
    store: StateStore,
    runtime: Arc<dyn Runtime>,
}

#[async_trait]
impl TargetExecutor for ScriptTarget {
    async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let sub = &delivery.subscription;
        let install = self
            .store
            .get_install(sub.install_id)?
            .with_context(|| format!("install {} not found", sub.install_id))?;
        let version = self
            .store
            .get_package_version(install.package_version_id)?
            .with_context(|| format!("package version {} not found", install.package_version_id))?;

        let opts = ExecuteOptions {
            package_name: version.name,
            package_version_id: version.id,
            installed_id: install.id,
            space_id: sub.space_id,
            handler_name: sub.target_endpoint.clone(),
            params: HashMap::new(),
        };
        let event = EventInvocation {
            event_id: delivery.event.id,
            subscription_id: sub.id,
            name: delivery.event.name.clone(),
            payload: Bytes::from(delivery.event.payload.clone()),
            transform: sub.transform.clone(),
        };
        self.runtime.execute_event(opts, event).await
    }
}

/// POSTs the payload to the subscription's endpoint.
///
/// Options: `timeout_ms` (default 10 s) and `headers` (string map).
pub struct WebhookTarget;

#[async_trait]
impl TargetExecutor for WebhookTarget {
    async fn deliver(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let sub = &delivery.subscription;
        let options = &sub.target_options;
        let timeout = Duration::from_millis(
            options
                .get("timeout_ms")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS),
        );

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("x-spacegrid-event".to_string(), delivery.event.name.clone()),
            ("x-spacegrid-event-id".to_string(), delivery.event.id.to_string()),
        ];
        if let Some(extra) = options.get("headers").and_then(serde_json::Value::as_object) {
            for (name, value) in extra {
                if let Some(value) = value.as_str() {
                    headers.push((name.clone(), value.to_string()));
                }
            }
        }

        let reply = net::send(
            "POST",
            &sub.target_endpoint,
            &headers,
            Bytes::from(delivery.event.payload.clone()),
            timeout,
        )
        .await?;
        if !reply.is_success() {
            bail!("webhook {} answered {}", sub.target_endpoint, reply.status);
        }
        Ok(())
    }
}
