//! CapabilityHub — per-space capability instances.
//!
//! Builders are registered explicitly on a [`CapabilityRegistry`] at
//! bootstrap. The hub resolves a space's enabled capability from the store
//! and memoizes one instance per `(name, capability id)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use spacegrid_core::{CapabilityId, LazyData, SpaceId};
use spacegrid_state::{SpaceCapability, StateStore};

use crate::error::{CapabilityError, CapabilityResult};
use crate::registry::LazyRegistry;
use crate::sockd::HigherSockd;

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, method: &str, params: LazyData) -> CapabilityResult<Value>;
}

/// What a builder gets to construct one capability instance.
#[derive(Clone)]
pub struct CapabilityContext {
    pub capability: SpaceCapability,
    pub store: StateStore,
    pub sockd: Arc<HigherSockd>,
}

pub type CapabilityBuilder =
    Arc<dyn Fn(CapabilityContext) -> CapabilityResult<Arc<dyn Capability>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    builders: HashMap<String, CapabilityBuilder>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, builder: F) -> &mut Self
    where
        F: Fn(CapabilityContext) -> CapabilityResult<Arc<dyn Capability>> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Arc::new(builder));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityBuilder> {
        self.builders.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct CapabilityHub {
    registry: CapabilityRegistry,
    instances: LazyRegistry<(String, CapabilityId), dyn Capability>,
    store: StateStore,
    sockd: Arc<HigherSockd>,
}

impl CapabilityHub {
    pub fn new(registry: CapabilityRegistry, store: StateStore, sockd: Arc<HigherSockd>) -> Self {
        Self {
            registry,
            instances: LazyRegistry::new(),
            store,
            sockd,
        }
    }

    pub fn sockd(&self) -> &Arc<HigherSockd> {
        &self.sockd
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// The memoized instance for an enabled capability record.
    pub async fn get(&self, capability: &SpaceCapability) -> CapabilityResult<Arc<dyn Capability>> {
        let key = (capability.name.clone(), capability.id);
        self.instances
            .get_or_try_init(key, || async {
                let builder = self
                    .registry
                    .get(&capability.name)
                    .ok_or_else(|| CapabilityError::UnknownCapability(capability.name.clone()))?;
                debug!(
                    capability = %capability.name,
                    capability_id = capability.id,
                    space_id = capability.space_id,
                    "building capability instance"
                );
                builder(CapabilityContext {
                    capability: capability.clone(),
                    store: self.store.clone(),
                    sockd: self.sockd.clone(),
                })
            })
            .await
    }

    /// Find the space's capability by name.
    pub fn find(&self, space_id: SpaceId, name: &str) -> CapabilityResult<SpaceCapability> {
        self.store
            .find_capability(space_id, name)?
            .ok_or_else(|| CapabilityError::NotFound(format!("{name} on space {space_id}")))
    }

    pub async fn execute(
        &self,
        space_id: SpaceId,
        name: &str,
        method: &str,
        params: LazyData,
    ) -> CapabilityResult<Value> {
        let capability = self.find(space_id, name)?;
        let instance = self.get(&capability).await?;
        instance.execute(method, params).await
    }

    /// Forget a capability instance, e.g. after it was disabled.
    pub async fn drop_instance(&self, capability: &SpaceCapability) {
        self.instances
            .remove(&(capability.name.clone(), capability.id))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use spacegrid_core::config::SockdConfig;
    use spacegrid_state::RouteConfig;

    struct Echo {
        id: CapabilityId,
    }

    #[async_trait]
    impl Capability for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, method: &str, params: LazyData) -> CapabilityResult<Value> {
            Ok(serde_json::json!({
                "id": self.id,
                "method": method,
                "params": Value::Object(params.as_map()?),
            }))
        }
    }

    fn setup(built: Arc<AtomicUsize>) -> (CapabilityHub, SpaceId) {
        let store = StateStore::open_in_memory().unwrap();
        let (_, version) = store
            .create_package_version("blog", "1.0.0", RouteConfig::default(), "x", &[])
            .unwrap();
        let install = store.create_install(version.id, 1).unwrap();
        let space = store.create_space(&install, "alice", true, 0).unwrap();
        store
            .create_capability(&space, "echo", Value::Null)
            .unwrap();
        store
            .create_capability(&space, "mystery", Value::Null)
            .unwrap();

        let mut registry = CapabilityRegistry::new();
        registry.register("echo", move |ctx| {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo {
                id: ctx.capability.id,
            }) as Arc<dyn Capability>)
        });
        let sockd = Arc::new(HigherSockd::new(SockdConfig::default()));
        (CapabilityHub::new(registry, store, sockd), space.id)
    }

    #[tokio::test]
    async fn executes_enabled_capability() {
        let (hub, space_id) = setup(Arc::new(AtomicUsize::new(0)));
        let out = hub
            .execute(space_id, "echo", "ping", LazyData::from_bytes(r#"{"a":1}"#))
            .await
            .unwrap();
        assert_eq!(out["method"], "ping");
        assert_eq!(out["params"]["a"], 1);
    }

    #[tokio::test]
    async fn missing_capability_is_not_found() {
        let (hub, space_id) = setup(Arc::new(AtomicUsize::new(0)));
        let err = hub
            .execute(space_id, "kv", "get", LazyData::from_bytes(""))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::NotFound(_)));

        let err = hub
            .execute(space_id, "mystery", "x", LazyData::from_bytes(""))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::UnknownCapability(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_build_one_instance() {
        let built = Arc::new(AtomicUsize::new(0));
        let (hub, space_id) = setup(built.clone());
        let hub = Arc::new(hub);
        let capability = hub.find(space_id, "echo").unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let hub = hub.clone();
            let capability = capability.clone();
            handles.push(tokio::spawn(async move { hub.get(&capability).await.unwrap() }));
        }
        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap());
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));

        hub.drop_instance(&capability).await;
        hub.get(&capability).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}
