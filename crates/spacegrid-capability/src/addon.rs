//! Install-scoped add-ons.
//!
//! Unlike capabilities, add-ons are not enabled per space. Every install
//! can reach every registered add-on; instances are memoized per
//! `(add-on name, install id)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use spacegrid_core::{InstallId, LazyData};
use spacegrid_state::StateStore;

use crate::error::{CapabilityError, CapabilityResult};
use crate::registry::LazyRegistry;

#[async_trait]
pub trait AddOn: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, method: &str, params: LazyData) -> CapabilityResult<Value>;
}

#[derive(Clone)]
pub struct AddOnContext {
    pub install_id: InstallId,
    pub store: StateStore,
}

pub type AddOnBuilder = Arc<dyn Fn(AddOnContext) -> CapabilityResult<Arc<dyn AddOn>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct AddOnRegistry {
    builders: HashMap<String, AddOnBuilder>,
}

impl AddOnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, builder: F) -> &mut Self
    where
        F: Fn(AddOnContext) -> CapabilityResult<Arc<dyn AddOn>> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Arc::new(builder));
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct AddOnHub {
    registry: AddOnRegistry,
    instances: LazyRegistry<(String, InstallId), dyn AddOn>,
    store: StateStore,
}

impl AddOnHub {
    pub fn new(registry: AddOnRegistry, store: StateStore) -> Self {
        Self {
            registry,
            instances: LazyRegistry::new(),
            store,
        }
    }

    pub async fn get(&self, name: &str, install_id: InstallId) -> CapabilityResult<Arc<dyn AddOn>> {
        self.instances
            .get_or_try_init((name.to_string(), install_id), || async {
                let builder = self
                    .registry
                    .builders
                    .get(name)
                    .ok_or_else(|| CapabilityError::UnknownCapability(name.to_string()))?;
                debug!(addon = name, install_id, "building add-on instance");
                builder(AddOnContext {
                    install_id,
                    store: self.store.clone(),
                })
            })
            .await
    }

    pub async fn handle(
        &self,
        name: &str,
        install_id: InstallId,
        method: &str,
        params: LazyData,
    ) -> CapabilityResult<Value> {
        self.get(name, install_id).await?.handle(method, params).await
    }
}
