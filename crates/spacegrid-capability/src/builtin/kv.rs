//! Tenant key-value storage, as a per-space capability and as an
//! install-wide add-on (space id 0).

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use spacegrid_core::{InstallId, LazyData, SpaceId};
use spacegrid_state::{SpaceKv, StateStore};

use crate::addon::AddOn;
use crate::error::{CapabilityError, CapabilityResult};
use crate::hub::Capability;

fn default_group() -> String {
    "default".to_string()
}

#[derive(Deserialize)]
struct KeyParams {
    #[serde(default = "default_group")]
    group: String,
    key: String,
}

#[derive(Deserialize)]
struct SetParams {
    #[serde(default = "default_group")]
    group: String,
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct GroupParams {
    #[serde(default = "default_group")]
    group: String,
}

/// KV operations bound to one `(install, space)` scope.
struct KvScope {
    store: StateStore,
    install_id: InstallId,
    space_id: SpaceId,
}

impl KvScope {
    fn run(&self, method: &str, params: &LazyData) -> CapabilityResult<Value> {
        match method {
            "get" => {
                let p: KeyParams = params.as_json()?;
                let record = self.store.get_kv(self.install_id, self.space_id, &p.group, &p.key)?;
                Ok(serde_json::json!({ "value": record.map(|r| r.value) }))
            }
            "set" => {
                let p: SetParams = params.as_json()?;
                self.store.put_kv(&SpaceKv {
                    install_id: self.install_id,
                    space_id: self.space_id,
                    group: p.group,
                    key: p.key,
                    value: p.value,
                    updated_at: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                })?;
                Ok(serde_json::json!({ "ok": true }))
            }
            "delete" => {
                let p: KeyParams = params.as_json()?;
                let existed = self.store.delete_kv(self.install_id, self.space_id, &p.group, &p.key)?;
                Ok(serde_json::json!({ "deleted": existed }))
            }
            "list" => {
                let p: GroupParams = params.as_json()?;
                let items: Vec<Value> = self
                    .store
                    .list_kv(self.install_id, self.space_id, &p.group)?
                    .into_iter()
                    .map(|r| serde_json::json!({ "key": r.key, "value": r.value }))
                    .collect();
                Ok(Value::Array(items))
            }
            other => Err(CapabilityError::UnknownMethod {
                capability: "kv".to_string(),
                method: other.to_string(),
            }),
        }
    }
}

pub struct KvCapability {
    scope: KvScope,
}

impl KvCapability {
    pub fn new(store: StateStore, install_id: InstallId, space_id: SpaceId) -> Self {
        Self {
            scope: KvScope {
                store,
                install_id,
                space_id,
            },
        }
    }
}

#[async_trait]
impl Capability for KvCapability {
    fn name(&self) -> &str {
        "kv"
    }

    async fn execute(&self, method: &str, params: LazyData) -> CapabilityResult<Value> {
        self.scope.run(method, &params)
    }
}

pub struct KvAddOn {
    scope: KvScope,
}

impl KvAddOn {
    pub fn new(store: StateStore, install_id: InstallId) -> Self {
        Self {
            scope: KvScope {
                store,
                install_id,
                space_id: 0,
            },
        }
    }
}

#[async_trait]
impl AddOn for KvAddOn {
    fn name(&self) -> &str {
        "kv"
    }

    async fn handle(&self, method: &str, params: LazyData) -> CapabilityResult<Value> {
        self.scope.run(method, &params)
    }
}
