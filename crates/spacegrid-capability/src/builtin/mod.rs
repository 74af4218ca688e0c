//! Capabilities and add-ons shipped with the engine.

pub mod kv;
pub mod sockd;

use std::sync::Arc;

use crate::addon::{AddOn, AddOnRegistry};
use crate::hub::{Capability, CapabilityRegistry};

pub use kv::{KvAddOn, KvCapability};
pub use sockd::{SockdCapability, room_key};

/// Register `sockd` and `kv` on a capability registry.
pub fn register_capabilities(registry: &mut CapabilityRegistry) {
    registry
        .register("sockd", |ctx| {
            Ok(Arc::new(SockdCapability::new(ctx.capability.id, ctx.sockd)) as Arc<dyn Capability>)
        })
        .register("kv", |ctx| {
            Ok(Arc::new(KvCapability::new(
                ctx.store,
                ctx.capability.install_id,
                ctx.capability.space_id,
            )) as Arc<dyn Capability>)
        });
}

/// Register the install-wide `kv` add-on.
pub fn register_addons(registry: &mut AddOnRegistry) {
    registry.register("kv", |ctx| {
        Ok(Arc::new(KvAddOn::new(ctx.store, ctx.install_id)) as Arc<dyn AddOn>)
    });
}
