//! Script runtime contract.
//!
//! The language binding that actually runs package scripts lives outside
//! this workspace. The router and the event hub only see this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{EventId, HttpContext, InstallId, SpaceId, SubscriptionId, VersionId};

/// Identifies the handler a runtime should invoke.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    pub package_name: String,
    pub package_version_id: VersionId,
    pub installed_id: InstallId,
    pub space_id: SpaceId,
    pub handler_name: String,
    pub params: HashMap<String, String>,
}

/// An event delivered to a `script` subscription target.
#[derive(Debug, Clone)]
pub struct EventInvocation {
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub name: String,
    pub payload: Bytes,
    pub transform: String,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run an HTTP handler. The handler writes its reply into `ctx.response`.
    async fn execute_http(&self, opts: ExecuteOptions, ctx: &mut HttpContext) -> anyhow::Result<()>;

    /// Run an event handler for a `script` subscription target.
    async fn execute_event(&self, opts: ExecuteOptions, event: EventInvocation) -> anyhow::Result<()> {
        anyhow::bail!(
            "runtime cannot run event handler {} for event {}",
            opts.handler_name,
            event.event_id
        )
    }
}

/// Runtime used when no script binding is wired in. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredRuntime;

#[async_trait]
impl Runtime for UnconfiguredRuntime {
    async fn execute_http(&self, opts: ExecuteOptions, _ctx: &mut HttpContext) -> anyhow::Result<()> {
        anyhow::bail!(
            "no script runtime configured (handler {} in {})",
            opts.handler_name,
            opts.package_name
        )
    }
}
