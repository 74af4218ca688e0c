//! Engine — the composition root.
//!
//! Owns the routing index and its reconciler, the capability and add-on
//! hubs, the room multiplexer, and the event hub, and exposes the
//! tenant-facing operations the HTTP layer calls. Every tenant-scoped
//! mutation re-derives ownership from the store before acting.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use spacegrid_capability::builtin;
use spacegrid_capability::{AddOnHub, AddOnRegistry, CapabilityHub, CapabilityRegistry, HigherSockd, Session, SocketConn};
use spacegrid_core::{
    EventId, HttpContext, InstallId, LazyData, PackageSource, Runtime, SpaceGridConfig, SpaceId, SpaceResponse,
    SubscriptionId, UserId, net,
};
use spacegrid_eventhub::{EventHub, EventOptions, MAX_HOLD_SECS, MAX_RETRIES, RuleSet, TargetExecutors};
use spacegrid_router::{IndexSync, RoutingIndex};
use spacegrid_state::{EventSubscription, InstalledPackage, Space, SpaceCapability, StateStore};

use crate::addons;
use crate::error::{EngineError, EngineResult};
use crate::installer;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

static NAMESPACE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("namespace key regex"));

/// Space creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpaceSpec {
    pub install_id: InstallId,
    pub namespace_key: String,
    /// Space whose files back this one when a path is missing here.
    #[serde(default)]
    pub overlay_for_space_id: SpaceId,
}

/// Subscription create request.
///
/// `rules` may be the rule JSON itself or a string holding it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSpec {
    pub event_key: String,
    pub space_id: SpaceId,
    pub target_type: String,
    pub target_endpoint: String,
    pub target_options: Value,
    pub rules: Value,
    pub transform: String,
    pub delay_start: u64,
    pub retry_delay: u64,
    pub max_retries: u32,
    pub disabled: bool,
}

pub struct Engine {
    config: SpaceGridConfig,
    store: StateStore,
    runtime: Arc<dyn Runtime>,
    sync: Arc<IndexSync>,
    sockd: Arc<HigherSockd>,
    capabilities: Arc<CapabilityHub>,
    addons: AddOnHub,
    events: Arc<EventHub>,
}

impl Engine {
    pub fn new(config: SpaceGridConfig, store: StateStore, runtime: Arc<dyn Runtime>) -> Self {
        let index = Arc::new(RoutingIndex::new());
        let sync = Arc::new(IndexSync::new(store.clone(), index, config.routing.package_queue));

        let sockd = Arc::new(HigherSockd::new(config.sockd.clone()));
        let mut capability_registry = CapabilityRegistry::new();
        builtin::register_capabilities(&mut capability_registry);
        let capabilities = Arc::new(CapabilityHub::new(capability_registry, store.clone(), sockd.clone()));

        let executors = TargetExecutors::with_defaults(store.clone(), runtime.clone());
        let events = Arc::new(EventHub::new(store.clone(), config.events.clone(), executors));

        let mut addon_registry = AddOnRegistry::new();
        builtin::register_addons(&mut addon_registry);
        addons::register_addons(&mut addon_registry, events.clone());
        let addons = AddOnHub::new(addon_registry, store.clone());

        Self {
            config,
            store,
            runtime,
            sync,
            sockd,
            capabilities,
            addons,
            events,
        }
    }

    /// Load the routing index and spawn every background loop.
    ///
    /// The loops stop when `shutdown` flips to true.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> EngineResult<Vec<JoinHandle<()>>> {
        let stats = self.sync.load_routing_index()?;
        info!(entries = stats.entries, skipped = stats.skipped, "routing index loaded");

        let mut handles = Vec::new();

        let sync = self.sync.clone();
        let tick = self.config.routing.reload_interval();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { sync.run(tick, rx).await }));

        let sockd = self.sockd.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { sockd.run_evictor(rx).await }));

        handles.extend(self.events.start(shutdown)?);
        info!(tasks = handles.len(), "engine started");
        Ok(handles)
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn config(&self) -> &SpaceGridConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn index(&self) -> &Arc<RoutingIndex> {
        self.sync.index()
    }

    pub fn sockd(&self) -> &Arc<HigherSockd> {
        &self.sockd
    }

    pub fn capabilities(&self) -> &Arc<CapabilityHub> {
        &self.capabilities
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    // ── Signals ────────────────────────────────────────────────────

    pub fn refresh_event_index(&self) {
        self.events.refresh_full_index();
    }

    pub fn request_package_reload(&self, package_id: i64) {
        self.sync.request_package_reload(package_id);
    }

    /// Rebuild the routing index now instead of waiting for the next tick.
    pub fn reload_routing_index(&self) -> EngineResult<usize> {
        Ok(self.sync.load_routing_index()?.entries)
    }

    // ── Authorization ──────────────────────────────────────────────

    /// The install, if `user_id` owns it.
    pub fn authorize_install(&self, user_id: UserId, install_id: InstallId) -> EngineResult<InstalledPackage> {
        let install = self
            .store
            .get_install(install_id)?
            .ok_or_else(|| EngineError::NotFound(format!("install {install_id}")))?;
        if install.owner_id != user_id {
            return Err(EngineError::Forbidden(format!("install {install_id}")));
        }
        Ok(install)
    }

    /// The space, if `user_id` owns it or is one of its users.
    pub fn authorize_space(&self, user_id: UserId, space_id: SpaceId) -> EngineResult<Space> {
        let space = self
            .store
            .get_space(space_id)?
            .ok_or_else(|| EngineError::NotFound(format!("space {space_id}")))?;
        if space.owner_id == user_id
            || self
                .store
                .get_space_user(space.install_id, space.id, user_id)?
                .is_some()
        {
            return Ok(space);
        }
        Err(EngineError::Forbidden(format!("space {space_id}")))
    }

    /// The space, if `user_id` owns it. Space users may use a space but
    /// not reconfigure it.
    pub fn authorize_space_owner(&self, user_id: UserId, space_id: SpaceId) -> EngineResult<Space> {
        let space = self.authorize_space(user_id, space_id)?;
        if space.owner_id != user_id {
            return Err(EngineError::Forbidden(format!("space {space_id}")));
        }
        Ok(space)
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Store a zip package and install it for `owner_id`.
    pub fn install_package_by_file(&self, owner_id: UserId, bytes: &[u8]) -> EngineResult<InstalledPackage> {
        let bundle = installer::read_package(bytes)?;
        let (package, version) = self.store.create_package_version(
            &bundle.name,
            &bundle.version.to_string(),
            bundle.route_option,
            &bundle.checksum,
            &bundle.files,
        )?;
        let install = self.store.create_install(version.id, owner_id)?;
        self.sync.request_package_reload(package.id);

        info!(
            package = %package.name,
            version = %version.version,
            install_id = install.id,
            owner_id,
            "package installed"
        );
        Ok(install)
    }

    /// Fetch a zip package from an `http://` or local source and install it.
    pub async fn install_package_by_url(&self, owner_id: UserId, url: &str) -> EngineResult<InstalledPackage> {
        let source = PackageSource::parse(url).map_err(|e| EngineError::Validation(e.to_string()))?;
        let bytes = match source {
            PackageSource::Http { url } => {
                let reply = net::send("GET", &url, &[], Bytes::new(), DOWNLOAD_TIMEOUT)
                    .await
                    .map_err(|e| EngineError::Install(format!("{e:#}")))?;
                if !reply.is_success() {
                    return Err(EngineError::Install(format!("{url} answered {}", reply.status)));
                }
                reply.body.to_vec()
            }
            PackageSource::File { path } => tokio::fs::read(&path)
                .await
                .map_err(|e| EngineError::Install(format!("read {}: {e}", path.display())))?,
        };
        debug!(%url, bytes = bytes.len(), "package fetched");
        self.install_package_by_file(owner_id, &bytes)
    }

    // ── Spaces ─────────────────────────────────────────────────────

    pub fn create_space(&self, user_id: UserId, spec: &SpaceSpec) -> EngineResult<Space> {
        let install = self.authorize_install(user_id, spec.install_id)?;
        if !NAMESPACE_KEY.is_match(&spec.namespace_key) {
            return Err(EngineError::Validation(format!(
                "invalid namespace key {:?}",
                spec.namespace_key
            )));
        }
        if spec.overlay_for_space_id != 0 {
            self.authorize_space(user_id, spec.overlay_for_space_id)?;
        }

        let space = self
            .store
            .create_space(&install, &spec.namespace_key, true, spec.overlay_for_space_id)?;
        self.sync.request_package_reload(space.package_id);
        info!(space_id = space.id, namespace = %space.namespace_key, install_id = install.id, "space created");
        Ok(space)
    }

    /// Serve a request against the space owning `namespace_key`.
    pub async fn serve_space_file(&self, namespace_key: &str, ctx: &mut HttpContext) -> EngineResult<SpaceResponse> {
        let entry = self
            .index()
            .lookup(namespace_key)
            .ok_or_else(|| EngineError::NotFound(format!("namespace {namespace_key}")))?;
        Ok(spacegrid_router::serve(&entry, &self.store, self.runtime.as_ref(), ctx).await?)
    }

    // ── Capabilities ───────────────────────────────────────────────

    /// Enable a registered capability on a space the caller owns.
    pub fn enable_capability(
        &self,
        user_id: UserId,
        space_id: SpaceId,
        name: &str,
        options: Value,
    ) -> EngineResult<SpaceCapability> {
        let space = self.authorize_space_owner(user_id, space_id)?;
        if self.capabilities.registry().get(name).is_none() {
            return Err(EngineError::Validation(format!("unknown capability {name:?}")));
        }
        let capability = self.store.create_capability(&space, name, options)?;
        info!(capability_id = capability.id, space_id, %name, "capability enabled");
        Ok(capability)
    }

    /// Disable a capability, dropping its live instance and closing any
    /// sockets joined to its room.
    pub async fn disable_capability(&self, user_id: UserId, space_id: SpaceId, name: &str) -> EngineResult<()> {
        self.authorize_space_owner(user_id, space_id)?;
        let record = self.capabilities.find(space_id, name)?;
        self.store.delete_capability(record.id)?;
        self.capabilities.drop_instance(&record).await;
        let closed = self.sockd.close_room(&builtin::room_key(record.id)).await;
        info!(capability_id = record.id, space_id, %name, closed, "capability disabled");
        Ok(())
    }

    pub async fn execute_capability(
        &self,
        user_id: UserId,
        space_id: SpaceId,
        name: &str,
        method: &str,
        params: LazyData,
    ) -> EngineResult<Value> {
        self.authorize_space(user_id, space_id)?;
        Ok(self.capabilities.execute(space_id, name, method, params).await?)
    }

    /// Call an install-wide add-on on behalf of a package script.
    pub async fn addon(&self, name: &str, install_id: InstallId, method: &str, params: LazyData) -> EngineResult<Value> {
        Ok(self.addons.handle(name, install_id, method, params).await?)
    }

    /// Join a socket connection to the room of a space's capability.
    ///
    /// Returns the room key and the new session.
    pub async fn connect_socket(
        &self,
        user_id: UserId,
        space_id: SpaceId,
        capability: &str,
        conn: Box<dyn SocketConn>,
        conn_id: &str,
    ) -> EngineResult<(String, Arc<Session>)> {
        self.authorize_space(user_id, space_id)?;
        let record = self.capabilities.find(space_id, capability)?;
        let room_key = builtin::room_key(record.id);
        let session = self.sockd.add_conn(&room_key, user_id, conn, conn_id).await?;
        Ok((room_key, session))
    }

    // ── Subscriptions & events ─────────────────────────────────────

    pub fn list_subscriptions(&self, user_id: UserId, install_id: InstallId) -> EngineResult<Vec<EventSubscription>> {
        self.authorize_install(user_id, install_id)?;
        Ok(self.store.list_event_subscriptions(install_id)?)
    }

    pub fn create_subscription(
        &self,
        user_id: UserId,
        install_id: InstallId,
        spec: SubscriptionSpec,
    ) -> EngineResult<EventSubscription> {
        self.authorize_install(user_id, install_id)?;
        if spec.event_key.is_empty() {
            return Err(EngineError::Validation("event_key is empty".to_string()));
        }
        if self.events.executors().get(&spec.target_type).is_none() {
            return Err(EngineError::Validation(format!(
                "unknown target type {:?}",
                spec.target_type
            )));
        }
        if spec.space_id != 0 {
            let space = self.authorize_space(user_id, spec.space_id)?;
            if space.install_id != install_id {
                return Err(EngineError::Validation(format!(
                    "space {} belongs to another install",
                    space.id
                )));
            }
        }
        for (field, secs) in [("delay_start", spec.delay_start), ("retry_delay", spec.retry_delay)] {
            if secs > MAX_HOLD_SECS {
                return Err(EngineError::Validation(format!(
                    "{field} of {secs}s exceeds {MAX_HOLD_SECS}s"
                )));
            }
        }
        if spec.max_retries > MAX_RETRIES {
            return Err(EngineError::Validation(format!(
                "max_retries of {} exceeds {MAX_RETRIES}",
                spec.max_retries
            )));
        }
        let rules = match spec.rules {
            Value::Null => String::new(),
            Value::String(s) => s,
            other => other.to_string(),
        };
        RuleSet::parse(&rules)?;

        let sub = self.store.create_event_subscription(&EventSubscription {
            id: 0,
            install_id,
            space_id: spec.space_id,
            event_key: spec.event_key,
            target_type: spec.target_type,
            target_endpoint: spec.target_endpoint,
            target_options: spec.target_options,
            rules,
            transform: spec.transform,
            delay_start: spec.delay_start,
            retry_delay: spec.retry_delay,
            max_retries: spec.max_retries,
            disabled: spec.disabled,
            created_by: user_id,
            created_at: 0,
            updated_at: 0,
        })?;
        self.refresh_event_index();
        info!(subscription_id = sub.id, install_id, event = %sub.event_key, "subscription created");
        Ok(sub)
    }

    pub fn delete_subscription(
        &self,
        user_id: UserId,
        install_id: InstallId,
        subscription_id: SubscriptionId,
    ) -> EngineResult<()> {
        self.authorize_install(user_id, install_id)?;
        if !self.store.delete_event_subscription(install_id, subscription_id)? {
            return Err(EngineError::NotFound(format!("subscription {subscription_id}")));
        }
        self.refresh_event_index();
        info!(subscription_id, install_id, "subscription deleted");
        Ok(())
    }

    pub async fn publish_event(
        &self,
        user_id: UserId,
        install_id: InstallId,
        name: &str,
        payload: Bytes,
    ) -> EngineResult<Option<EventId>> {
        self.authorize_install(user_id, install_id)?;
        if name.is_empty() {
            return Err(EngineError::Validation("event name is empty".to_string()));
        }
        Ok(self
            .events
            .publish(EventOptions {
                install_id,
                name: name.to_string(),
                payload,
            })
            .await?)
    }
}
