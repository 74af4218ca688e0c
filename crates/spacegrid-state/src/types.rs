//! Domain types for the SpaceGrid state store.
//!
//! These types represent the persisted state of packages, installs, spaces,
//! tenant records, and the event queue. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

pub use spacegrid_core::types::{
    CapabilityId, EventId, InstallId, PackageId, SpaceId, SubscriptionId, TargetId, UserId,
    VersionId,
};

// ── Packages ───────────────────────────────────────────────────────

/// A named package. Versions hang off it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub latest_version_id: VersionId,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One uploaded version of a package: its manifest plus its files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageVersion {
    pub id: VersionId,
    pub package_id: PackageId,
    pub name: String,
    /// Semver string from the manifest.
    pub version: String,
    pub route_option: RouteConfig,
    /// Hex SHA-256 of the uploaded archive.
    pub checksum: String,
    pub created_at: u64,
}

/// How a space's HTTP traffic is routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RouteConfig {
    pub router_type: RouterType,
    /// Folder under the package root that static files are served from.
    pub serve_folder: String,
    /// Folder under the package root that templates are loaded from.
    pub template_folder: String,
    /// Fallback file for simple routers when the requested file is missing.
    pub on_not_found_file: Option<String>,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouterType {
    #[default]
    Simple,
    Dynamic,
}

/// One entry of a dynamic router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    /// Path pattern; `:name` segments bind parameters.
    pub path: String,
    /// HTTP method. Empty matches every method.
    #[serde(default)]
    pub method: String,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    /// Script handler for `template` and `api` routes.
    #[serde(default)]
    pub handler: String,
    /// Static file or template file, depending on `route_type`.
    #[serde(default)]
    pub file: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Static,
    Template,
    Api,
}

// ── Installs & spaces ──────────────────────────────────────────────

/// A package version bound to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstalledPackage {
    pub id: InstallId,
    pub package_id: PackageId,
    pub package_version_id: VersionId,
    pub owner_id: UserId,
    pub created_at: u64,
}

/// A tenant-owned, routable instance of an installed package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Space {
    pub id: SpaceId,
    pub install_id: InstallId,
    pub package_id: PackageId,
    pub package_version_id: VersionId,
    pub namespace_key: String,
    /// Only spaces that own their namespace are routable.
    pub owns_namespace: bool,
    /// Non-zero when this space overlays another space's files.
    pub overlay_for_space_id: SpaceId,
    pub owner_id: UserId,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Tenant-scoped records ──────────────────────────────────────────

/// A capability enabled for a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceCapability {
    pub id: CapabilityId,
    pub install_id: InstallId,
    pub space_id: SpaceId,
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
    pub created_at: u64,
}

/// Tenant key-value record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceKv {
    pub install_id: InstallId,
    pub space_id: SpaceId,
    pub group: String,
    pub key: String,
    pub value: String,
    pub updated_at: u64,
}

/// Per-space user grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceUser {
    pub install_id: InstallId,
    pub space_id: SpaceId,
    pub user_id: UserId,
    pub scope: String,
    pub created_at: u64,
}

// ── Events ─────────────────────────────────────────────────────────

/// A subscription fanning an install's events out to a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub install_id: InstallId,
    pub space_id: SpaceId,
    pub event_key: String,
    /// `log`, `script`, `webhook`, ...
    pub target_type: String,
    pub target_endpoint: String,
    #[serde(default)]
    pub target_options: serde_json::Value,
    /// JSON rule tree; empty matches everything.
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub transform: String,
    /// Seconds to hold a new target before delivery.
    #[serde(default)]
    pub delay_start: u64,
    /// Seconds between delivery attempts.
    #[serde(default)]
    pub retry_delay: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub disabled: bool,
    pub created_by: UserId,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    New,
    Scheduled,
    Processed,
}

/// A published occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqEvent {
    pub id: EventId,
    pub install_id: InstallId,
    pub name: String,
    pub payload: Vec<u8>,
    pub status: EventStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    New,
    Processing,
    Processed,
    Failed,
    Delayed,
}

/// One per-subscription delivery attempt derived from an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqEventTarget {
    pub id: TargetId,
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub status: TargetStatus,
    /// Unix millis; meaningful only while `Delayed`.
    pub delayed_until_ms: u64,
    pub attempts: u32,
    pub error: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Input for [`crate::StateStore::create_event_targets`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEventTarget {
    pub subscription_id: SubscriptionId,
    /// Zero for immediate delivery.
    pub delayed_until_ms: u64,
}

impl SpaceKv {
    /// Build the composite key for the space_kv table.
    pub fn table_key(&self) -> String {
        kv_key(self.install_id, self.space_id, &self.group, &self.key)
    }
}

impl SpaceUser {
    /// Build the composite key for the space_users table.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.install_id, self.space_id, self.user_id)
    }
}

impl EventSubscription {
    /// Build the composite key for the subscriptions table.
    pub fn table_key(&self) -> String {
        subscription_key(self.install_id, self.id)
    }
}

impl MqEventTarget {
    /// Build the composite key for the event_targets table.
    pub fn table_key(&self) -> String {
        target_key(self.event_id, self.id)
    }
}

pub(crate) fn kv_key(install_id: InstallId, space_id: SpaceId, group: &str, key: &str) -> String {
    format!("{install_id}/{space_id}/{group}/{key}")
}

pub(crate) fn subscription_key(install_id: InstallId, id: SubscriptionId) -> String {
    format!("{install_id}/{id}")
}

pub(crate) fn target_key(event_id: EventId, target_id: TargetId) -> String {
    format!("{event_id:019}/{target_id:019}")
}

pub(crate) fn package_file_key(version_id: VersionId, path: &str) -> String {
    format!("{version_id}:{}", path.trim_start_matches('/'))
}
