//! redb table definitions for the SpaceGrid state store.
//!
//! Values are JSON-serialized domain types. Records addressed only by their
//! own id use `i64` keys; records that are always scanned by owner use
//! composite `&str` keys.

use redb::TableDefinition;

/// Table keyed by a record's own numeric id.
pub type IdTable = TableDefinition<'static, i64, &'static [u8]>;

/// Table keyed by a composite string.
pub type KeyTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Packages keyed by id.
pub const PACKAGES: IdTable = TableDefinition::new("packages");

/// Package versions keyed by id.
pub const PACKAGE_VERSIONS: IdTable = TableDefinition::new("package_versions");

/// Package file blobs keyed by `{version_id}:{path}`.
pub const PACKAGE_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("package_files");

/// Installed packages keyed by id.
pub const INSTALLS: IdTable = TableDefinition::new("installs");

/// Spaces keyed by id.
pub const SPACES: IdTable = TableDefinition::new("spaces");

/// Space capabilities keyed by id.
pub const CAPABILITIES: IdTable = TableDefinition::new("capabilities");

/// Tenant KV keyed by `{install_id}/{space_id}/{group}/{key}`.
pub const SPACE_KV: KeyTable = TableDefinition::new("space_kv");

/// Space users keyed by `{install_id}/{space_id}/{user_id}`.
pub const SPACE_USERS: KeyTable = TableDefinition::new("space_users");

/// Event subscriptions keyed by `{install_id}/{subscription_id}`.
pub const SUBSCRIPTIONS: KeyTable = TableDefinition::new("subscriptions");

/// Published events keyed by id.
pub const EVENTS: IdTable = TableDefinition::new("events");

/// Event targets keyed by `{event_id:019}/{target_id:019}`.
pub const EVENT_TARGETS: KeyTable = TableDefinition::new("event_targets");

/// Last allocated id per record kind.
pub const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");
