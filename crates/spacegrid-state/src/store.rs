//! StateStore: the redb database behind packages, installs, spaces, tenant
//! records, event subscriptions, and the event/target queue.
//!
//! Records are JSON in `&[u8]` value columns. Id-keyed tables draw ids from
//! a per-kind counter bumped in the inserting transaction; tenant tables
//! are keyed by `install/space/...` strings so scoped listings are prefix
//! scans.
//!
//! Anything that must hold across records runs in one write transaction:
//! namespace ownership and capability-name uniqueness are checked next to
//! the insert, and completing a target re-checks its siblings before the
//! event is marked processed.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// `map_err!(Read)` is `|e| StateError::Read(e.to_string())`.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// A store that lives only as long as the process. Tests use it.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            PACKAGES,
            PACKAGE_VERSIONS,
            INSTALLS,
            SPACES,
            CAPABILITIES,
            EVENTS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        for table in [SPACE_KV, SPACE_USERS, SUBSCRIPTIONS, EVENT_TARGETS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(PACKAGE_FILES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get_by_id<T: DeserializeOwned>(&self, def: IdTable, id: i64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list_by_id<T: DeserializeOwned>(&self, def: IdTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn put_by_id<T: Serialize>(&self, def: IdTable, id: i64, record: &T) -> StateResult<()> {
        let value = encode(record)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_by_id(&self, def: IdTable, id: i64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn get_by_key<T: DeserializeOwned>(&self, def: KeyTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan_prefix<T: DeserializeOwned>(&self, def: KeyTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    fn put_by_key<T: Serialize>(&self, def: KeyTable, key: &str, record: &T) -> StateResult<()> {
        let value = encode(record)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn delete_by_key(&self, def: KeyTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Allocate an id and insert the record built from it, in one transaction.
    fn insert_new<T, F>(&self, def: IdTable, kind: &str, build: F) -> StateResult<T>
    where
        T: Serialize,
        F: FnOnce(i64) -> T,
    {
        self.insert_new_guarded(def, kind, |_| Ok(()), build)
    }

    /// `insert_new`, with `check` run first inside the same write
    /// transaction. redb serializes writers, so a uniqueness check made
    /// here cannot be raced by another insert.
    fn insert_new_guarded<T, C, F>(&self, def: IdTable, kind: &str, check: C, build: F) -> StateResult<T>
    where
        T: Serialize,
        C: FnOnce(&WriteTransaction) -> StateResult<()>,
        F: FnOnce(i64) -> T,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        check(&txn)?;
        let id = next_id(&txn, kind)?;
        let record = build(id);
        let value = encode(&record)?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Store a new version of the named package together with its files.
    ///
    /// The package record is created on first upload and its
    /// `latest_version_id` is bumped on every upload.
    pub fn create_package_version(
        &self,
        name: &str,
        version: &str,
        route_option: RouteConfig,
        checksum: &str,
        files: &[(String, Vec<u8>)],
    ) -> StateResult<(Package, PackageVersion)> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        let existing: Option<Package> = {
            let table = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            let mut found = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let package: Package = decode(value.value())?;
                if package.name == name {
                    found = Some(package);
                    break;
                }
            }
            found
        };

        let mut package = match existing {
            Some(package) => package,
            None => Package {
                id: next_id(&txn, "packages")?,
                name: name.to_string(),
                latest_version_id: 0,
                created_at: now,
                updated_at: now,
            },
        };

        let version = PackageVersion {
            id: next_id(&txn, "package_versions")?,
            package_id: package.id,
            name: name.to_string(),
            version: version.to_string(),
            route_option,
            checksum: checksum.to_string(),
            created_at: now,
        };
        package.latest_version_id = version.id;
        package.updated_at = now;

        {
            let mut packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            packages
                .insert(package.id, encode(&package)?.as_slice())
                .map_err(map_err!(Write))?;
            let mut versions = txn.open_table(PACKAGE_VERSIONS).map_err(map_err!(Table))?;
            versions
                .insert(version.id, encode(&version)?.as_slice())
                .map_err(map_err!(Write))?;
            let mut blobs = txn.open_table(PACKAGE_FILES).map_err(map_err!(Table))?;
            for (path, bytes) in files {
                let key = package_file_key(version.id, path);
                blobs
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(
            package = %package.name,
            version_id = version.id,
            files = files.len(),
            "package version stored"
        );
        Ok((package, version))
    }

    pub fn get_package(&self, id: PackageId) -> StateResult<Option<Package>> {
        self.get_by_id(PACKAGES, id)
    }

    pub fn get_package_version(&self, id: VersionId) -> StateResult<Option<PackageVersion>> {
        self.get_by_id(PACKAGE_VERSIONS, id)
    }

    /// Read one file of a package version.
    pub fn read_package_file(&self, version_id: VersionId, path: &str) -> StateResult<Option<Vec<u8>>> {
        let key = package_file_key(version_id, path);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PACKAGE_FILES).map_err(map_err!(Table))?;
        Ok(table
            .get(key.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// List the file paths stored for a package version.
    pub fn list_package_files(&self, version_id: VersionId) -> StateResult<Vec<String>> {
        let prefix = format!("{version_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PACKAGE_FILES).map_err(map_err!(Table))?;
        let mut paths = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(path) = key.value().strip_prefix(&prefix) {
                paths.push(path.to_string());
            }
        }
        Ok(paths)
    }

    // ── Installs ───────────────────────────────────────────────────

    /// Bind a package version to an owner.
    pub fn create_install(&self, version_id: VersionId, owner_id: UserId) -> StateResult<InstalledPackage> {
        let version = self
            .get_package_version(version_id)?
            .ok_or_else(|| StateError::NotFound(format!("package version {version_id}")))?;
        let install = self.insert_new(INSTALLS, "installs", |id| InstalledPackage {
            id,
            package_id: version.package_id,
            package_version_id: version.id,
            owner_id,
            created_at: epoch_secs(),
        })?;
        debug!(install_id = install.id, owner_id, "install stored");
        Ok(install)
    }

    pub fn get_install(&self, id: InstallId) -> StateResult<Option<InstalledPackage>> {
        self.get_by_id(INSTALLS, id)
    }

    pub fn list_installs(&self) -> StateResult<Vec<InstalledPackage>> {
        self.list_by_id(INSTALLS)
    }

    // ── Spaces ─────────────────────────────────────────────────────

    /// Create a space for an install.
    ///
    /// A namespace key can be owned by at most one space.
    pub fn create_space(
        &self,
        install: &InstalledPackage,
        namespace_key: &str,
        owns_namespace: bool,
        overlay_for_space_id: SpaceId,
    ) -> StateResult<Space> {
        let now = epoch_secs();
        let check = |txn: &WriteTransaction| {
            if !owns_namespace {
                return Ok(());
            }
            let owner = find_id_in(txn, SPACES, |s: &Space| {
                s.owns_namespace && s.namespace_key == namespace_key
            })?;
            match owner {
                Some(owner) => Err(StateError::Conflict(format!(
                    "namespace {namespace_key} already owned by space {}",
                    owner.id
                ))),
                None => Ok(()),
            }
        };
        let space = self.insert_new_guarded(SPACES, "spaces", check, |id| Space {
            id,
            install_id: install.id,
            package_id: install.package_id,
            package_version_id: install.package_version_id,
            namespace_key: namespace_key.to_string(),
            owns_namespace,
            overlay_for_space_id,
            owner_id: install.owner_id,
            created_at: now,
            updated_at: now,
        })?;
        debug!(space_id = space.id, %namespace_key, "space stored");
        Ok(space)
    }

    /// Insert or update a space.
    pub fn put_space(&self, space: &Space) -> StateResult<()> {
        self.put_by_id(SPACES, space.id, space)
    }

    pub fn get_space(&self, id: SpaceId) -> StateResult<Option<Space>> {
        self.get_by_id(SPACES, id)
    }

    /// List all spaces.
    pub fn list_spaces(&self) -> StateResult<Vec<Space>> {
        self.list_by_id(SPACES)
    }

    /// List spaces backed by any of the given packages.
    pub fn list_spaces_for_packages(&self, package_ids: &HashSet<PackageId>) -> StateResult<Vec<Space>> {
        Ok(self
            .list_spaces()?
            .into_iter()
            .filter(|s| package_ids.contains(&s.package_id))
            .collect())
    }

    /// The space owning a namespace key, if any.
    pub fn find_namespace_owner(&self, namespace_key: &str) -> StateResult<Option<Space>> {
        Ok(self
            .list_spaces()?
            .into_iter()
            .find(|s| s.owns_namespace && s.namespace_key == namespace_key))
    }

    /// Delete a space by id. Returns true if it existed.
    pub fn delete_space(&self, id: SpaceId) -> StateResult<bool> {
        let existed = self.delete_by_id(SPACES, id)?;
        debug!(space_id = id, existed, "space deleted");
        Ok(existed)
    }

    // ── Capabilities ───────────────────────────────────────────────

    /// Enable a capability on a space. Names are unique per space.
    pub fn create_capability(
        &self,
        space: &Space,
        name: &str,
        options: serde_json::Value,
    ) -> StateResult<SpaceCapability> {
        let check = |txn: &WriteTransaction| {
            let taken = find_id_in(txn, CAPABILITIES, |c: &SpaceCapability| {
                c.space_id == space.id && c.name == name
            })?;
            match taken {
                Some(_) => Err(StateError::Conflict(format!(
                    "capability {name} already enabled on space {}",
                    space.id
                ))),
                None => Ok(()),
            }
        };
        self.insert_new_guarded(CAPABILITIES, "capabilities", check, |id| SpaceCapability {
            id,
            install_id: space.install_id,
            space_id: space.id,
            name: name.to_string(),
            options,
            created_at: epoch_secs(),
        })
    }

    pub fn get_capability(&self, id: CapabilityId) -> StateResult<Option<SpaceCapability>> {
        self.get_by_id(CAPABILITIES, id)
    }

    /// Find a space's capability by name.
    pub fn find_capability(&self, space_id: SpaceId, name: &str) -> StateResult<Option<SpaceCapability>> {
        Ok(self
            .list_capabilities_for_space(space_id)?
            .into_iter()
            .find(|c| c.name == name))
    }

    pub fn list_capabilities_for_space(&self, space_id: SpaceId) -> StateResult<Vec<SpaceCapability>> {
        Ok(self
            .list_by_id::<SpaceCapability>(CAPABILITIES)?
            .into_iter()
            .filter(|c| c.space_id == space_id)
            .collect())
    }

    pub fn delete_capability(&self, id: CapabilityId) -> StateResult<bool> {
        self.delete_by_id(CAPABILITIES, id)
    }

    // ── Space KV ───────────────────────────────────────────────────

    /// Insert or update a KV record.
    pub fn put_kv(&self, record: &SpaceKv) -> StateResult<()> {
        self.put_by_key(SPACE_KV, &record.table_key(), record)
    }

    pub fn get_kv(
        &self,
        install_id: InstallId,
        space_id: SpaceId,
        group: &str,
        key: &str,
    ) -> StateResult<Option<SpaceKv>> {
        self.get_by_key(SPACE_KV, &kv_key(install_id, space_id, group, key))
    }

    /// List all records of a KV group.
    pub fn list_kv(&self, install_id: InstallId, space_id: SpaceId, group: &str) -> StateResult<Vec<SpaceKv>> {
        self.scan_prefix(SPACE_KV, &format!("{install_id}/{space_id}/{group}/"))
    }

    pub fn delete_kv(&self, install_id: InstallId, space_id: SpaceId, group: &str, key: &str) -> StateResult<bool> {
        self.delete_by_key(SPACE_KV, &kv_key(install_id, space_id, group, key))
    }

    // ── Space users ────────────────────────────────────────────────

    pub fn put_space_user(&self, user: &SpaceUser) -> StateResult<()> {
        self.put_by_key(SPACE_USERS, &user.table_key(), user)
    }

    pub fn get_space_user(
        &self,
        install_id: InstallId,
        space_id: SpaceId,
        user_id: UserId,
    ) -> StateResult<Option<SpaceUser>> {
        self.get_by_key(SPACE_USERS, &format!("{install_id}/{space_id}/{user_id}"))
    }

    pub fn list_space_users(&self, install_id: InstallId, space_id: SpaceId) -> StateResult<Vec<SpaceUser>> {
        self.scan_prefix(SPACE_USERS, &format!("{install_id}/{space_id}/"))
    }

    pub fn delete_space_user(&self, install_id: InstallId, space_id: SpaceId, user_id: UserId) -> StateResult<bool> {
        self.delete_by_key(SPACE_USERS, &format!("{install_id}/{space_id}/{user_id}"))
    }

    // ── Event subscriptions ────────────────────────────────────────

    /// Store a new subscription. The `id` of the argument is ignored.
    pub fn create_event_subscription(&self, sub: &EventSubscription) -> StateResult<EventSubscription> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let now = epoch_secs();
        let record = EventSubscription {
            id: next_id(&txn, "subscriptions")?,
            created_at: now,
            updated_at: now,
            ..sub.clone()
        };
        {
            let mut table = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let key = record.table_key();
            table
                .insert(key.as_str(), encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            subscription_id = record.id,
            install_id = record.install_id,
            event_key = %record.event_key,
            "subscription stored"
        );
        Ok(record)
    }

    /// Overwrite an existing subscription.
    pub fn update_event_subscription(&self, sub: &EventSubscription) -> StateResult<()> {
        if self.get_event_subscription(sub.install_id, sub.id)?.is_none() {
            return Err(StateError::NotFound(format!("subscription {}", sub.id)));
        }
        self.put_by_key(SUBSCRIPTIONS, &sub.table_key(), sub)
    }

    /// Get a subscription scoped to its install.
    pub fn get_event_subscription(
        &self,
        install_id: InstallId,
        id: SubscriptionId,
    ) -> StateResult<Option<EventSubscription>> {
        self.get_by_key(SUBSCRIPTIONS, &subscription_key(install_id, id))
    }

    pub fn delete_event_subscription(&self, install_id: InstallId, id: SubscriptionId) -> StateResult<bool> {
        self.delete_by_key(SUBSCRIPTIONS, &subscription_key(install_id, id))
    }

    pub fn list_event_subscriptions(&self, install_id: InstallId) -> StateResult<Vec<EventSubscription>> {
        self.scan_prefix(SUBSCRIPTIONS, &format!("{install_id}/"))
    }

    /// Every subscription, enabled or not.
    pub fn query_all_event_subscriptions(&self) -> StateResult<Vec<EventSubscription>> {
        self.scan_prefix(SUBSCRIPTIONS, "")
    }

    /// Enabled subscriptions listening for `event_key` on an install.
    pub fn query_subscriptions_for_event(
        &self,
        install_id: InstallId,
        event_key: &str,
    ) -> StateResult<Vec<EventSubscription>> {
        Ok(self
            .list_event_subscriptions(install_id)?
            .into_iter()
            .filter(|s| !s.disabled && s.event_key == event_key)
            .collect())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Persist a new event with status `new`.
    pub fn add_event(&self, install_id: InstallId, name: &str, payload: &[u8]) -> StateResult<MqEvent> {
        let now = epoch_secs();
        self.insert_new(EVENTS, "events", |id| MqEvent {
            id,
            install_id,
            name: name.to_string(),
            payload: payload.to_vec(),
            status: EventStatus::New,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_event(&self, id: EventId) -> StateResult<Option<MqEvent>> {
        self.get_by_id(EVENTS, id)
    }

    pub fn update_event(&self, event: &MqEvent) -> StateResult<()> {
        self.put_by_id(EVENTS, event.id, event)
    }

    /// Events that have not had targets created yet.
    pub fn query_new_events(&self) -> StateResult<Vec<MqEvent>> {
        Ok(self
            .list_by_id::<MqEvent>(EVENTS)?
            .into_iter()
            .filter(|e| e.status == EventStatus::New)
            .collect())
    }

    // ── Event targets ──────────────────────────────────────────────

    /// Insert the targets of an event and mark the event `scheduled`.
    ///
    /// With no targets the event goes straight to `processed`.
    pub fn create_event_targets(
        &self,
        event_id: EventId,
        targets: &[NewEventTarget],
    ) -> StateResult<Vec<MqEventTarget>> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        let mut event: MqEvent = read_id_in(&txn, EVENTS, event_id)?
            .ok_or_else(|| StateError::NotFound(format!("event {event_id}")))?;

        let mut created = Vec::with_capacity(targets.len());
        for spec in targets {
            let status = if spec.delayed_until_ms > 0 {
                TargetStatus::Delayed
            } else {
                TargetStatus::New
            };
            created.push(MqEventTarget {
                id: next_id(&txn, "event_targets")?,
                event_id,
                subscription_id: spec.subscription_id,
                status,
                delayed_until_ms: spec.delayed_until_ms,
                attempts: 0,
                error: String::new(),
                created_at: now,
                updated_at: now,
            });
        }

        event.status = if created.is_empty() {
            EventStatus::Processed
        } else {
            EventStatus::Scheduled
        };
        event.updated_at = now;

        {
            let mut table = txn.open_table(EVENT_TARGETS).map_err(map_err!(Table))?;
            for target in &created {
                let key = target.table_key();
                table
                    .insert(key.as_str(), encode(target)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
            let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            events
                .insert(event.id, encode(&event)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(event_id, targets = created.len(), "event targets created");
        Ok(created)
    }

    pub fn get_event_target(&self, event_id: EventId, target_id: TargetId) -> StateResult<Option<MqEventTarget>> {
        self.get_by_key(EVENT_TARGETS, &target_key(event_id, target_id))
    }

    /// Targets still waiting for their first delivery attempt.
    pub fn query_new_event_targets(&self) -> StateResult<Vec<MqEventTarget>> {
        Ok(self
            .scan_prefix::<MqEventTarget>(EVENT_TARGETS, "")?
            .into_iter()
            .filter(|t| t.status == TargetStatus::New)
            .collect())
    }

    /// Delayed targets whose hold has elapsed at `now_ms`.
    pub fn query_delay_expired_targets(&self, now_ms: u64) -> StateResult<Vec<MqEventTarget>> {
        Ok(self
            .scan_prefix::<MqEventTarget>(EVENT_TARGETS, "")?
            .into_iter()
            .filter(|t| t.status == TargetStatus::Delayed && t.delayed_until_ms <= now_ms)
            .collect())
    }

    pub fn query_event_targets_by_event_id(&self, event_id: EventId) -> StateResult<Vec<MqEventTarget>> {
        self.scan_prefix(EVENT_TARGETS, &format!("{event_id:019}/"))
    }

    /// Claim a target for delivery.
    ///
    /// Moves `new` (or an expired `delayed`) target to `processing` and
    /// counts the attempt. Returns `None` when the target is missing or is
    /// not claimable, so concurrent claimers never both proceed.
    pub fn start_event_target(
        &self,
        event_id: EventId,
        target_id: TargetId,
        now_ms: u64,
    ) -> StateResult<Option<MqEventTarget>> {
        self.mutate_target(event_id, target_id, |target| {
            let claimable = match target.status {
                TargetStatus::New => true,
                TargetStatus::Delayed => target.delayed_until_ms <= now_ms,
                _ => false,
            };
            if !claimable {
                return false;
            }
            target.status = TargetStatus::Processing;
            target.attempts += 1;
            true
        })
    }

    /// Mark a target processed and re-check its event.
    ///
    /// Returns true when the parent event is (now) `processed`, i.e. no
    /// target of the event is in any other state.
    pub fn complete_event_target(&self, event_id: EventId, target_id: TargetId) -> StateResult<bool> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let key = target_key(event_id, target_id);
        let prefix = format!("{event_id:019}/");

        let pending = {
            let mut table = txn.open_table(EVENT_TARGETS).map_err(map_err!(Table))?;
            let current: Option<MqEventTarget> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut target =
                current.ok_or_else(|| StateError::NotFound(format!("event target {key}")))?;
            if target.status != TargetStatus::Processed {
                target.status = TargetStatus::Processed;
                target.error.clear();
                target.updated_at = now;
                table
                    .insert(key.as_str(), encode(&target)?.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut pending = 0usize;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (k, value) = entry.map_err(map_err!(Read))?;
                if k.value().starts_with(&prefix) {
                    let sibling: MqEventTarget = decode(value.value())?;
                    if sibling.status != TargetStatus::Processed {
                        pending += 1;
                    }
                }
            }
            pending
        };

        let processed = if pending == 0 {
            let mut event: MqEvent = read_id_in(&txn, EVENTS, event_id)?
                .ok_or_else(|| StateError::NotFound(format!("event {event_id}")))?;
            if event.status != EventStatus::Processed {
                event.status = EventStatus::Processed;
                event.updated_at = now;
                let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;
                events
                    .insert(event.id, encode(&event)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
            true
        } else {
            false
        };

        txn.commit().map_err(map_err!(Transaction))?;
        debug!(event_id, target_id, pending, processed, "event target completed");
        Ok(processed)
    }

    /// Record a terminal delivery failure.
    pub fn fail_event_target(
        &self,
        event_id: EventId,
        target_id: TargetId,
        error: &str,
    ) -> StateResult<MqEventTarget> {
        self.mutate_target(event_id, target_id, |target| {
            target.status = TargetStatus::Failed;
            target.error = error.to_string();
            true
        })?
        .ok_or_else(|| StateError::NotFound(format!("event target {}", target_key(event_id, target_id))))
    }

    /// Park a target until `until_ms`, keeping the last error for inspection.
    pub fn delay_event_target(
        &self,
        event_id: EventId,
        target_id: TargetId,
        until_ms: u64,
        error: &str,
    ) -> StateResult<MqEventTarget> {
        self.mutate_target(event_id, target_id, |target| {
            target.status = TargetStatus::Delayed;
            target.delayed_until_ms = until_ms;
            target.error = error.to_string();
            true
        })?
        .ok_or_else(|| StateError::NotFound(format!("event target {}", target_key(event_id, target_id))))
    }

    /// Read-modify-write a target in one transaction. `apply` returns
    /// false to leave the record untouched (and yield `None`).
    fn mutate_target<F>(&self, event_id: EventId, target_id: TargetId, apply: F) -> StateResult<Option<MqEventTarget>>
    where
        F: FnOnce(&mut MqEventTarget) -> bool,
    {
        let key = target_key(event_id, target_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(EVENT_TARGETS).map_err(map_err!(Table))?;
            let current: Option<MqEventTarget> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current.and_then(|mut target| apply(&mut target).then_some(target)) {
                Some(mut target) => {
                    target.updated_at = epoch_secs();
                    table
                        .insert(key.as_str(), encode(&target)?.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(target)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }
}

/// Bump and return the counter for `kind` inside an open write transaction.
fn next_id(txn: &WriteTransaction, kind: &str) -> StateResult<i64> {
    let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = counters
        .get(kind)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    counters.insert(kind, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn read_id_in<T: DeserializeOwned>(txn: &WriteTransaction, def: IdTable, id: i64) -> StateResult<Option<T>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let value = match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(value)
}

/// First record of an id table matching `pred`, read inside an open write transaction.
fn find_id_in<T, P>(txn: &WriteTransaction, def: IdTable, pred: P) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    P: Fn(&T) -> bool,
{
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = decode(value.value())?;
        if pred(&record) {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

fn encode<T: Serialize>(record: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
