//! Routing index synchronization — bridges the state store to the index.
//!
//! `IndexSync` reads spaces from the state store and rebuilds routing
//! entries. Rebuild requests are buffered signals drained by a fixed-tick
//! reconciliation loop, so callers never wait for a rebuild and duplicate
//! requests collapse into one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use spacegrid_core::PackageId;
use spacegrid_state::{Space, StateError, StateStore};

use crate::error::RouteResult;
use crate::index::{IndexMap, RoutingIndex, RoutingIndexEntry};
use crate::template::TemplateSet;

struct Signals {
    full: mpsc::Receiver<()>,
    packages: mpsc::Receiver<PackageId>,
}

/// Keeps a [`RoutingIndex`] in step with the persisted spaces.
pub struct IndexSync {
    store: StateStore,
    index: Arc<RoutingIndex>,
    full_tx: mpsc::Sender<()>,
    package_tx: mpsc::Sender<PackageId>,
    signals: Mutex<Signals>,
}

/// Rebuild statistics.
#[derive(Debug, Default, PartialEq)]
pub struct SyncStats {
    pub entries: usize,
    pub skipped: usize,
}

impl IndexSync {
    pub fn new(store: StateStore, index: Arc<RoutingIndex>, package_queue: usize) -> Self {
        let (full_tx, full) = mpsc::channel(1);
        let (package_tx, packages) = mpsc::channel(package_queue.max(1));
        Self {
            store,
            index,
            full_tx,
            package_tx,
            signals: Mutex::new(Signals { full, packages }),
        }
    }

    pub fn index(&self) -> &Arc<RoutingIndex> {
        &self.index
    }

    /// Ask for a full rebuild on the next tick.
    pub fn request_full_reload(&self) {
        // A pending signal already covers this request.
        let _ = self.full_tx.try_send(());
    }

    /// Ask for the entries of one package to be rebuilt on the next tick.
    ///
    /// When the package queue is full this degrades to a full reload.
    pub fn request_package_reload(&self, package_id: PackageId) {
        if self.package_tx.try_send(package_id).is_err() {
            debug!(package_id, "package reload queue full, requesting full reload");
            self.request_full_reload();
        }
    }

    /// Full rebuild: every space owning its namespace.
    ///
    /// On error the previous index stays in place.
    pub fn load_routing_index(&self) -> Result<SyncStats, StateError> {
        let spaces = self.store.list_spaces()?;
        let mut entries = IndexMap::new();
        let stats = self.build_into(&mut entries, &spaces)?;
        self.index.replace(entries);

        info!(
            entries = stats.entries,
            skipped = stats.skipped,
            "routing index loaded"
        );
        Ok(stats)
    }

    /// Incremental rebuild of the entries belonging to `package_ids`.
    pub fn reload_packages(&self, package_ids: &HashSet<PackageId>) -> Result<SyncStats, StateError> {
        let spaces = self.store.list_spaces_for_packages(package_ids)?;

        let mut entries: IndexMap = (*self.index.snapshot()).clone();
        entries.retain(|_, entry| !package_ids.contains(&entry.package_id));
        let stats = self.build_into(&mut entries, &spaces)?;
        self.index.replace(entries);

        debug!(
            packages = package_ids.len(),
            entries = stats.entries,
            "routing index packages reloaded"
        );
        Ok(stats)
    }

    fn build_into(&self, entries: &mut IndexMap, spaces: &[Space]) -> Result<SyncStats, StateError> {
        let mut stats = SyncStats::default();
        for space in spaces.iter().filter(|s| s.owns_namespace) {
            match build_entry(&self.store, space) {
                Ok(Some(entry)) => {
                    entries.insert(entry.namespace_key.clone(), Arc::new(entry));
                    stats.entries += 1;
                }
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    warn!(space_id = space.id, error = %e, "skipping space in routing index");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Drain pending signals and rebuild once.
    ///
    /// A pending full reload wins and discards pending package requests.
    pub async fn tick_once(&self) -> Result<(), StateError> {
        let mut signals = self.signals.lock().await;

        let full = signals.full.try_recv().is_ok();
        let mut packages = HashSet::new();
        while let Ok(id) = signals.packages.try_recv() {
            packages.insert(id);
        }
        drop(signals);

        if full {
            self.load_routing_index()?;
        } else if !packages.is_empty() {
            self.reload_packages(&packages)?;
        }
        Ok(())
    }

    /// Reconciliation loop. Runs until `shutdown` flips.
    pub async fn run(&self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        debug!(?tick, "routing reconciler starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick_once().await {
                        error!(error = %e, "routing index rebuild failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("routing reconciler shutting down");
                    break;
                }
            }
        }
    }
}

/// Build the index entry for one space. `None` when its package version
/// is gone.
fn build_entry(store: &StateStore, space: &Space) -> RouteResult<Option<RoutingIndexEntry>> {
    let Some(version) = store.get_package_version(space.package_version_id)? else {
        warn!(
            space_id = space.id,
            version_id = space.package_version_id,
            "space references missing package version"
        );
        return Ok(None);
    };

    let templates = compile_templates(store, version.id, &version.route_option.template_folder)?;

    Ok(Some(RoutingIndexEntry {
        namespace_key: space.namespace_key.clone(),
        package_id: space.package_id,
        space_id: space.id,
        installed_id: space.install_id,
        package_version_id: version.id,
        overlay_for_space_id: space.overlay_for_space_id,
        package_name: version.name,
        route_option: version.route_option,
        templates: Arc::new(templates),
    }))
}

fn compile_templates(
    store: &StateStore,
    version_id: i64,
    template_folder: &str,
) -> RouteResult<TemplateSet> {
    let mut templates = TemplateSet::new();
    let folder = template_folder.trim_matches('/');
    if folder.is_empty() {
        return Ok(templates);
    }
    let prefix = format!("{folder}/");

    for path in store.list_package_files(version_id)? {
        let Some(name) = path.strip_prefix(&prefix) else {
            continue;
        };
        let Some(bytes) = store.read_package_file(version_id, &path)? else {
            continue;
        };
        match String::from_utf8(bytes) {
            Ok(source) => {
                if let Err(e) = templates.add(name, source) {
                    warn!(version_id, %path, error = %e, "template failed to compile");
                }
            }
            Err(_) => warn!(version_id, %path, "template is not valid UTF-8"),
        }
    }
    Ok(templates)
}
