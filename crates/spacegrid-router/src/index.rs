//! The live namespace → space routing index.
//!
//! Entries are immutable once published. Rebuilds construct a fresh map and
//! swap it in under the write lock, so readers only ever hold the lock long
//! enough to clone an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use spacegrid_core::{InstallId, PackageId, SpaceId, VersionId};
use spacegrid_state::RouteConfig;

use crate::template::TemplateSet;

/// Everything needed to serve one namespace without touching the store
/// for metadata.
#[derive(Debug, Clone)]
pub struct RoutingIndexEntry {
    pub namespace_key: String,
    pub package_id: PackageId,
    pub space_id: SpaceId,
    pub installed_id: InstallId,
    pub package_version_id: VersionId,
    pub overlay_for_space_id: SpaceId,
    pub package_name: String,
    pub route_option: RouteConfig,
    /// Named by file path relative to `route_option.template_folder`.
    pub templates: Arc<TemplateSet>,
}

pub type IndexMap = HashMap<String, Arc<RoutingIndexEntry>>;

#[derive(Default)]
pub struct RoutingIndex {
    entries: RwLock<Arc<IndexMap>>,
}

impl RoutingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, namespace_key: &str) -> Option<Arc<RoutingIndexEntry>> {
        self.snapshot().get(namespace_key).cloned()
    }

    /// The current map. Later swaps do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<IndexMap> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole map.
    pub fn replace(&self, entries: IndexMap) {
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(entries);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }
}
