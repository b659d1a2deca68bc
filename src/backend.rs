//! the storage backends owning subtrees of the directory

pub mod memory;

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::filter::SearchFilter;
use crate::operation::OperationRecord;
use ldap3::Scope;
use serde::Deserialize;
use std::sync::{Arc, RwLock};

/// whether a backend or the whole server accepts writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritabilityMode {
    /// all writes are accepted
    #[default]
    Enabled,
    /// no writes are accepted
    Disabled,
    /// only internal and replicated writes are accepted
    InternalOnly,
}

impl WritabilityMode {
    /// whether an operation with these flags may write
    pub fn allows(self, internal: bool, synchronization: bool) -> bool {
        match self {
            WritabilityMode::Enabled => true,
            WritabilityMode::Disabled => false,
            WritabilityMode::InternalOnly => internal || synchronization,
        }
    }
}

/// storage for the entries below a set of base DNs
///
/// mutations are only requested while the pipeline holds the write lock of
/// every affected DN
pub trait Backend: std::fmt::Debug + Send + Sync {
    /// identifies the backend in log messages
    fn id(&self) -> &str;

    /// the base DNs of the subtrees this backend holds
    fn base_dns(&self) -> Vec<Dn>;

    /// fetch an entry
    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError>;

    /// whether an entry exists
    fn entry_exists(&self, dn: &Dn) -> Result<bool, DirectoryError> {
        Ok(self.get_entry(dn)?.is_some())
    }

    /// whether an entry has children in this backend
    fn has_subordinates(&self, dn: &Dn) -> Result<bool, DirectoryError>;

    /// store a new entry
    fn add_entry(&self, entry: Entry, operation: &OperationRecord) -> Result<(), DirectoryError>;

    /// remove a leaf entry
    fn delete_entry(&self, dn: &Dn, operation: &OperationRecord) -> Result<(), DirectoryError>;

    /// replace an existing entry with a new version under the same DN
    fn replace_entry(
        &self,
        old_entry: &Entry,
        new_entry: Entry,
        operation: &OperationRecord,
    ) -> Result<(), DirectoryError>;

    /// move the entry at `current_dn` to the DN of `new_entry`, children
    /// move along
    fn rename_entry(
        &self,
        current_dn: &Dn,
        new_entry: Entry,
        operation: &OperationRecord,
    ) -> Result<(), DirectoryError>;

    /// the entries in scope that match the filter
    fn search(
        &self,
        base: &Dn,
        scope: Scope,
        filter: &SearchFilter,
    ) -> Result<Vec<Entry>, DirectoryError>;

    /// whether the backend accepts writes
    fn writability_mode(&self) -> WritabilityMode;

    /// whether the backend handles a control itself
    fn supports_control(&self, oid: &str) -> bool;
}

/// routes DNs to the backend holding them
#[derive(Debug, Default)]
pub struct BackendRegistry {
    /// the registered backends
    backends: RwLock<Vec<Arc<dyn Backend>>>,
}

impl BackendRegistry {
    /// an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register a backend
    pub fn register(&self, backend: Arc<dyn Backend>) {
        tracing::debug!("Registering backend {}", backend.id());
        self.backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(backend);
    }

    /// remove a backend by id, returns whether one was removed
    pub fn deregister(&self, id: &str) -> bool {
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());
        let before = backends.len();
        backends.retain(|b| b.id() != id);
        before != backends.len()
    }

    /// all registered backends
    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// the backend with the deepest base DN at or above the DN
    pub fn backend_for(&self, dn: &Dn) -> Option<Arc<dyn Backend>> {
        let backends = self.backends.read().unwrap_or_else(|e| e.into_inner());
        backends
            .iter()
            .filter_map(|backend| {
                backend
                    .base_dns()
                    .iter()
                    .filter(|base| dn.is_descendant_of(base))
                    .map(Dn::len)
                    .max()
                    .map(|depth| (depth, backend))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, backend)| Arc::clone(backend))
    }

    /// the backends holding subtrees below one of the backend's base DNs
    pub fn subordinate_backends(&self, backend: &dyn Backend) -> Vec<Arc<dyn Backend>> {
        let parent_bases = backend.base_dns();
        self.backends()
            .into_iter()
            .filter(|candidate| candidate.id() != backend.id())
            .filter(|candidate| {
                candidate.base_dns().iter().any(|base| {
                    parent_bases
                        .iter()
                        .any(|parent| base.is_strict_descendant_of(parent))
                })
            })
            .collect()
    }

    /// walk up from a missing entry to the closest existing ancestor
    pub fn matched_dn(&self, dn: &Dn) -> Option<Dn> {
        dn.ancestors().find(|ancestor| {
            !ancestor.is_root()
                && self
                    .backend_for(ancestor)
                    .map(|backend| backend.entry_exists(ancestor).unwrap_or(false))
                    .unwrap_or(false)
        })
    }
}
