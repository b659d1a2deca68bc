//! a backend keeping its entries in memory

use super::{Backend, WritabilityMode};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::filter::SearchFilter;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use ldap3::Scope;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// an in-memory backend
#[derive(Debug)]
pub struct MemoryBackend {
    /// the backend id
    id: String,
    /// the base DNs
    base_dns: Vec<Dn>,
    /// the entries by DN
    entries: RwLock<BTreeMap<Dn, Entry>>,
    /// whether writes are accepted
    writability: RwLock<WritabilityMode>,
    /// OIDs of controls the backend handles itself
    supported_controls: HashSet<String>,
    /// number of successful mutations
    mutations: AtomicUsize,
}

impl MemoryBackend {
    /// an empty backend for the base DNs
    pub fn new(id: &str, base_dns: Vec<Dn>) -> Self {
        Self {
            id: id.to_string(),
            base_dns,
            entries: RwLock::new(BTreeMap::new()),
            writability: RwLock::new(WritabilityMode::Enabled),
            supported_controls: HashSet::new(),
            mutations: AtomicUsize::new(0),
        }
    }

    /// declare a control as handled by this backend
    pub fn with_supported_control(mut self, oid: &str) -> Self {
        self.supported_controls.insert(oid.to_string());
        self
    }

    /// store an entry without any checks
    pub fn load(&self, entry: Entry) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.dn().to_owned(), entry);
    }

    /// change whether writes are accepted
    pub fn set_writability_mode(&self, mode: WritabilityMode) {
        *self.writability.write().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// the number of entries
    pub fn entry_count(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// the number of successful add, delete, replace and rename calls
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// whether the DN is one of the base DNs
    fn is_base_dn(&self, dn: &Dn) -> bool {
        self.base_dns.iter().any(|base| base == dn)
    }

    /// check that the parent of a new DN exists
    fn check_parent(&self, entries: &BTreeMap<Dn, Entry>, dn: &Dn) -> Result<(), DirectoryError> {
        if self.is_base_dn(dn) {
            return Ok(());
        }
        let parent = dn.parent().unwrap_or_default();
        if entries.contains_key(&parent) {
            return Ok(());
        }
        let mut error = DirectoryError::new(
            ResultCode::NoSuchObject,
            format!("The parent entry {} of {} does not exist", parent, dn),
        );
        if let Some(matched) = parent.ancestors().find(|a| entries.contains_key(a)) {
            error = error.with_matched_dn(matched);
        }
        Err(error)
    }

    /// count a mutation
    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Backend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn base_dns(&self) -> Vec<Dn> {
        self.base_dns.clone()
    }

    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dn)
            .cloned())
    }

    fn has_subordinates(&self, dn: &Dn) -> Result<bool, DirectoryError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .any(|key| dn.is_parent_of(key)))
    }

    fn add_entry(&self, entry: Entry, _operation: &OperationRecord) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(entry.dn()) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("The entry {} already exists", entry.dn()),
            ));
        }
        self.check_parent(&entries, entry.dn())?;
        entries.insert(entry.dn().to_owned(), entry);
        self.mutated();
        Ok(())
    }

    fn delete_entry(&self, dn: &Dn, _operation: &OperationRecord) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !entries.contains_key(dn) {
            return Err(DirectoryError::no_such_object(dn));
        }
        if entries.keys().any(|key| dn.is_parent_of(key)) {
            return Err(DirectoryError::new(
                ResultCode::NotAllowedOnNonleaf,
                format!("The entry {} has subordinate entries", dn),
            ));
        }
        entries.remove(dn);
        self.mutated();
        Ok(())
    }

    fn replace_entry(
        &self,
        old_entry: &Entry,
        new_entry: Entry,
        _operation: &OperationRecord,
    ) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if old_entry.dn() != new_entry.dn() {
            return Err(DirectoryError::new(
                ResultCode::UnwillingToPerform,
                "Replacing an entry can not change its DN",
            ));
        }
        if !entries.contains_key(new_entry.dn()) {
            return Err(DirectoryError::no_such_object(new_entry.dn()));
        }
        entries.insert(new_entry.dn().to_owned(), new_entry);
        self.mutated();
        Ok(())
    }

    fn rename_entry(
        &self,
        current_dn: &Dn,
        new_entry: Entry,
        _operation: &OperationRecord,
    ) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !entries.contains_key(current_dn) {
            return Err(DirectoryError::no_such_object(current_dn));
        }
        let new_dn = new_entry.dn().to_owned();
        if new_dn != *current_dn && entries.contains_key(&new_dn) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("The entry {} already exists", new_dn),
            ));
        }
        if new_dn.is_strict_descendant_of(current_dn) {
            return Err(DirectoryError::new(
                ResultCode::UnwillingToPerform,
                format!("The entry {} can not be moved below itself", current_dn),
            ));
        }
        self.check_parent(&entries, &new_dn)?;
        let descendants: Vec<Dn> = entries
            .keys()
            .filter(|key| key.is_strict_descendant_of(current_dn))
            .cloned()
            .collect();
        entries.remove(current_dn);
        for old_dn in descendants {
            if let Some(mut child) = entries.remove(&old_dn) {
                if let Some(moved) = old_dn.rebase(current_dn, &new_dn) {
                    child.set_dn(moved.to_owned());
                    entries.insert(moved, child);
                }
            }
        }
        entries.insert(new_dn, new_entry);
        self.mutated();
        Ok(())
    }

    fn search(
        &self,
        base: &Dn,
        scope: Scope,
        filter: &SearchFilter,
    ) -> Result<Vec<Entry>, DirectoryError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if !entries.contains_key(base) {
            let mut error = DirectoryError::no_such_object(base);
            if let Some(matched) = base.ancestors().find(|a| entries.contains_key(a)) {
                error = error.with_matched_dn(matched);
            }
            return Err(error);
        }
        Ok(entries
            .values()
            .filter(|entry| match scope {
                Scope::Base => entry.dn() == base,
                Scope::OneLevel => base.is_parent_of(entry.dn()),
                Scope::Subtree => entry.dn().is_descendant_of(base),
            })
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }

    fn writability_mode(&self) -> WritabilityMode {
        *self.writability.read().unwrap_or_else(|e| e.into_inner())
    }

    fn supports_control(&self, oid: &str) -> bool {
        self.supported_controls.contains(oid)
    }
}
