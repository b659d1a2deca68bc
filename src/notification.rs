//! change notification listeners and persistent searches
//!
//! both are told about successful updates after the response was sent

use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::operation::OperationRecord;
use std::sync::{Arc, RwLock};

/// a successful change to the directory
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    /// an entry was added
    Add {
        /// the new entry
        entry: &'a Entry,
    },
    /// an entry was deleted
    Delete {
        /// the deleted entry
        entry: &'a Entry,
    },
    /// an entry was modified
    Modify {
        /// the entry before the change
        old_entry: &'a Entry,
        /// the entry after the change
        new_entry: &'a Entry,
    },
    /// an entry was renamed
    ModifyDn {
        /// the entry before the rename
        old_entry: &'a Entry,
        /// the entry after the rename
        new_entry: &'a Entry,
    },
}

/// gets told about every successful change
pub trait ChangeNotificationListener: std::fmt::Debug + Send + Sync {
    /// identifies the listener in log messages
    fn id(&self) -> &str;

    /// an entry was added
    fn handle_add_operation(
        &self,
        _operation: &OperationRecord,
        _entry: &Entry,
    ) -> Result<(), DirectoryError> {
        Ok(())
    }

    /// an entry was deleted
    fn handle_delete_operation(
        &self,
        _operation: &OperationRecord,
        _entry: &Entry,
    ) -> Result<(), DirectoryError> {
        Ok(())
    }

    /// an entry was modified
    fn handle_modify_operation(
        &self,
        _operation: &OperationRecord,
        _old_entry: &Entry,
        _new_entry: &Entry,
    ) -> Result<(), DirectoryError> {
        Ok(())
    }

    /// an entry was renamed
    fn handle_modify_dn_operation(
        &self,
        _operation: &OperationRecord,
        _old_entry: &Entry,
        _new_entry: &Entry,
    ) -> Result<(), DirectoryError> {
        Ok(())
    }
}

/// a search that keeps reporting changes to matching entries
///
/// an error from any method ends the persistent search
pub trait PersistentSearch: std::fmt::Debug + Send + Sync {
    /// identifies the search in log messages
    fn id(&self) -> &str;

    /// an entry was added
    fn process_add(&self, operation: &OperationRecord, entry: &Entry) -> Result<(), DirectoryError>;

    /// an entry was deleted
    fn process_delete(&self, operation: &OperationRecord, entry: &Entry)
        -> Result<(), DirectoryError>;

    /// an entry was modified
    fn process_modify(
        &self,
        operation: &OperationRecord,
        old_entry: &Entry,
        new_entry: &Entry,
    ) -> Result<(), DirectoryError>;

    /// an entry was renamed
    fn process_modify_dn(
        &self,
        operation: &OperationRecord,
        old_entry: &Entry,
        new_entry: &Entry,
    ) -> Result<(), DirectoryError>;
}

/// the registered listeners and persistent searches
#[derive(Debug, Default)]
pub struct NotificationRegistry {
    /// the listeners in registration order
    listeners: RwLock<Vec<Arc<dyn ChangeNotificationListener>>>,
    /// the active persistent searches
    persistent_searches: RwLock<Vec<Arc<dyn PersistentSearch>>>,
}

impl NotificationRegistry {
    /// an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register a listener
    pub fn register_listener(&self, listener: Arc<dyn ChangeNotificationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// remove a listener by id
    pub fn deregister_listener(&self, id: &str) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|l| l.id() != id);
    }

    /// register a persistent search
    pub fn register_persistent_search(&self, search: Arc<dyn PersistentSearch>) {
        self.persistent_searches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(search);
    }

    /// remove a persistent search by id
    pub fn deregister_persistent_search(&self, id: &str) {
        self.persistent_searches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id() != id);
    }

    /// the number of active persistent searches
    pub fn persistent_search_count(&self) -> usize {
        self.persistent_searches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// tell every listener and persistent search about a change
    ///
    /// listener failures are logged, failing persistent searches are
    /// deregistered
    pub fn notify(&self, operation: &OperationRecord, change: Change<'_>) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            let result = match change {
                Change::Add { entry } => listener.handle_add_operation(operation, entry),
                Change::Delete { entry } => listener.handle_delete_operation(operation, entry),
                Change::Modify {
                    old_entry,
                    new_entry,
                } => listener.handle_modify_operation(operation, old_entry, new_entry),
                Change::ModifyDn {
                    old_entry,
                    new_entry,
                } => listener.handle_modify_dn_operation(operation, old_entry, new_entry),
            };
            if let Err(e) = result {
                tracing::error!(
                    "Change notification listener {} failed for operation {} on connection {}: {}",
                    listener.id(),
                    operation.operation_id(),
                    operation.connection_id(),
                    e
                );
            }
        }
        let searches = self
            .persistent_searches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for search in searches {
            let result = match change {
                Change::Add { entry } => search.process_add(operation, entry),
                Change::Delete { entry } => search.process_delete(operation, entry),
                Change::Modify {
                    old_entry,
                    new_entry,
                } => search.process_modify(operation, old_entry, new_entry),
                Change::ModifyDn {
                    old_entry,
                    new_entry,
                } => search.process_modify_dn(operation, old_entry, new_entry),
            };
            if let Err(e) = result {
                tracing::error!(
                    "Persistent search {} failed for operation {} on connection {}, deregistering it: {}",
                    search.id(),
                    operation.operation_id(),
                    operation.connection_id(),
                    e
                );
                self.deregister_persistent_search(search.id());
            }
        }
    }
}
