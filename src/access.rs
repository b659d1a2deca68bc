//! the access control decision gate

use crate::entry::Entry;
use crate::operation::OperationRecord;

/// decides whether an operation may proceed
pub trait AccessControlHandler: std::fmt::Debug + Send + Sync {
    /// whether the operation is allowed, evaluated after the target entry
    /// was fetched into the operation record
    fn is_allowed(&self, operation: &OperationRecord) -> bool;

    /// whether the requester may act as the proxied identity
    fn is_proxied_auth_allowed(&self, operation: &OperationRecord, proxy_entry: &Entry) -> bool;

    /// the part of an entry the requester may read, used for read controls
    /// and search results
    fn filter_entry(&self, _operation: &OperationRecord, entry: &Entry) -> Entry {
        entry.clone()
    }
}

/// allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAccessControl;

impl AccessControlHandler for AllowAllAccessControl {
    fn is_allowed(&self, _operation: &OperationRecord) -> bool {
        true
    }

    fn is_proxied_auth_allowed(&self, _operation: &OperationRecord, _proxy_entry: &Entry) -> bool {
        true
    }
}
