//! hooks for replication and conflict resolution

use crate::error::DirectoryError;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;

/// whether a synchronization provider lets processing continue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynchronizationProviderResult {
    /// go on
    Continue,
    /// stop and report the result to the client
    StopProcessing {
        /// the result code
        result_code: ResultCode,
        /// the diagnostic message
        message: String,
    },
}

/// a replication mechanism hooked into update operations
///
/// only delete, modify DN, add and modify operations are offered to
/// providers
pub trait SynchronizationProvider: std::fmt::Debug + Send + Sync {
    /// identifies the provider in log messages
    fn id(&self) -> &str;

    /// inspect the fetched state for conflicts with replicated changes
    fn handle_conflict_resolution(
        &self,
        _operation: &mut OperationRecord,
    ) -> Result<SynchronizationProviderResult, DirectoryError> {
        Ok(SynchronizationProviderResult::Continue)
    }

    /// called after the pre-operation plugins ran
    fn do_pre_operation(
        &self,
        _operation: &mut OperationRecord,
    ) -> Result<SynchronizationProviderResult, DirectoryError> {
        Ok(SynchronizationProviderResult::Continue)
    }

    /// called after the backend was asked to apply the change, on every
    /// exit path past that point
    fn do_post_operation(&self, _operation: &mut OperationRecord) -> Result<(), DirectoryError> {
        Ok(())
    }
}
