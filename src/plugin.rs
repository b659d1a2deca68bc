//! extension points of the operation pipeline
//!
//! plugins are called at four checkpoints. Each call yields a
//! [PluginResult]; errors and panics inside a plugin are caught at the call
//! site and handled according to the checkpoint they happened at.

use crate::error::DirectoryError;
use crate::operation::{OperationRecord, OperationType};
use crate::result_code::ResultCode;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// the checkpoints plugins can hook into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginCheckpoint {
    /// before the request fields are resolved
    PreParse,
    /// after access control and control processing, before the backend
    PreOperation,
    /// after the backend, before the response
    PostOperation,
    /// after the response was sent
    PostResponse,
}

impl std::fmt::Display for PluginCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PluginCheckpoint::PreParse => "pre-parse",
            PluginCheckpoint::PreOperation => "pre-operation",
            PluginCheckpoint::PostOperation => "post-operation",
            PluginCheckpoint::PostResponse => "post-response",
        };
        write!(f, "{}", name)
    }
}

/// what the pipeline should do after a plugin returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginResult {
    /// go on with the next plugin and phase
    Continue,
    /// skip the remaining plugins and phases and send the result accumulated
    /// so far
    SendResponseImmediately,
    /// stop processing and have the connection closed
    TerminateConnection {
        /// the reason, logged and passed to the transport
        message: String,
    },
}

/// errors a plugin can report instead of a result
#[derive(Debug, Error)]
pub enum PluginError {
    /// a failure with a message
    #[error("{0}")]
    Failed(String),
    /// a failure of a collaborator the plugin called
    #[error("Directory error: {0}")]
    DirectoryError(#[from] DirectoryError),
    /// the plugin did not produce a result
    #[error("The plugin did not return a result")]
    MissingResult,
}

/// an extension called at pipeline checkpoints
///
/// plugins are called from many workers at once and do their own
/// synchronization
pub trait Plugin: std::fmt::Debug + Send + Sync {
    /// identifies the plugin in log messages and diagnostics
    fn id(&self) -> &str;

    /// the checkpoints the plugin wants to be called at
    fn checkpoints(&self) -> Vec<PluginCheckpoint>;

    /// the operation types the plugin wants to be called for
    fn operation_types(&self) -> Vec<OperationType> {
        OperationType::ALL.to_vec()
    }

    /// called before the request is resolved, may change raw fields
    fn pre_parse(&self, _operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
        Ok(PluginResult::Continue)
    }

    /// called before the backend is asked to do its part, may add
    /// modifications
    fn pre_operation(
        &self,
        _operation: &mut OperationRecord,
    ) -> Result<PluginResult, PluginError> {
        Ok(PluginResult::Continue)
    }

    /// called after the backend did its part
    fn post_operation(
        &self,
        _operation: &mut OperationRecord,
    ) -> Result<PluginResult, PluginError> {
        Ok(PluginResult::Continue)
    }

    /// called after the response was sent
    fn post_response(&self, _operation: &OperationRecord) -> Result<PluginResult, PluginError> {
        Ok(PluginResult::Continue)
    }
}

/// the combined outcome of all plugins of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginInvocation {
    /// every plugin returned continue or failed recoverably
    Continue,
    /// a plugin asked to send the response right away
    SendResponseImmediately {
        /// the plugin that asked
        plugin_id: String,
    },
    /// a plugin asked to close the connection or failed fatally
    TerminateConnection {
        /// the plugin responsible
        plugin_id: String,
        /// the reason
        message: String,
    },
}

/// plugins keyed by checkpoint and operation type
type PluginTable = HashMap<(PluginCheckpoint, OperationType), Vec<Arc<dyn Plugin>>>;

/// the registered plugins
///
/// lookups take a snapshot of the table so registration never blocks
/// running operations
#[derive(Debug, Default)]
pub struct PluginRegistry {
    /// the current table, replaced on every change
    table: RwLock<Arc<PluginTable>>,
}

impl PluginRegistry {
    /// an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register a plugin after all plugins registered before
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let mut updated = PluginTable::clone(&table);
        for checkpoint in plugin.checkpoints() {
            for operation_type in plugin.operation_types() {
                updated
                    .entry((checkpoint, operation_type))
                    .or_default()
                    .push(Arc::clone(&plugin));
            }
        }
        tracing::debug!("Registered plugin {}", plugin.id());
        *table = Arc::new(updated);
    }

    /// remove a plugin by id
    pub fn deregister(&self, id: &str) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let mut updated = PluginTable::clone(&table);
        for plugins in updated.values_mut() {
            plugins.retain(|p| p.id() != id);
        }
        updated.retain(|_, plugins| !plugins.is_empty());
        *table = Arc::new(updated);
    }

    /// the plugins for a checkpoint and operation type in registration order
    pub fn plugins(
        &self,
        checkpoint: PluginCheckpoint,
        operation_type: OperationType,
    ) -> Vec<Arc<dyn Plugin>> {
        let table = Arc::clone(&self.table.read().unwrap_or_else(|e| e.into_inner()));
        table
            .get(&(checkpoint, operation_type))
            .cloned()
            .unwrap_or_default()
    }

    /// call the pre-parse, pre-operation or post-operation plugins
    ///
    /// a failing plugin at pre-parse or pre-operation sets the server error
    /// result code and ends processing, at post-operation the failure is
    /// only logged
    pub fn invoke(
        &self,
        checkpoint: PluginCheckpoint,
        operation: &mut OperationRecord,
        server_error_result_code: ResultCode,
    ) -> PluginInvocation {
        for plugin in self.plugins(checkpoint, operation.operation_type()) {
            let result = catch_unwind(AssertUnwindSafe(|| match checkpoint {
                PluginCheckpoint::PreParse => plugin.pre_parse(operation),
                PluginCheckpoint::PreOperation => plugin.pre_operation(operation),
                PluginCheckpoint::PostOperation => plugin.post_operation(operation),
                PluginCheckpoint::PostResponse => plugin.post_response(operation),
            }));
            let result = match result {
                Ok(result) => result,
                Err(_) => Err(PluginError::Failed("the plugin panicked".to_string())),
            };
            match result {
                Ok(PluginResult::Continue) => {}
                Ok(PluginResult::SendResponseImmediately) => {
                    tracing::debug!(
                        "Plugin {} asked to send the response of operation {} on connection {} at {}",
                        plugin.id(),
                        operation.operation_id(),
                        operation.connection_id(),
                        checkpoint
                    );
                    return PluginInvocation::SendResponseImmediately {
                        plugin_id: plugin.id().to_string(),
                    };
                }
                Ok(PluginResult::TerminateConnection { message }) => {
                    return PluginInvocation::TerminateConnection {
                        plugin_id: plugin.id().to_string(),
                        message,
                    };
                }
                Err(e) => {
                    tracing::error!(
                        "Plugin {} failed at {} for operation {} on connection {}: {}",
                        plugin.id(),
                        checkpoint,
                        operation.operation_id(),
                        operation.connection_id(),
                        e
                    );
                    match checkpoint {
                        PluginCheckpoint::PreParse | PluginCheckpoint::PreOperation => {
                            let message = format!(
                                "The {} plugin {} failed: {}",
                                checkpoint,
                                plugin.id(),
                                e
                            );
                            operation.set_result_code(server_error_result_code);
                            operation.append_error_message(&message);
                            return PluginInvocation::TerminateConnection {
                                plugin_id: plugin.id().to_string(),
                                message,
                            };
                        }
                        PluginCheckpoint::PostOperation | PluginCheckpoint::PostResponse => {}
                    }
                }
            }
        }
        PluginInvocation::Continue
    }

    /// call the post-response plugins, failures and results other than
    /// continue are only logged
    pub fn invoke_post_response(&self, operation: &OperationRecord) {
        for plugin in self.plugins(PluginCheckpoint::PostResponse, operation.operation_type()) {
            let result = catch_unwind(AssertUnwindSafe(|| plugin.post_response(operation)));
            match result {
                Ok(Ok(PluginResult::Continue)) => {}
                Ok(Ok(other)) => {
                    tracing::debug!(
                        "Post-response plugin {} returned {:?} for operation {} on connection {}, stopping",
                        plugin.id(),
                        other,
                        operation.operation_id(),
                        operation.connection_id()
                    );
                    return;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        "Plugin {} failed at post-response for operation {} on connection {}: {}",
                        plugin.id(),
                        operation.operation_id(),
                        operation.connection_id(),
                        e
                    );
                }
                Err(_) => {
                    tracing::error!(
                        "Plugin {} panicked at post-response for operation {} on connection {}",
                        plugin.id(),
                        operation.operation_id(),
                        operation.connection_id()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::operation::OperationPayload;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Scripted {
        id: String,
        result: Option<PluginResult>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(id: &str, result: Option<PluginResult>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                result,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }

        fn run(&self) -> Result<PluginResult, PluginError> {
            *self.calls.lock().unwrap() += 1;
            self.result.clone().ok_or(PluginError::MissingResult)
        }
    }

    impl Plugin for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        fn checkpoints(&self) -> Vec<PluginCheckpoint> {
            vec![PluginCheckpoint::PreParse, PluginCheckpoint::PostOperation]
        }

        fn operation_types(&self) -> Vec<OperationType> {
            vec![OperationType::Delete]
        }

        fn pre_parse(&self, _operation: &mut OperationRecord) -> Result<PluginResult, PluginError> {
            self.run()
        }

        fn post_operation(
            &self,
            _operation: &mut OperationRecord,
        ) -> Result<PluginResult, PluginError> {
            self.run()
        }
    }

    #[derive(Debug)]
    struct Panicking;

    impl Plugin for Panicking {
        fn id(&self) -> &str {
            "panicking"
        }

        fn checkpoints(&self) -> Vec<PluginCheckpoint> {
            vec![PluginCheckpoint::PreOperation]
        }

        fn pre_operation(
            &self,
            _operation: &mut OperationRecord,
        ) -> Result<PluginResult, PluginError> {
            panic!("boom")
        }
    }

    fn delete() -> OperationRecord {
        OperationRecord::new(1, 1, 1, OperationPayload::delete("cn=a"))
    }

    #[test]
    fn runs_in_registration_order_and_stops_on_short_circuit() {
        let registry = PluginRegistry::new();
        let first = Scripted::new("first", Some(PluginResult::Continue));
        let second = Scripted::new("second", Some(PluginResult::SendResponseImmediately));
        let third = Scripted::new("third", Some(PluginResult::Continue));
        registry.register(first.clone());
        registry.register(second.clone());
        registry.register(third.clone());
        let mut op = delete();
        assert_eq!(
            registry.invoke(PluginCheckpoint::PreParse, &mut op, ResultCode::Other),
            PluginInvocation::SendResponseImmediately {
                plugin_id: "second".to_string()
            }
        );
        assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
        assert_eq!(op.result_code(), None);
    }

    #[test]
    fn only_matching_operation_types() {
        let registry = PluginRegistry::new();
        let plugin = Scripted::new("p", Some(PluginResult::Continue));
        registry.register(plugin.clone());
        let mut bind = OperationRecord::new(1, 1, 1, OperationPayload::simple_bind("", ""));
        registry.invoke(PluginCheckpoint::PreParse, &mut bind, ResultCode::Other);
        assert_eq!(plugin.calls(), 0);
    }

    #[test]
    fn missing_result_is_fatal_before_the_backend() {
        let registry = PluginRegistry::new();
        registry.register(Scripted::new("broken", None));
        let mut op = delete();
        let outcome = registry.invoke(PluginCheckpoint::PreParse, &mut op, ResultCode::Other);
        assert!(matches!(
            outcome,
            PluginInvocation::TerminateConnection { ref plugin_id, .. } if plugin_id == "broken"
        ));
        assert_eq!(op.result_code(), Some(ResultCode::Other));
        assert!(op.error_message().contains("broken"));
    }

    #[test]
    fn failures_after_the_backend_are_logged_only() {
        let registry = PluginRegistry::new();
        let broken = Scripted::new("broken", None);
        let after = Scripted::new("after", Some(PluginResult::Continue));
        registry.register(broken);
        registry.register(after.clone());
        let mut op = delete();
        assert_eq!(
            registry.invoke(PluginCheckpoint::PostOperation, &mut op, ResultCode::Other),
            PluginInvocation::Continue
        );
        assert_eq!(after.calls(), 1);
        assert_eq!(op.result_code(), None);
    }

    #[test]
    fn panics_are_caught() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(Panicking));
        let mut op = delete();
        let outcome = registry.invoke(PluginCheckpoint::PreOperation, &mut op, ResultCode::Other);
        assert!(matches!(outcome, PluginInvocation::TerminateConnection { .. }));
        assert_eq!(op.result_code(), Some(ResultCode::Other));
    }

    #[test]
    fn deregistration() {
        let registry = PluginRegistry::new();
        registry.register(Scripted::new("p", Some(PluginResult::Continue)));
        assert_eq!(registry.plugins(PluginCheckpoint::PreParse, OperationType::Delete).len(), 1);
        registry.deregister("p");
        assert!(registry.plugins(PluginCheckpoint::PreParse, OperationType::Delete).is_empty());
    }
}
