//! the operation execution pipeline
//!
//! every operation passes the same sequence of phases: pre-parse plugins,
//! the operation specific processing (resolve, route, lock, fetch, conflict
//! resolution, access control, controls, pre-operation plugins, writability,
//! backend, read controls, unlock), post-operation plugins, the response,
//! change notifications and post-response plugins. The operation specific
//! part is provided by an [OperationStrategy] per operation kind.
//!
//! phases report through [Phase]; breaking out of the sequence carries an
//! [Exit] saying how processing ends.

mod add;
mod bind;
mod compare;
mod controls;
mod delete;
mod modify;
mod modify_dn;
mod search;

use crate::access_log;
use crate::backend::Backend;
use crate::connection::{ClientConnection, DisconnectReason};
use crate::context::ServerContext;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::lock::{EntryLock, LockMode};
use crate::operation::{OperationRecord, OperationType};
use crate::plugin::{PluginCheckpoint, PluginInvocation};
use crate::result_code::ResultCode;
use crate::synchronization::SynchronizationProviderResult;
use ldap_types::basic::ChumskyError;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::instrument;

/// how processing of an operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// the response with this result code was sent
    Completed(ResultCode),
    /// the operation was canceled, a response was only sent if the cancel
    /// request asked for it
    Canceled,
    /// the connection has to be closed, no normal response was sent
    Disconnected {
        /// the reason
        message: String,
    },
}

/// how the phase sequence is left early
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Exit {
    /// go straight to sending the response
    Respond {
        /// whether the post-operation plugins are skipped
        skip_post_operation: bool,
    },
    /// a cancel request was honoured
    Canceled,
    /// processing stops and the connection is closed
    Disconnect {
        /// the reason
        message: String,
    },
}

/// the result of a phase, `Break` leaves the phase sequence
pub(crate) type Phase<T = ()> = ControlFlow<Exit, T>;

/// the operation specific part of the pipeline
pub(crate) trait OperationStrategy {
    /// runs before the pre-parse plugins
    fn prepare(
        &self,
        _context: &ServerContext,
        _operation: &mut OperationRecord,
        _connection: &dyn ClientConnection,
    ) {
    }

    /// everything between the pre-parse and the post-operation plugins
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase;

    /// runs right before the response is sent
    fn before_response(
        &self,
        _context: &ServerContext,
        _operation: &mut OperationRecord,
        _connection: &dyn ClientConnection,
    ) {
    }

    /// tell listeners about a successful change
    fn notify(&self, _context: &ServerContext, _operation: &OperationRecord) {}

    /// runs on every exit path once processing ended
    fn finish(
        &self,
        _context: &ServerContext,
        _operation: &mut OperationRecord,
        _connection: &dyn ClientConnection,
    ) {
    }
}

/// executes operation records against a server context
#[derive(Debug, Clone)]
pub struct OperationPipeline {
    /// the collaborators
    context: Arc<ServerContext>,
}

impl OperationPipeline {
    /// create a pipeline
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    /// the collaborators
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// run an operation to completion on the current thread
    ///
    /// the result and response controls are left in the operation record,
    /// the response itself goes through the connection
    #[instrument(
        skip_all,
        fields(
            conn = operation.connection_id(),
            op = operation.operation_id(),
            kind = %operation.operation_type()
        )
    )]
    pub fn execute(
        &self,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> ExecutionOutcome {
        let strategy = strategy_for(operation.operation_type());
        let context = self.context.as_ref();
        operation.start_timer();
        operation.set_client_authorization_dn(connection.authentication_info().authorization_dn);
        strategy.prepare(context, operation, connection);
        let exit = match self.run_phases(strategy, operation, connection) {
            ControlFlow::Continue(()) => Exit::Respond {
                skip_post_operation: false,
            },
            ControlFlow::Break(exit) => exit,
        };
        let outcome = match exit {
            Exit::Respond {
                skip_post_operation,
            } => self.respond(strategy, operation, connection, skip_post_operation),
            Exit::Canceled => self.canceled(operation, connection),
            Exit::Disconnect { message } => self.disconnect(operation, connection, message),
        };
        strategy.finish(context, operation, connection);
        outcome
    }

    /// pre-parse plugins and the operation specific phases
    fn run_phases(
        &self,
        strategy: &dyn OperationStrategy,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let context = self.context.as_ref();
        let invocation = context.plugins().invoke(
            PluginCheckpoint::PreParse,
            operation,
            context.config().server_error_result_code,
        );
        match invocation {
            PluginInvocation::Continue => access_log::log_request(operation),
            PluginInvocation::SendResponseImmediately { .. } => {
                access_log::log_request(operation);
                return ControlFlow::Break(Exit::Respond {
                    skip_post_operation: true,
                });
            }
            PluginInvocation::TerminateConnection { message, .. } => {
                access_log::log_request(operation);
                return ControlFlow::Break(Exit::Disconnect { message });
            }
        }
        check_cancel(operation)?;
        strategy.process(context, operation, connection)
    }

    /// post-operation plugins, response, notifications and post-response
    /// plugins
    fn respond(
        &self,
        strategy: &dyn OperationStrategy,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
        skip_post_operation: bool,
    ) -> ExecutionOutcome {
        let context = self.context.as_ref();
        operation.cancel_state().mark_too_late();
        if !skip_post_operation && !operation.is_synchronization() {
            let invocation = context.plugins().invoke(
                PluginCheckpoint::PostOperation,
                operation,
                context.config().server_error_result_code,
            );
            if let PluginInvocation::TerminateConnection { message, .. } = invocation {
                return self.disconnect(operation, connection, message);
            }
        }
        if operation.result_code().is_none() {
            operation.set_result_code(context.config().server_error_result_code);
            operation.append_error_message("Processing ended without a result");
        }
        strategy.before_response(context, operation, connection);
        operation.stop_timer();
        connection.send_response(operation);
        access_log::log_response(operation);
        let result_code = operation
            .result_code()
            .unwrap_or(context.config().server_error_result_code);
        if result_code == ResultCode::Success {
            strategy.notify(context, operation);
        }
        context.plugins().invoke_post_response(operation);
        ExecutionOutcome::Completed(result_code)
    }

    /// finish an operation that honoured a cancel request
    fn canceled(
        &self,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> ExecutionOutcome {
        let request = operation.cancel_state().cancel_request();
        operation.set_result_code(ResultCode::Canceled);
        if let Some(request) = &request {
            operation.append_error_message(&request.reason);
        }
        operation.stop_timer();
        access_log::log_canceled(operation);
        if request.is_some_and(|r| r.notify_original_requester) {
            connection.send_response(operation);
        }
        ExecutionOutcome::Canceled
    }

    /// end processing and have the connection closed
    fn disconnect(
        &self,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
        message: String,
    ) -> ExecutionOutcome {
        operation.set_result_code(ResultCode::Canceled);
        operation.stop_timer();
        access_log::log_response(operation);
        access_log::log_disconnect(operation, &message);
        connection.disconnect(DisconnectReason::PluginTerminated, true, &message);
        ExecutionOutcome::Disconnected { message }
    }
}

/// the strategy for an operation type
fn strategy_for(operation_type: OperationType) -> &'static dyn OperationStrategy {
    match operation_type {
        OperationType::Bind => &bind::BindStrategy,
        OperationType::Delete => &delete::DeleteStrategy,
        OperationType::ModifyDn => &modify_dn::ModifyDnStrategy,
        OperationType::Add => &add::AddStrategy,
        OperationType::Modify => &modify::ModifyStrategy,
        OperationType::Compare => &compare::CompareStrategy,
        OperationType::Search => &search::SearchStrategy,
    }
}

/// set a terminal result and go to the response
pub(crate) fn fail<T>(
    operation: &mut OperationRecord,
    result_code: ResultCode,
    message: impl AsRef<str>,
) -> Phase<T> {
    operation.set_result_code(result_code);
    operation.append_error_message(message);
    ControlFlow::Break(Exit::Respond {
        skip_post_operation: false,
    })
}

/// copy a collaborator error into the result and go to the response
pub(crate) fn fail_with<T>(operation: &mut OperationRecord, error: &DirectoryError) -> Phase<T> {
    operation.set_response_data(error);
    ControlFlow::Break(Exit::Respond {
        skip_post_operation: false,
    })
}

/// fail because a DN in the request is malformed
pub(crate) fn invalid_dn<T>(
    operation: &mut OperationRecord,
    what: &str,
    error: &ChumskyError,
) -> Phase<T> {
    fail(
        operation,
        ResultCode::InvalidDnSyntax,
        format!("Unable to decode the {}: {}", what, error),
    )
}

/// the payload does not belong to the operation type of the strategy
pub(crate) fn payload_mismatch<T>(
    context: &ServerContext,
    operation: &mut OperationRecord,
) -> Phase<T> {
    tracing::error!(
        "Operation {} on connection {} carries a payload that does not match its strategy",
        operation.operation_id(),
        operation.connection_id()
    );
    fail(
        operation,
        context.config().server_error_result_code,
        "Internal error processing the request",
    )
}

/// the outcome of resolving a request field, `None` if the payload did not
/// match
pub(crate) fn resolved_field<T>(
    context: &ServerContext,
    operation: &mut OperationRecord,
    what: &str,
    resolved: Option<Result<T, ChumskyError>>,
) -> Phase<T> {
    match resolved {
        Some(Ok(value)) => ControlFlow::Continue(value),
        Some(Err(e)) => invalid_dn(operation, what, &e),
        None => payload_mismatch(context, operation),
    }
}

/// poll point for cancel requests
pub(crate) fn check_cancel(operation: &OperationRecord) -> Phase {
    if operation.check_for_cancellation() {
        tracing::debug!(
            "Operation {} on connection {} was canceled",
            operation.operation_id(),
            operation.connection_id()
        );
        return ControlFlow::Break(Exit::Canceled);
    }
    ControlFlow::Continue(())
}

/// the backend holding a DN
pub(crate) fn route(
    context: &ServerContext,
    operation: &mut OperationRecord,
    dn: &Dn,
) -> Phase<Arc<dyn Backend>> {
    match context.backends().backend_for(dn) {
        Some(backend) => ControlFlow::Continue(backend),
        None => {
            operation.set_matched_dn(context.backends().matched_dn(dn));
            fail(
                operation,
                ResultCode::NoSuchObject,
                format!("The entry {} does not belong to any backend", dn),
            )
        }
    }
}

/// take entry locks in DN order
pub(crate) fn lock_entries<'a>(
    context: &'a ServerContext,
    operation: &mut OperationRecord,
    requests: &[(Dn, LockMode)],
) -> Phase<Vec<EntryLock<'a>>> {
    check_cancel(operation)?;
    let Some(locks) = context.lock_manager().acquire_all(requests) else {
        let dns = itertools::join(requests.iter().map(|(dn, _)| dn), ", ");
        return fail(
            operation,
            context.config().server_error_result_code,
            format!("Unable to acquire a lock on {} after repeated attempts", dns),
        );
    };
    if operation.check_for_cancellation() {
        drop(locks);
        return ControlFlow::Break(Exit::Canceled);
    }
    ControlFlow::Continue(locks)
}

/// fetch an entry, failing with NO_SUCH_OBJECT and the matched DN if it is
/// missing
pub(crate) fn fetch_entry(
    context: &ServerContext,
    backend: &dyn Backend,
    operation: &mut OperationRecord,
    dn: &Dn,
) -> Phase<Entry> {
    match backend.get_entry(dn) {
        Ok(Some(entry)) => ControlFlow::Continue(entry),
        Ok(None) => {
            operation.set_matched_dn(context.backends().matched_dn(dn));
            fail_with(operation, &DirectoryError::no_such_object(dn))
        }
        Err(e) => fail_with(operation, &e),
    }
}

/// turn a synchronization provider answer into a phase result
fn synchronization_result(
    operation: &mut OperationRecord,
    provider_id: &str,
    result: Result<SynchronizationProviderResult, DirectoryError>,
) -> Phase {
    match result {
        Ok(SynchronizationProviderResult::Continue) => ControlFlow::Continue(()),
        Ok(SynchronizationProviderResult::StopProcessing {
            result_code,
            message,
        }) => {
            tracing::debug!(
                "Synchronization provider {} stopped operation {} on connection {}",
                provider_id,
                operation.operation_id(),
                operation.connection_id()
            );
            fail(operation, result_code, message)
        }
        Err(e) => {
            tracing::error!(
                "Synchronization provider {} failed for operation {} on connection {}: {}",
                provider_id,
                operation.operation_id(),
                operation.connection_id(),
                e
            );
            fail_with(operation, &e)
        }
    }
}

/// offer the fetched state to the synchronization providers
pub(crate) fn resolve_conflicts(context: &ServerContext, operation: &mut OperationRecord) -> Phase {
    for provider in context.synchronization_providers() {
        let result = provider.handle_conflict_resolution(operation);
        synchronization_result(operation, provider.id(), result)?;
    }
    ControlFlow::Continue(())
}

/// the synchronization providers' pre-operation hook
pub(crate) fn synchronization_pre_operation(
    context: &ServerContext,
    operation: &mut OperationRecord,
) -> Phase {
    for provider in context.synchronization_providers() {
        let result = provider.do_pre_operation(operation);
        synchronization_result(operation, provider.id(), result)?;
    }
    ControlFlow::Continue(())
}

/// the synchronization providers' post-operation hook, failures are logged
pub(crate) fn synchronization_post_operation(
    context: &ServerContext,
    operation: &mut OperationRecord,
) {
    for provider in context.synchronization_providers() {
        if let Err(e) = provider.do_post_operation(operation) {
            tracing::error!(
                "Synchronization provider {} failed after operation {} on connection {}: {}",
                provider.id(),
                operation.operation_id(),
                operation.connection_id(),
                e
            );
        }
    }
}

/// the access control decision gate
pub(crate) fn check_access(
    context: &ServerContext,
    operation: &mut OperationRecord,
    denied: ResultCode,
    message: impl AsRef<str>,
) -> Phase {
    if operation.is_internal() || context.access_control().is_allowed(operation) {
        return ControlFlow::Continue(());
    }
    operation.set_result_code(denied);
    operation.append_error_message(message);
    ControlFlow::Break(Exit::Respond {
        skip_post_operation: true,
    })
}

/// the pre-operation plugins, skipped for replicated changes
pub(crate) fn pre_operation_plugins(
    context: &ServerContext,
    operation: &mut OperationRecord,
) -> Phase {
    if operation.is_synchronization() {
        return ControlFlow::Continue(());
    }
    match context.plugins().invoke(
        PluginCheckpoint::PreOperation,
        operation,
        context.config().server_error_result_code,
    ) {
        PluginInvocation::Continue => ControlFlow::Continue(()),
        PluginInvocation::SendResponseImmediately { .. } => ControlFlow::Break(Exit::Respond {
            skip_post_operation: true,
        }),
        PluginInvocation::TerminateConnection { message, .. } => {
            ControlFlow::Break(Exit::Disconnect { message })
        }
    }
}

/// reject writes the server or the backend does not accept
pub(crate) fn check_writability(
    context: &ServerContext,
    operation: &mut OperationRecord,
    backend: &dyn Backend,
    target: &Dn,
) -> Phase {
    let internal = operation.is_internal();
    let synchronization = operation.is_synchronization();
    if !context
        .config()
        .writability_mode
        .allows(internal, synchronization)
    {
        return fail(
            operation,
            ResultCode::UnwillingToPerform,
            format!("Unable to change {} because the server is read-only", target),
        );
    }
    if !backend.writability_mode().allows(internal, synchronization) {
        return fail(
            operation,
            ResultCode::UnwillingToPerform,
            format!(
                "Unable to change {} because the backend {} is read-only",
                target,
                backend.id()
            ),
        );
    }
    ControlFlow::Continue(())
}

/// validate an entry against the schema if schema checking is enabled
///
/// `forced` replaces the result code of a violation
pub(crate) fn check_schema(
    context: &ServerContext,
    operation: &mut OperationRecord,
    entry: &Entry,
    forced: Option<ResultCode>,
) -> Phase {
    if !context.config().check_schema || operation.is_synchronization() {
        return ControlFlow::Continue(());
    }
    match context.schema().validate_entry(entry) {
        Ok(()) => ControlFlow::Continue(()),
        Err(mut e) => {
            if let Some(code) = forced {
                e.result_code = code;
            }
            fail_with(operation, &e)
        }
    }
}

/// reject changes to attributes clients may not modify
pub(crate) fn check_user_modifiable(
    context: &ServerContext,
    operation: &mut OperationRecord,
    attributes: &[&str],
) -> Phase {
    if operation.is_internal() || operation.is_synchronization() {
        return ControlFlow::Continue(());
    }
    for attribute in attributes {
        if context.schema().is_no_user_modification(attribute) {
            return fail(
                operation,
                ResultCode::ConstraintViolation,
                format!("The attribute {} is not user modifiable", attribute),
            );
        }
        if context.schema().is_obsolete(attribute) {
            return fail(
                operation,
                ResultCode::ConstraintViolation,
                format!("The attribute {} is obsolete", attribute),
            );
        }
    }
    ControlFlow::Continue(())
}

/// past the point of no return: hand the change to the backend unless the
/// no-op control was present
pub(crate) fn perform_mutation(
    operation: &mut OperationRecord,
    mutation: impl FnOnce(&OperationRecord) -> Result<(), DirectoryError>,
) -> Phase {
    operation.cancel_state().mark_too_late();
    if operation.is_no_op() {
        operation.set_result_code(ResultCode::NoOperation);
        operation.append_error_message(
            "The operation was not performed because the no-op control was present",
        );
        return ControlFlow::Continue(());
    }
    match mutation(operation) {
        Ok(()) => {
            operation.set_result_code(ResultCode::Success);
            ControlFlow::Continue(())
        }
        Err(e) => fail_with(operation, &e),
    }
}

/// run the phases that need the entry locks, release the locks and call
/// the synchronization providers' post-operation hook on every path
pub(crate) fn with_locks<'a>(
    context: &'a ServerContext,
    operation: &mut OperationRecord,
    requests: &[(Dn, LockMode)],
    locked: impl FnOnce(&mut OperationRecord) -> Phase,
) -> Phase {
    let locks = lock_entries(context, operation, requests)?;
    let flow = locked(operation);
    drop(locks);
    synchronization_post_operation(context, operation);
    flow
}
