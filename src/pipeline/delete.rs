//! delete processing

use super::controls::{add_read_controls, process_controls};
use super::{
    check_access, check_cancel, check_writability, fail, fail_with, fetch_entry, perform_mutation,
    pre_operation_plugins, resolve_conflicts, resolved_field, route,
    synchronization_pre_operation, with_locks, OperationStrategy, Phase,
};
use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::context::ServerContext;
use crate::dn::Dn;
use crate::lock::LockMode;
use crate::notification::Change;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use std::ops::ControlFlow;

/// removes a leaf entry
#[derive(Debug)]
pub(crate) struct DeleteStrategy;

impl OperationStrategy for DeleteStrategy {
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let resolved = operation
            .delete_mut()
            .map(|p| p.entry_dn.resolve().cloned());
        let dn = resolved_field(context, operation, "entry DN", resolved)?;
        let backend = route(context, operation, &dn)?;
        check_cancel(operation)?;
        with_locks(
            context,
            operation,
            &[(dn.clone(), LockMode::Write)],
            |operation| delete_locked(context, operation, connection, backend.as_ref(), &dn),
        )
    }

    fn notify(&self, context: &ServerContext, operation: &OperationRecord) {
        if let Some(entry) = operation.delete().and_then(|p| p.entry_to_delete.as_ref()) {
            context
                .notifications()
                .notify(operation, Change::Delete { entry });
        }
    }
}

/// everything done while the entry is write locked
fn delete_locked(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    backend: &dyn Backend,
    dn: &Dn,
) -> Phase {
    check_cancel(operation)?;
    let entry = fetch_entry(context, backend, operation, dn)?;
    if let Some(payload) = operation.delete_mut() {
        payload.entry_to_delete = Some(entry.clone());
    }
    resolve_conflicts(context, operation)?;
    let requested = process_controls(context, operation, connection, Some(backend), Some(&entry))?;
    check_access(
        context,
        operation,
        ResultCode::InsufficientAccessRights,
        format!("You do not have sufficient privileges to delete entry {}", dn),
    )?;
    check_leaf(context, operation, backend, dn)?;
    pre_operation_plugins(context, operation)?;
    check_writability(context, operation, backend, dn)?;
    synchronization_pre_operation(context, operation)?;
    check_cancel(operation)?;
    perform_mutation(operation, |operation| backend.delete_entry(dn, operation))?;
    add_read_controls(context, operation, &requested, Some(&entry), None);
    ControlFlow::Continue(())
}

/// reject the delete if the entry has children, in its own backend or as
/// the base of a subordinate backend
fn check_leaf(
    context: &ServerContext,
    operation: &mut OperationRecord,
    backend: &dyn Backend,
    dn: &Dn,
) -> Phase {
    match backend.has_subordinates(dn) {
        Ok(false) => {}
        Ok(true) => {
            return fail(
                operation,
                ResultCode::NotAllowedOnNonleaf,
                format!("Entry {} cannot be removed because it has subordinate entries", dn),
            );
        }
        Err(e) => return fail_with(operation, &e),
    }
    let below = context
        .backends()
        .subordinate_backends(backend)
        .into_iter()
        .find(|subordinate| subordinate.base_dns().iter().any(|base| base.is_descendant_of(dn)));
    if let Some(subordinate) = below {
        return fail(
            operation,
            ResultCode::NotAllowedOnNonleaf,
            format!(
                "Entry {} cannot be removed because the backend {} holds entries below it",
                dn,
                subordinate.id()
            ),
        );
    }
    ControlFlow::Continue(())
}
