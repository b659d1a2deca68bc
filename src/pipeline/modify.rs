//! modify processing

use super::controls::{add_read_controls, process_controls};
use super::{
    check_access, check_cancel, check_schema, check_user_modifiable, check_writability,
    fail_with, fetch_entry, payload_mismatch, perform_mutation, pre_operation_plugins,
    resolve_conflicts, resolved_field, route, synchronization_pre_operation, with_locks,
    OperationStrategy, Phase,
};
use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::context::ServerContext;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::lock::LockMode;
use crate::modification::{apply_modifications, modification_attribute, ApplyMode};
use crate::notification::Change;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use std::ops::ControlFlow;

/// changes the attributes of an entry
#[derive(Debug)]
pub(crate) struct ModifyStrategy;

impl OperationStrategy for ModifyStrategy {
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let resolved = operation
            .modify_mut()
            .map(|p| p.entry_dn.resolve().cloned());
        let dn = resolved_field(context, operation, "entry DN", resolved)?;
        let backend = route(context, operation, &dn)?;
        check_cancel(operation)?;
        with_locks(
            context,
            operation,
            &[(dn.clone(), LockMode::Write)],
            |operation| modify_locked(context, operation, connection, backend.as_ref(), &dn),
        )
    }

    fn notify(&self, context: &ServerContext, operation: &OperationRecord) {
        let Some(payload) = operation.modify() else {
            return;
        };
        if let (Some(old_entry), Some(new_entry)) =
            (&payload.current_entry, &payload.modified_entry)
        {
            context.notifications().notify(
                operation,
                Change::Modify {
                    old_entry,
                    new_entry,
                },
            );
        }
    }
}

/// everything done while the entry is write locked
fn modify_locked(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    backend: &dyn Backend,
    dn: &Dn,
) -> Phase {
    check_cancel(operation)?;
    let current = fetch_entry(context, backend, operation, dn)?;
    let Some(payload) = operation.modify_mut() else {
        return payload_mismatch(context, operation);
    };
    payload.current_entry = Some(current.clone());
    let requested_modifications = payload.modifications.clone();
    resolve_conflicts(context, operation)?;
    let requested =
        process_controls(context, operation, connection, Some(backend), Some(&current))?;
    check_access(
        context,
        operation,
        ResultCode::InsufficientAccessRights,
        format!("You do not have sufficient privileges to modify entry {}", dn),
    )?;
    let attributes: Vec<&str> = requested_modifications
        .iter()
        .map(modification_attribute)
        .collect();
    check_user_modifiable(context, operation, &attributes)?;

    let mut modified = current.clone();
    if let Err(e) = apply_modifications(&mut modified, &requested_modifications, ApplyMode::Strict)
    {
        return fail_with(operation, &e);
    }
    check_schema(context, operation, &modified, None)?;
    if let Some(payload) = operation.modify_mut() {
        payload.modified_entry = Some(modified.clone());
    }

    pre_operation_plugins(context, operation)?;
    let modified = apply_plugin_modifications(
        context,
        operation,
        modified,
        requested_modifications.len(),
    )?;

    check_writability(context, operation, backend, dn)?;
    synchronization_pre_operation(context, operation)?;
    check_cancel(operation)?;
    perform_mutation(operation, |operation| {
        backend.replace_entry(&current, modified.clone(), operation)
    })?;
    add_read_controls(
        context,
        operation,
        &requested,
        Some(&current),
        Some(&modified),
    );
    ControlFlow::Continue(())
}

/// apply the modifications pre-operation plugins appended
fn apply_plugin_modifications(
    context: &ServerContext,
    operation: &mut OperationRecord,
    mut modified: Entry,
    requested: usize,
) -> Phase<Entry> {
    let appended = operation
        .modify()
        .and_then(|p| p.modifications.get(requested..))
        .map(<[_]>::to_vec)
        .unwrap_or_default();
    if appended.is_empty() {
        return ControlFlow::Continue(modified);
    }
    if let Err(e) = apply_modifications(&mut modified, &appended, ApplyMode::Lenient) {
        return fail_with(operation, &e);
    }
    check_schema(context, operation, &modified, None)?;
    if let Some(payload) = operation.modify_mut() {
        payload.modified_entry = Some(modified.clone());
    }
    ControlFlow::Continue(modified)
}
