//! add processing

use super::controls::{add_read_controls, process_controls};
use super::{
    check_access, check_cancel, check_schema, check_user_modifiable, check_writability, fail,
    fail_with, payload_mismatch, perform_mutation, pre_operation_plugins, resolve_conflicts,
    resolved_field, route, synchronization_pre_operation, with_locks, OperationStrategy, Phase,
};
use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::context::ServerContext;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::lock::LockMode;
use crate::notification::Change;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use std::ops::ControlFlow;

/// creates an entry
#[derive(Debug)]
pub(crate) struct AddStrategy;

impl OperationStrategy for AddStrategy {
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let resolved = operation.add_mut().map(|p| p.entry_dn.resolve().cloned());
        let dn = resolved_field(context, operation, "entry DN", resolved)?;
        let entry = build_entry(context, operation, &dn)?;
        let backend = route(context, operation, &dn)?;
        check_cancel(operation)?;
        with_locks(
            context,
            operation,
            &[(dn.clone(), LockMode::Write)],
            |operation| add_locked(context, operation, connection, backend.as_ref(), entry),
        )
    }

    fn notify(&self, context: &ServerContext, operation: &OperationRecord) {
        if let Some(entry) = operation.add().and_then(|p| p.entry.as_ref()) {
            context
                .notifications()
                .notify(operation, Change::Add { entry });
        }
    }
}

/// the entry described by the request, RDN values are added if the
/// attributes lack them
fn build_entry(context: &ServerContext, operation: &mut OperationRecord, dn: &Dn) -> Phase<Entry> {
    let Some(payload) = operation.add_mut() else {
        return payload_mismatch(context, operation);
    };
    let mut entry = Entry::new(dn.clone());
    let mut names: Vec<&String> = payload.attributes.keys().collect();
    names.sort();
    for name in names {
        for value in &payload.attributes[name] {
            entry.add_value(name, value.clone());
        }
    }
    if let Some(rdn) = dn.rdn() {
        for ava in rdn.avas() {
            entry.add_value(ava.attribute_type(), ava.value().to_string());
        }
    }
    payload.entry = Some(entry.clone());
    ControlFlow::Continue(entry)
}

/// everything done while the new DN is write locked
fn add_locked(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    backend: &dyn Backend,
    entry: Entry,
) -> Phase {
    check_cancel(operation)?;
    check_placement(context, operation, backend, entry.dn())?;
    resolve_conflicts(context, operation)?;
    let requested = process_controls(context, operation, connection, Some(backend), None)?;
    check_access(
        context,
        operation,
        ResultCode::InsufficientAccessRights,
        format!("You do not have sufficient privileges to add entry {}", entry.dn()),
    )?;
    let attributes: Vec<&str> = entry.attributes().keys().map(String::as_str).collect();
    check_user_modifiable(context, operation, &attributes)?;
    check_schema(context, operation, &entry, None)?;
    pre_operation_plugins(context, operation)?;
    let entry = operation
        .add()
        .and_then(|p| p.entry.clone())
        .unwrap_or(entry);
    check_writability(context, operation, backend, entry.dn())?;
    synchronization_pre_operation(context, operation)?;
    check_cancel(operation)?;
    perform_mutation(operation, |operation| {
        backend.add_entry(entry.clone(), operation)
    })?;
    add_read_controls(context, operation, &requested, None, Some(&entry));
    ControlFlow::Continue(())
}

/// the entry must not exist yet and its parent must
fn check_placement(
    context: &ServerContext,
    operation: &mut OperationRecord,
    backend: &dyn Backend,
    dn: &Dn,
) -> Phase {
    match backend.entry_exists(dn) {
        Ok(false) => {}
        Ok(true) => {
            return fail(
                operation,
                ResultCode::EntryAlreadyExists,
                format!("The entry {} already exists", dn),
            );
        }
        Err(e) => return fail_with(operation, &e),
    }
    if backend.base_dns().contains(dn) {
        return ControlFlow::Continue(());
    }
    let Some(parent) = dn.parent() else {
        return ControlFlow::Continue(());
    };
    match backend.entry_exists(&parent) {
        Ok(true) => ControlFlow::Continue(()),
        Ok(false) => {
            operation.set_matched_dn(context.backends().matched_dn(&parent));
            fail(
                operation,
                ResultCode::NoSuchObject,
                format!(
                    "The entry {} cannot be added because its parent {} does not exist",
                    dn, parent
                ),
            )
        }
        Err(e) => fail_with(operation, &e),
    }
}
