//! modify DN processing, renames and moves an entry together with its
//! subtree

use super::controls::{add_read_controls, process_controls};
use super::{
    check_access, check_cancel, check_schema, check_writability, fail, fail_with, fetch_entry,
    payload_mismatch, perform_mutation, pre_operation_plugins, resolve_conflicts, resolved_field,
    route, synchronization_pre_operation, with_locks, OperationStrategy, Phase,
};
use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::context::ServerContext;
use crate::dn::{Dn, Rdn};
use crate::entry::Entry;
use crate::lock::LockMode;
use crate::modification::{apply_modifications, ApplyMode};
use crate::notification::Change;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use ldap3::Mod;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

/// renames an entry within one backend
#[derive(Debug)]
pub(crate) struct ModifyDnStrategy;

/// the resolved request fields
struct Rename {
    /// the current DN
    dn: Dn,
    /// the new RDN
    new_rdn: Rdn,
    /// the DN after the rename
    new_dn: Dn,
    /// whether the old RDN values are removed
    delete_old_rdn: bool,
}

impl OperationStrategy for ModifyDnStrategy {
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let rename = resolve(context, operation)?;
        let backend = route_rename(context, operation, &rename)?;
        check_cancel(operation)?;
        let locks = [
            (rename.dn.clone(), LockMode::Write),
            (rename.new_dn.clone(), LockMode::Write),
        ];
        with_locks(context, operation, &locks, |operation| {
            rename_locked(context, operation, connection, backend.as_ref(), &rename)
        })
    }

    fn notify(&self, context: &ServerContext, operation: &OperationRecord) {
        let Some(payload) = operation.modify_dn() else {
            return;
        };
        if let (Some(old_entry), Some(new_entry)) =
            (&payload.original_entry, &payload.updated_entry)
        {
            context.notifications().notify(
                operation,
                Change::ModifyDn {
                    old_entry,
                    new_entry,
                },
            );
        }
    }
}

/// decode the entry DN, the new RDN and the new superior
fn resolve(context: &ServerContext, operation: &mut OperationRecord) -> Phase<Rename> {
    let resolved = operation
        .modify_dn_mut()
        .map(|p| p.entry_dn.resolve().cloned());
    let dn = resolved_field(context, operation, "entry DN", resolved)?;
    let resolved = operation
        .modify_dn_mut()
        .map(|p| p.new_rdn.resolve().cloned());
    let new_rdn = resolved_field(context, operation, "new RDN", resolved)?;
    let resolved = operation.modify_dn_mut().map(|p| match p.new_superior.as_mut() {
        Some(superior) => superior.resolve().cloned().map(Some),
        None => Ok(None),
    });
    let new_superior = resolved_field(context, operation, "new superior DN", resolved)?;
    let Some(payload) = operation.modify_dn() else {
        return payload_mismatch(context, operation);
    };
    let delete_old_rdn = payload.delete_old_rdn;
    let parent = match new_superior {
        Some(superior) => superior,
        None => dn.parent().unwrap_or_default(),
    };
    let new_dn = parent.child(new_rdn.clone());
    ControlFlow::Continue(Rename {
        dn,
        new_rdn,
        new_dn,
        delete_old_rdn,
    })
}

/// find the backend and make sure the rename stays inside of it
fn route_rename(
    context: &ServerContext,
    operation: &mut OperationRecord,
    rename: &Rename,
) -> Phase<Arc<dyn Backend>> {
    let backend = route(context, operation, &rename.dn)?;
    if backend.base_dns().contains(&rename.dn) {
        return fail(
            operation,
            ResultCode::UnwillingToPerform,
            format!(
                "Entry {} cannot be renamed because it is the base DN of backend {}",
                rename.dn,
                backend.id()
            ),
        );
    }
    if rename.new_dn.is_strict_descendant_of(&rename.dn) {
        return fail(
            operation,
            ResultCode::UnwillingToPerform,
            format!(
                "Entry {} cannot be moved below itself to {}",
                rename.dn, rename.new_dn
            ),
        );
    }
    match context.backends().backend_for(&rename.new_dn) {
        Some(target) if target.id() == backend.id() => ControlFlow::Continue(backend),
        Some(target) => fail(
            operation,
            ResultCode::UnwillingToPerform,
            format!(
                "Entry {} cannot be moved from backend {} to backend {}",
                rename.dn,
                backend.id(),
                target.id()
            ),
        ),
        None => {
            operation.set_matched_dn(context.backends().matched_dn(&rename.new_dn));
            fail(
                operation,
                ResultCode::NoSuchObject,
                format!("The new DN {} does not belong to any backend", rename.new_dn),
            )
        }
    }
}

/// everything done while both DNs are write locked
fn rename_locked(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    backend: &dyn Backend,
    rename: &Rename,
) -> Phase {
    check_cancel(operation)?;
    let original = fetch_entry(context, backend, operation, &rename.dn)?;
    check_target(context, operation, backend, rename)?;
    if let Some(payload) = operation.modify_dn_mut() {
        payload.original_entry = Some(original.clone());
    }
    resolve_conflicts(context, operation)?;
    let requested =
        process_controls(context, operation, connection, Some(backend), Some(&original))?;
    check_access(
        context,
        operation,
        ResultCode::InsufficientAccessRights,
        format!("You do not have sufficient privileges to rename entry {}", rename.dn),
    )?;

    let modifications = rdn_modifications(&original, rename);
    let mut updated = original.clone();
    updated.set_dn(rename.new_dn.clone());
    if let Err(e) = apply_modifications(&mut updated, &modifications, ApplyMode::Lenient) {
        return fail_with(operation, &e);
    }
    check_rdn_attributes(context, operation, &rename.new_rdn)?;
    check_schema(
        context,
        operation,
        &updated,
        Some(ResultCode::ObjectclassViolation),
    )?;
    let generated = modifications.len();
    if let Some(payload) = operation.modify_dn_mut() {
        payload.modifications = modifications;
        payload.updated_entry = Some(updated);
    }

    pre_operation_plugins(context, operation)?;
    let updated = apply_plugin_modifications(context, operation, generated)?;

    check_writability(context, operation, backend, &rename.dn)?;
    synchronization_pre_operation(context, operation)?;
    check_cancel(operation)?;
    perform_mutation(operation, |operation| {
        backend.rename_entry(&rename.dn, updated.clone(), operation)
    })?;
    add_read_controls(
        context,
        operation,
        &requested,
        Some(&original),
        Some(&updated),
    );
    ControlFlow::Continue(())
}

/// the new DN must be free and its parent must exist
fn check_target(
    context: &ServerContext,
    operation: &mut OperationRecord,
    backend: &dyn Backend,
    rename: &Rename,
) -> Phase {
    if rename.new_dn != rename.dn {
        match backend.entry_exists(&rename.new_dn) {
            Ok(false) => {}
            Ok(true) => {
                return fail(
                    operation,
                    ResultCode::EntryAlreadyExists,
                    format!(
                        "Entry {} cannot be renamed because {} already exists",
                        rename.dn, rename.new_dn
                    ),
                );
            }
            Err(e) => return fail_with(operation, &e),
        }
    }
    let Some(parent) = rename.new_dn.parent() else {
        return ControlFlow::Continue(());
    };
    let inside_backend = backend
        .base_dns()
        .iter()
        .any(|base| parent.is_descendant_of(base));
    if !inside_backend {
        return ControlFlow::Continue(());
    }
    match backend.entry_exists(&parent) {
        Ok(true) => ControlFlow::Continue(()),
        Ok(false) => {
            operation.set_matched_dn(context.backends().matched_dn(&parent));
            fail(
                operation,
                ResultCode::NoSuchObject,
                format!(
                    "Entry {} cannot be moved because the new parent {} does not exist",
                    rename.dn, parent
                ),
            )
        }
        Err(e) => fail_with(operation, &e),
    }
}

/// the attribute changes implied by the new RDN
///
/// with `delete_old_rdn` the old RDN values not repeated in the new RDN are
/// deleted; new RDN values missing from the entry are added
fn rdn_modifications(entry: &Entry, rename: &Rename) -> Vec<Mod<String>> {
    let mut modifications = Vec::new();
    if rename.delete_old_rdn {
        if let Some(old_rdn) = rename.dn.rdn() {
            for ava in old_rdn.avas() {
                if rename.new_rdn.avas().contains(ava) {
                    continue;
                }
                modifications.push(Mod::Delete(
                    ava.attribute_type().to_string(),
                    HashSet::from([ava.value().to_string()]),
                ));
            }
        }
    }
    for ava in rename.new_rdn.avas() {
        if !entry.has_value(ava.attribute_type(), ava.value()) {
            modifications.push(Mod::Add(
                ava.attribute_type().to_string(),
                HashSet::from([ava.value().to_string()]),
            ));
        }
    }
    modifications
}

/// the new RDN may not use attributes clients cannot modify
fn check_rdn_attributes(
    context: &ServerContext,
    operation: &mut OperationRecord,
    new_rdn: &Rdn,
) -> Phase {
    if operation.is_internal() || operation.is_synchronization() {
        return ControlFlow::Continue(());
    }
    for ava in new_rdn.avas() {
        let attribute = ava.attribute_type();
        if context.schema().is_no_user_modification(attribute) {
            return fail(
                operation,
                ResultCode::UnwillingToPerform,
                format!(
                    "The new RDN may not use the attribute {} because it is not user modifiable",
                    attribute
                ),
            );
        }
        if context.schema().is_obsolete(attribute) {
            return fail(
                operation,
                ResultCode::ConstraintViolation,
                format!(
                    "The new RDN may not use the attribute {} because it is obsolete",
                    attribute
                ),
            );
        }
    }
    ControlFlow::Continue(())
}

/// apply the modifications pre-operation plugins appended and validate the
/// result again
fn apply_plugin_modifications(
    context: &ServerContext,
    operation: &mut OperationRecord,
    generated: usize,
) -> Phase<Entry> {
    let Some(payload) = operation.modify_dn() else {
        return payload_mismatch(context, operation);
    };
    let Some(mut updated) = payload.updated_entry.clone() else {
        return payload_mismatch(context, operation);
    };
    let appended = payload.modifications.get(generated..).unwrap_or_default().to_vec();
    if appended.is_empty() {
        return ControlFlow::Continue(updated);
    }
    tracing::debug!(
        "Applying {} modifications added by pre-operation plugins to {}",
        appended.len(),
        updated.dn()
    );
    if let Err(e) = apply_modifications(&mut updated, &appended, ApplyMode::Lenient) {
        return fail_with(operation, &e);
    }
    check_schema(
        context,
        operation,
        &updated,
        Some(ResultCode::ObjectclassViolation),
    )?;
    if let Some(payload) = operation.modify_dn_mut() {
        payload.updated_entry = Some(updated.clone());
    }
    ControlFlow::Continue(updated)
}
