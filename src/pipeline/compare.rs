//! compare processing

use super::controls::process_controls;
use super::{
    check_access, check_cancel, fetch_entry, payload_mismatch, pre_operation_plugins,
    resolve_conflicts, resolved_field, route, with_locks, OperationStrategy, Phase,
};
use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::context::ServerContext;
use crate::dn::Dn;
use crate::lock::LockMode;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use std::ops::ControlFlow;

/// checks whether an entry holds an attribute value
#[derive(Debug)]
pub(crate) struct CompareStrategy;

impl OperationStrategy for CompareStrategy {
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let resolved = operation
            .compare_mut()
            .map(|p| p.entry_dn.resolve().cloned());
        let dn = resolved_field(context, operation, "entry DN", resolved)?;
        let backend = route(context, operation, &dn)?;
        check_cancel(operation)?;
        with_locks(
            context,
            operation,
            &[(dn.clone(), LockMode::Read)],
            |operation| compare_locked(context, operation, connection, backend.as_ref(), &dn),
        )
    }
}

/// everything done while the entry is read locked
fn compare_locked(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    backend: &dyn Backend,
    dn: &Dn,
) -> Phase {
    check_cancel(operation)?;
    let entry = fetch_entry(context, backend, operation, dn)?;
    let Some(payload) = operation.compare_mut() else {
        return payload_mismatch(context, operation);
    };
    payload.entry = Some(entry.clone());
    let attribute = payload.attribute.clone();
    let assertion_value = payload.assertion_value.clone();
    resolve_conflicts(context, operation)?;
    process_controls(context, operation, connection, Some(backend), Some(&entry))?;
    check_access(
        context,
        operation,
        ResultCode::InsufficientAccessRights,
        format!("You do not have sufficient privileges to compare in entry {}", dn),
    )?;
    pre_operation_plugins(context, operation)?;
    check_cancel(operation)?;
    let visible = context.access_control().filter_entry(operation, &entry);
    if !visible.has_attribute(&attribute) {
        operation.set_result_code(ResultCode::NoSuchAttribute);
        operation.append_error_message(format!(
            "Entry {} has no attribute {}",
            dn, attribute
        ));
        return ControlFlow::Continue(());
    }
    if visible.has_value(&attribute, &assertion_value) {
        operation.set_result_code(ResultCode::CompareTrue);
    } else {
        operation.set_result_code(ResultCode::CompareFalse);
    }
    ControlFlow::Continue(())
}
