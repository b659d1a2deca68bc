//! search processing

use super::controls::process_controls;
use super::{
    check_access, check_cancel, fail, fail_with, payload_mismatch, pre_operation_plugins,
    resolved_field, route, OperationStrategy, Phase,
};
use crate::connection::ClientConnection;
use crate::context::ServerContext;
use crate::operation::OperationRecord;
use crate::result_code::ResultCode;
use std::ops::ControlFlow;

/// finds entries and hands them to the connection one by one
///
/// searches take no entry locks, every entry is read in one backend call
#[derive(Debug)]
pub(crate) struct SearchStrategy;

impl OperationStrategy for SearchStrategy {
    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let resolved = operation
            .search_mut()
            .map(|p| p.base_dn.resolve().cloned());
        let base = resolved_field(context, operation, "search base", resolved)?;
        let resolved = operation.search_mut().map(|p| p.filter.resolve().cloned());
        let filter = match resolved {
            Some(Ok(filter)) => filter,
            Some(Err(e)) => {
                return fail(
                    operation,
                    ResultCode::ProtocolError,
                    format!("Unable to decode the search filter: {}", e),
                );
            }
            None => return payload_mismatch(context, operation),
        };
        let Some(payload) = operation.search() else {
            return payload_mismatch(context, operation);
        };
        let scope = payload.scope;
        let attributes = payload.attributes.clone();
        let size_limit = payload.size_limit;
        let backend = route(context, operation, &base)?;
        check_cancel(operation)?;
        let base_entry = match backend.get_entry(&base) {
            Ok(entry) => entry,
            Err(e) => return fail_with(operation, &e),
        };
        process_controls(
            context,
            operation,
            connection,
            Some(backend.as_ref()),
            base_entry.as_ref(),
        )?;
        check_access(
            context,
            operation,
            ResultCode::InsufficientAccessRights,
            format!("You do not have sufficient privileges to search below {}", base),
        )?;
        pre_operation_plugins(context, operation)?;
        check_cancel(operation)?;
        let entries = match backend.search(&base, scope, &filter) {
            Ok(entries) => entries,
            Err(e) => {
                if e.result_code == ResultCode::NoSuchObject && e.matched_dn.is_none() {
                    operation.set_matched_dn(context.backends().matched_dn(&base));
                }
                return fail_with(operation, &e);
            }
        };
        let mut sent = 0;
        for entry in &entries {
            check_cancel(operation)?;
            if size_limit > 0 && sent >= size_limit {
                return fail(
                    operation,
                    ResultCode::SizeLimitExceeded,
                    format!("The search returned more than {} entries", size_limit),
                );
            }
            let visible = context
                .access_control()
                .filter_entry(operation, entry)
                .select_attributes(&attributes);
            if !connection.send_search_entry(operation, &visible) {
                tracing::debug!(
                    "Connection {} stopped accepting entries for operation {}",
                    operation.connection_id(),
                    operation.operation_id()
                );
                break;
            }
            sent += 1;
            if let Some(payload) = operation.search_mut() {
                payload.entries_sent = sent;
            }
        }
        operation.set_result_code(ResultCode::Success);
        ControlFlow::Continue(())
    }
}
