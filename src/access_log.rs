//! access log records on the `access` tracing target

use crate::operation::{BindCredentials, OperationPayload, OperationRecord};

/// the request specific part of an access log line
fn request_details(operation: &OperationRecord) -> String {
    match operation.payload() {
        OperationPayload::Bind(bind) => match &bind.credentials {
            BindCredentials::Simple { .. } => format!("dn=\"{}\" type=SIMPLE", bind.bind_dn.raw()),
            BindCredentials::Sasl { mechanism, .. } => {
                format!("dn=\"{}\" type=SASL mechanism={}", bind.bind_dn.raw(), mechanism)
            }
        },
        OperationPayload::Delete(delete) => format!("dn=\"{}\"", delete.entry_dn.raw()),
        OperationPayload::ModifyDn(modify_dn) => format!(
            "dn=\"{}\" newRDN=\"{}\" deleteOldRDN={} newSuperior=\"{}\"",
            modify_dn.entry_dn.raw(),
            modify_dn.new_rdn.raw(),
            modify_dn.delete_old_rdn,
            modify_dn
                .new_superior
                .as_ref()
                .map(|s| s.raw())
                .unwrap_or_default()
        ),
        OperationPayload::Add(add) => format!("dn=\"{}\"", add.entry_dn.raw()),
        OperationPayload::Modify(modify) => format!("dn=\"{}\"", modify.entry_dn.raw()),
        OperationPayload::Compare(compare) => format!(
            "dn=\"{}\" attr={}",
            compare.entry_dn.raw(),
            compare.attribute
        ),
        OperationPayload::Search(search) => format!(
            "base=\"{}\" scope={:?} filter=\"{}\"",
            search.base_dn.raw(),
            search.scope,
            search.filter.raw()
        ),
    }
}

/// log a request after pre-parse processing
pub fn log_request(operation: &OperationRecord) {
    tracing::info!(
        target: "access",
        conn = operation.connection_id(),
        op = operation.operation_id(),
        msg_id = operation.message_id(),
        "{} REQ {}",
        operation.operation_type(),
        request_details(operation)
    );
}

/// log the result of an operation
pub fn log_response(operation: &OperationRecord) {
    let result = operation
        .result_code()
        .map(|code| code.code().to_string())
        .unwrap_or_else(|| "undefined".to_string());
    let etime = operation
        .processing_time()
        .map(|time| time.as_millis())
        .unwrap_or_default();
    let auth_failure_reason = operation
        .bind()
        .and_then(|bind| bind.auth_failure_reason.as_deref())
        .unwrap_or_default();
    tracing::info!(
        target: "access",
        conn = operation.connection_id(),
        op = operation.operation_id(),
        msg_id = operation.message_id(),
        result = %result,
        etime_ms = etime as u64,
        "{} RES message=\"{}\" authFailureReason=\"{}\" additionalInfo=\"{}\"",
        operation.operation_type(),
        operation.error_message(),
        auth_failure_reason,
        operation.additional_log_message()
    );
}

/// log that an operation was canceled and no response was sent
pub fn log_canceled(operation: &OperationRecord) {
    let reason = operation
        .cancel_state()
        .cancel_request()
        .map(|request| request.reason)
        .unwrap_or_default();
    tracing::info!(
        target: "access",
        conn = operation.connection_id(),
        op = operation.operation_id(),
        msg_id = operation.message_id(),
        "{} CANCELED reason=\"{}\"",
        operation.operation_type(),
        reason
    );
}

/// log that processing ended with the connection being closed
pub fn log_disconnect(operation: &OperationRecord, message: &str) {
    tracing::info!(
        target: "access",
        conn = operation.connection_id(),
        op = operation.operation_id(),
        msg_id = operation.message_id(),
        "{} DISCONNECT reason=\"{}\"",
        operation.operation_type(),
        message
    );
}
