//! request control processing shared by all operation kinds

use super::{fail, Phase};
use crate::backend::Backend;
use crate::connection::{ClientConnection, Privilege};
use crate::context::ServerContext;
use crate::control::{AuthzId, ControlError, RequestControl, ResponseControl};
use crate::dn::Dn;
use crate::entry::Entry;
use crate::filter::SearchFilter;
use crate::operation::{OperationRecord, OperationType};
use crate::result_code::ResultCode;
use ldap3::Scope;
use std::ops::ControlFlow;

/// what the request controls asked for beyond what was applied right away
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestedControls {
    /// attributes for the pre-read response control
    pub(crate) pre_read: Option<Vec<String>>,
    /// attributes for the post-read response control
    pub(crate) post_read: Option<Vec<String>>,
    /// whether the authorization identity should be returned
    pub(crate) authorization_identity: bool,
    /// whether password policy information should be returned
    pub(crate) password_policy: bool,
}

/// whether a control is meaningful for the operation type
fn applies_to(control: &RequestControl, operation_type: OperationType) -> bool {
    match control {
        RequestControl::Assertion(_) => operation_type != OperationType::Bind,
        RequestControl::PreRead(_) => matches!(
            operation_type,
            OperationType::Delete | OperationType::ModifyDn | OperationType::Modify
        ),
        RequestControl::PostRead(_) => matches!(
            operation_type,
            OperationType::ModifyDn | OperationType::Add | OperationType::Modify
        ),
        RequestControl::ProxiedAuthV1(_) | RequestControl::ProxiedAuthV2(_) => {
            operation_type != OperationType::Bind
        }
        RequestControl::NoOp => operation_type.is_update(),
        RequestControl::AuthorizationIdentity | RequestControl::PasswordPolicy => {
            operation_type == OperationType::Bind
        }
        RequestControl::Unrecognized => false,
    }
}

/// interpret the request controls of an operation
///
/// the assertion control is evaluated against `current_entry` when there is
/// one; unknown critical controls fail the operation unless the backend or
/// the server configuration supports them
pub(crate) fn process_controls(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    backend: Option<&dyn Backend>,
    current_entry: Option<&Entry>,
) -> Phase<RequestedControls> {
    let mut requested = RequestedControls::default();
    let operation_type = operation.operation_type();
    for raw in operation.request_controls().to_vec() {
        let control = match RequestControl::parse(&raw) {
            Ok(control) => control,
            Err(ControlError::OIDError(e)) => {
                tracing::debug!("Treating control {} as unrecognized: {}", raw.ctype, e);
                RequestControl::Unrecognized
            }
            Err(e) => {
                return fail(
                    operation,
                    ResultCode::ProtocolError,
                    format!("Unable to decode the request control {}: {}", raw.ctype, e),
                );
            }
        };
        let supported_elsewhere = backend.is_some_and(|b| b.supports_control(&raw.ctype))
            || context.config().supports_control(&raw.ctype);
        if !applies_to(&control, operation_type) {
            if raw.crit && !supported_elsewhere {
                return fail(
                    operation,
                    ResultCode::UnavailableCriticalExtension,
                    format!(
                        "The critical control {} is not supported for {} operations",
                        raw.ctype, operation_type
                    ),
                );
            }
            continue;
        }
        match control {
            RequestControl::Assertion(filter) => {
                if let Some(entry) = current_entry {
                    check_assertion(operation, &filter, entry)?;
                }
            }
            RequestControl::PreRead(attributes) => requested.pre_read = Some(attributes),
            RequestControl::PostRead(attributes) => requested.post_read = Some(attributes),
            RequestControl::ProxiedAuthV1(dn) => {
                apply_proxied_auth(context, operation, connection, ProxyTarget::Dn(dn))?
            }
            RequestControl::ProxiedAuthV2(authz_id) => {
                let target = match authz_id {
                    AuthzId::Anonymous => ProxyTarget::Anonymous,
                    AuthzId::Dn(dn) => ProxyTarget::Dn(dn),
                    AuthzId::Username(name) => ProxyTarget::Username(name),
                };
                apply_proxied_auth(context, operation, connection, target)?
            }
            RequestControl::NoOp => operation.set_no_op(true),
            RequestControl::AuthorizationIdentity => requested.authorization_identity = true,
            RequestControl::PasswordPolicy => requested.password_policy = true,
            RequestControl::Unrecognized => {}
        }
    }
    ControlFlow::Continue(requested)
}

/// fail with ASSERTION_FAILED unless the entry matches the filter
fn check_assertion(
    operation: &mut OperationRecord,
    filter: &SearchFilter,
    entry: &Entry,
) -> Phase {
    if filter.matches(entry) {
        return ControlFlow::Continue(());
    }
    fail(
        operation,
        ResultCode::AssertionFailed,
        format!(
            "Entry {} cannot be processed because it does not match the assertion filter {}",
            entry.dn(),
            filter
        ),
    )
}

/// the identity a proxied authorization control asks for
enum ProxyTarget {
    /// no identity
    Anonymous,
    /// the entry with this DN
    Dn(Dn),
    /// the entry with this uid
    Username(String),
}

/// switch the authorization identity of the operation
fn apply_proxied_auth(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    target: ProxyTarget,
) -> Phase {
    if !connection.has_privilege(Privilege::ProxiedAuth) {
        return fail(
            operation,
            ResultCode::AuthorizationDenied,
            "You do not have sufficient privileges to use the proxied authorization control",
        );
    }
    let proxy_entry = match target {
        ProxyTarget::Anonymous => {
            operation.set_client_authorization_dn(None);
            operation.set_authorization_entry(None);
            return ControlFlow::Continue(());
        }
        ProxyTarget::Dn(dn) => context
            .backends()
            .backend_for(&dn)
            .and_then(|backend| backend.get_entry(&dn).ok().flatten()),
        ProxyTarget::Username(name) => find_user(context, &name),
    };
    let Some(proxy_entry) = proxy_entry else {
        return fail(
            operation,
            ResultCode::AuthorizationDenied,
            "The proxied authorization identity does not refer to an existing entry",
        );
    };
    if !context
        .access_control()
        .is_proxied_auth_allowed(operation, &proxy_entry)
    {
        return fail(
            operation,
            ResultCode::AuthorizationDenied,
            format!("You are not allowed to act as {}", proxy_entry.dn()),
        );
    }
    tracing::debug!(
        "Operation {} on connection {} is authorized as {}",
        operation.operation_id(),
        operation.connection_id(),
        proxy_entry.dn()
    );
    operation.set_authorization_entry(Some(proxy_entry));
    ControlFlow::Continue(())
}

/// the single entry with the uid below any backend
fn find_user(context: &ServerContext, name: &str) -> Option<Entry> {
    let filter = SearchFilter::Equality {
        attribute: "uid".to_string(),
        value: name.to_string(),
    };
    let mut found: Vec<Entry> = Vec::new();
    for backend in context.backends().backends() {
        for base in backend.base_dns() {
            match backend.search(&base, Scope::Subtree, &filter) {
                Ok(entries) => found.extend(entries),
                Err(e) => tracing::debug!("Searching {} for user {} failed: {}", base, name, e),
            }
        }
    }
    if found.len() == 1 {
        found.pop()
    } else {
        tracing::debug!("User name {} matches {} entries", name, found.len());
        None
    }
}

/// attach the pre-read and post-read response controls the request asked for
pub(crate) fn add_read_controls(
    context: &ServerContext,
    operation: &mut OperationRecord,
    requested: &RequestedControls,
    before: Option<&Entry>,
    after: Option<&Entry>,
) {
    if let (Some(attributes), Some(entry)) = (&requested.pre_read, before) {
        let visible = context.access_control().filter_entry(operation, entry);
        operation.add_response_control(ResponseControl::PreRead(
            visible.select_attributes(attributes),
        ));
    }
    if let (Some(attributes), Some(entry)) = (&requested.post_read, after) {
        let visible = context.access_control().filter_entry(operation, entry);
        operation.add_response_control(ResponseControl::PostRead(
            visible.select_attributes(attributes),
        ));
    }
}
