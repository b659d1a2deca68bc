//! bind processing: simple and SASL authentication with password policy
//! enforcement
//!
//! the client only ever learns that its credentials were invalid, the
//! detailed reason goes to the access log through the bind payload

use super::controls::process_controls;
use super::{
    check_access, fail, fail_with, payload_mismatch, pre_operation_plugins, OperationStrategy,
    Phase,
};
use crate::cancel::CancelRequest;
use crate::connection::{AuthenticationInfo, ClientConnection};
use crate::context::ServerContext;
use crate::control::ResponseControl;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::modification::{apply_modifications, ApplyMode};
use crate::operation::{BindCredentials, OperationRecord};
use crate::password_policy::state::PasswordPolicyState;
use crate::password_policy::{
    AccountStatusNotificationType, PasswordPolicyErrorType, PasswordPolicyWarningType,
};
use crate::result_code::ResultCode;
use crate::sasl::{SaslBindOutcome, SaslMechanismHandler};
use std::ops::ControlFlow;

/// the attribute holding the size limit of a user
const SIZE_LIMIT_ATTRIBUTE: &str = "ds-rlim-size-limit";

/// the attribute holding the time limit of a user
const TIME_LIMIT_ATTRIBUTE: &str = "ds-rlim-time-limit";

/// the diagnostic message of every failed bind
const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid credentials";

/// authenticates the connection
#[derive(Debug)]
pub(crate) struct BindStrategy;

/// what the account state checks found besides a failure
#[derive(Debug, Default)]
struct AccountCheck {
    /// the password expired but a grace login may be used
    use_grace_login: bool,
    /// the user should be warned about the upcoming expiration, `true` for
    /// the first warning
    warning: Option<bool>,
}

impl OperationStrategy for BindStrategy {
    fn prepare(
        &self,
        _context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) {
        connection.set_bind_in_progress(true);
        connection.cancel_all_operations_except(
            &CancelRequest::new(true, "Canceled by a bind request on the same connection"),
            operation.message_id(),
        );
        connection.set_authentication_info(AuthenticationInfo::anonymous());
        operation.set_client_authorization_dn(None);
    }

    fn process(
        &self,
        context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) -> Phase {
        let resolved = operation.bind_mut().map(|p| p.bind_dn.resolve().cloned());
        let bind_dn = match resolved {
            Some(Ok(dn)) => dn,
            Some(Err(e)) => {
                return deny(operation, None, format!("The bind DN is malformed: {}", e));
            }
            None => return payload_mismatch(context, operation),
        };
        let requested = process_controls(context, operation, connection, None, None)?;
        let Some(payload) = operation.bind_mut() else {
            return payload_mismatch(context, operation);
        };
        payload.password_policy_control_requested = requested.password_policy;
        payload.authorization_identity_requested = requested.authorization_identity;
        let credentials = payload.credentials.clone();
        pre_operation_plugins(context, operation)?;
        match credentials {
            BindCredentials::Simple { password } => {
                simple_bind(context, operation, connection, bind_dn, &password)
            }
            BindCredentials::Sasl { mechanism, .. } => {
                sasl_bind(context, operation, connection, &mechanism)
            }
        }
    }

    fn before_response(
        &self,
        _context: &ServerContext,
        operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) {
        let Some(payload) = operation.bind() else {
            return;
        };
        let success = operation.result_code() == Some(ResultCode::Success);
        let mut controls = Vec::new();
        if payload.authorization_identity_requested && success {
            let identity = match connection.authentication_info().authorization_dn {
                Some(dn) => format!("dn:{}", dn),
                None => String::new(),
            };
            controls.push(ResponseControl::AuthorizationIdentity(identity));
        }
        if payload.password_policy_control_requested {
            controls.push(ResponseControl::PasswordPolicy {
                warning: payload.password_policy_warning,
                error: payload.password_policy_error,
            });
        } else if success {
            if payload.must_change_password {
                controls.push(ResponseControl::PasswordExpired);
            }
            if let Some((PasswordPolicyWarningType::TimeBeforeExpiration, seconds)) =
                payload.password_policy_warning
            {
                controls.push(ResponseControl::PasswordExpiring(seconds));
            }
        }
        for control in controls {
            operation.add_response_control(control);
        }
    }

    fn finish(
        &self,
        _context: &ServerContext,
        _operation: &mut OperationRecord,
        connection: &dyn ClientConnection,
    ) {
        connection.set_bind_in_progress(false);
    }
}

/// fail the bind with INVALID_CREDENTIALS, keeping the detailed reason for
/// the access log
fn deny<T>(
    operation: &mut OperationRecord,
    error: Option<PasswordPolicyErrorType>,
    reason: impl Into<String>,
) -> Phase<T> {
    if let Some(payload) = operation.bind_mut() {
        payload.auth_failure_reason = Some(reason.into());
        if error.is_some() {
            payload.password_policy_error = error;
        }
    }
    fail(
        operation,
        ResultCode::InvalidCredentials,
        INVALID_CREDENTIALS_MESSAGE,
    )
}

/// finish an anonymous bind
fn anonymous(operation: &mut OperationRecord, connection: &dyn ClientConnection) -> Phase {
    connection.set_must_change_password(false);
    connection.set_resource_limits(None, None);
    operation.set_result_code(ResultCode::Success);
    ControlFlow::Continue(())
}

/// a simple bind with a DN and a password
fn simple_bind(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    bind_dn: Dn,
    password: &str,
) -> Phase {
    if bind_dn.is_root() {
        if password.is_empty() {
            return anonymous(operation, connection);
        }
        return deny(operation, None, "A simple bind with a password needs a bind DN");
    }
    if password.is_empty() {
        if context.config().bind_with_dn_requires_password {
            return fail(
                operation,
                ResultCode::UnwillingToPerform,
                "Unable to process a simple bind request with a DN but without a password",
            );
        }
        return anonymous(operation, connection);
    }
    let user_dn = context
        .config()
        .actual_root_bind_dn(&bind_dn)
        .cloned()
        .unwrap_or(bind_dn);
    let entry = find_user_entry(context, operation, &user_dn)?;
    authorize_user(context, operation, &entry)?;
    let policy = context.password_policies().policy_for(&entry);
    let mut state = PasswordPolicyState::new(policy, entry, context.clock().now());
    let flow = verify_password(operation, connection, &mut state, password);
    persist_state(context, operation, &mut state);
    flow?;
    complete_bind(context, operation, connection, state.entry(), None)
}

/// check the password and the account state of a simple bind
fn verify_password(
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    state: &mut PasswordPolicyState,
    password: &str,
) -> Phase {
    if state.policy().require_secure_authentication && !connection.is_secure() {
        return deny(
            operation,
            None,
            "The password policy requires secure authentication",
        );
    }
    if !state.has_password() {
        return deny(operation, None, "The user entry has no password");
    }
    let check = check_account_state(operation, state, true)?;
    if !state.password_matches(password) {
        record_failure(state);
        return deny(operation, None, "The password is incorrect");
    }
    accept_password(operation, state, &check);
    ControlFlow::Continue(())
}

/// a SASL bind through the registered mechanism handler
fn sasl_bind(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    mechanism: &str,
) -> Phase {
    let Some(handler) = context.sasl_mechanisms().handler(mechanism) else {
        return fail(
            operation,
            ResultCode::AuthMethodNotSupported,
            format!("The SASL mechanism {} is not supported", mechanism),
        );
    };
    let outcome = match handler.process_sasl_bind(context, operation) {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(payload) = operation.bind_mut() {
                payload.auth_failure_reason = Some(e.message.clone());
            }
            return fail_with(operation, &e);
        }
    };
    let user_entry = operation.bind().and_then(|p| p.user_entry.clone());
    match outcome {
        SaslBindOutcome::InProgress { server_credentials } => {
            if let Some(payload) = operation.bind_mut() {
                payload.server_sasl_credentials = server_credentials;
            }
            operation.set_result_code(ResultCode::SaslBindInProgress);
            ControlFlow::Continue(())
        }
        SaslBindOutcome::Failure { reason } => {
            if let Some(entry) = user_entry.filter(|_| handler.is_password_based()) {
                let policy = context.password_policies().policy_for(&entry);
                let mut state = PasswordPolicyState::new(policy, entry, context.clock().now());
                record_failure(&mut state);
                persist_state(context, operation, &mut state);
            }
            deny(operation, None, reason)
        }
        SaslBindOutcome::Success { server_credentials } => {
            if let Some(payload) = operation.bind_mut() {
                payload.server_sasl_credentials = server_credentials;
            }
            let Some(entry) = user_entry else {
                tracing::error!(
                    "SASL mechanism {} reported success without a user entry",
                    handler.mechanism()
                );
                return fail(
                    operation,
                    context.config().server_error_result_code,
                    format!(
                        "The SASL mechanism {} did not identify a user",
                        handler.mechanism()
                    ),
                );
            };
            authorize_user(context, operation, &entry)?;
            let policy = context.password_policies().policy_for(&entry);
            let mut state = PasswordPolicyState::new(policy, entry, context.clock().now());
            let flow = check_sasl_policy(operation, connection, handler.as_ref(), &mut state);
            persist_state(context, operation, &mut state);
            flow?;
            complete_bind(
                context,
                operation,
                connection,
                state.entry(),
                Some(handler.mechanism().to_uppercase()),
            )
        }
    }
}

/// the password policy checks after a successful SASL exchange
///
/// checks concerning the password only apply to password based mechanisms
fn check_sasl_policy(
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    handler: &dyn SaslMechanismHandler,
    state: &mut PasswordPolicyState,
) -> Phase {
    if state.policy().require_secure_authentication
        && !connection.is_secure()
        && !handler.is_secure()
    {
        return deny(
            operation,
            None,
            "The password policy requires secure authentication",
        );
    }
    let password_based = handler.is_password_based();
    let check = check_account_state(operation, state, password_based)?;
    if password_based {
        accept_password(operation, state, &check);
    } else {
        state.record_login();
    }
    ControlFlow::Continue(())
}

/// fetch the entry of the user to authenticate
fn find_user_entry(
    context: &ServerContext,
    operation: &mut OperationRecord,
    dn: &Dn,
) -> Phase<Entry> {
    let Some(backend) = context.backends().backend_for(dn) else {
        return deny(operation, None, format!("No backend holds the user entry {}", dn));
    };
    match backend.get_entry(dn) {
        Ok(Some(entry)) => {
            if let Some(payload) = operation.bind_mut() {
                payload.user_entry = Some(entry.clone());
            }
            ControlFlow::Continue(entry)
        }
        Ok(None) => deny(operation, None, format!("The user entry {} does not exist", dn)),
        Err(e) => {
            tracing::error!("Unable to fetch the user entry {}: {}", dn, e);
            deny(operation, None, format!("Unable to fetch the user entry {}", dn))
        }
    }
}

/// the access control decision for binding as the user
fn authorize_user(
    context: &ServerContext,
    operation: &mut OperationRecord,
    entry: &Entry,
) -> Phase {
    if let ControlFlow::Break(exit) = check_access(
        context,
        operation,
        ResultCode::InvalidCredentials,
        INVALID_CREDENTIALS_MESSAGE,
    ) {
        if let Some(payload) = operation.bind_mut() {
            payload.auth_failure_reason =
                Some(format!("Access control does not allow binding as {}", entry.dn()));
        }
        return ControlFlow::Break(exit);
    }
    ControlFlow::Continue(())
}

/// the account state checks in precedence order, the first one that
/// applies decides
fn check_account_state(
    operation: &mut OperationRecord,
    state: &mut PasswordPolicyState,
    password_based: bool,
) -> Phase<AccountCheck> {
    let locked = Some(PasswordPolicyErrorType::AccountLocked);
    if state.is_disabled() {
        return deny(operation, locked, "The account is disabled");
    }
    if state.is_account_expired() {
        state.add_notification(
            AccountStatusNotificationType::AccountExpired,
            "The account has expired",
        );
        return deny(operation, locked, "The account has expired");
    }
    if password_based && state.locked_due_to_failures() {
        return deny(
            operation,
            locked,
            "The account is locked after too many authentication failures",
        );
    }
    if password_based && state.locked_due_to_reset_age() {
        state.add_notification(
            AccountStatusNotificationType::AccountResetLocked,
            "The account is locked because the reset password was not changed in time",
        );
        return deny(
            operation,
            locked,
            "The account is locked because the reset password was not changed in time",
        );
    }
    if state.locked_due_to_idle() {
        state.add_notification(
            AccountStatusNotificationType::AccountIdleLocked,
            "The account is locked because it was idle for too long",
        );
        return deny(
            operation,
            locked,
            "The account is locked because it was idle for too long",
        );
    }
    let mut check = AccountCheck::default();
    if !password_based {
        return ControlFlow::Continue(check);
    }
    let expiration = state.expiration_status();
    if expiration.expired {
        if expiration.may_use_grace_login && state.grace_logins_remaining() > 0 {
            check.use_grace_login = true;
        } else {
            state.add_notification(
                AccountStatusNotificationType::PasswordExpired,
                "The password has expired",
            );
            return deny(
                operation,
                Some(PasswordPolicyErrorType::PasswordExpired),
                "The password has expired",
            );
        }
    } else if expiration.should_warn {
        check.warning = Some(expiration.first_warning);
    }
    ControlFlow::Continue(check)
}

/// record a failed password check, locking the account when the failure
/// count is reached
fn record_failure(state: &mut PasswordPolicyState) {
    if !state.record_auth_failure() {
        return;
    }
    match state.seconds_until_unlock() {
        Some(seconds) => state.add_notification(
            AccountStatusNotificationType::AccountTemporarilyLocked,
            format!(
                "The account is locked for {} seconds after too many authentication failures",
                seconds
            ),
        ),
        None => state.add_notification(
            AccountStatusNotificationType::AccountPermanentlyLocked,
            "The account is locked after too many authentication failures",
        ),
    }
}

/// update the policy state after the password was accepted
fn accept_password(
    operation: &mut OperationRecord,
    state: &mut PasswordPolicyState,
    check: &AccountCheck,
) {
    state.clear_failure_lockout();
    let mut must_change = false;
    let mut warning = None;
    let mut error = None;
    if check.use_grace_login {
        state.record_grace_login();
        must_change = true;
        let remaining = state.grace_logins_remaining();
        warning = Some((
            PasswordPolicyWarningType::GraceLoginsRemaining,
            remaining as i64,
        ));
        operation.append_additional_log_message(format!(
            "Grace login used, {} remaining",
            remaining
        ));
    } else if let Some(first_warning) = check.warning {
        let seconds = state.seconds_until_expiration().unwrap_or_default();
        if first_warning {
            state.set_warned_time();
            state.add_notification(
                AccountStatusNotificationType::PasswordExpiring,
                format!("The password expires in {} seconds", seconds),
            );
        }
        warning = Some((PasswordPolicyWarningType::TimeBeforeExpiration, seconds));
        operation.append_error_message(format!("The password expires in {} seconds", seconds));
    }
    state.record_login();
    if state.must_change_password() {
        must_change = true;
        error = Some(PasswordPolicyErrorType::ChangeAfterReset);
    }
    if let Some(payload) = operation.bind_mut() {
        payload.must_change_password = must_change;
        payload.password_policy_warning = warning;
        payload.password_policy_error = error;
    }
}

/// write the accumulated policy state back to the user entry and hand out
/// the queued notifications
///
/// this runs without an entry lock, binds on one connection are serialized
/// by the connection itself
fn persist_state(
    context: &ServerContext,
    operation: &OperationRecord,
    state: &mut PasswordPolicyState,
) {
    let modifications = state.modifications();
    if !modifications.is_empty() {
        let dn = state.entry().dn().clone();
        let result = match context.backends().backend_for(&dn) {
            Some(backend) => backend.get_entry(&dn).and_then(|current| {
                let current = current.ok_or_else(|| DirectoryError::no_such_object(&dn))?;
                let mut updated = current.clone();
                apply_modifications(&mut updated, &modifications, ApplyMode::Lenient)?;
                backend.replace_entry(&current, updated, operation)
            }),
            None => Err(DirectoryError::no_such_object(&dn)),
        };
        match result {
            Ok(()) => tracing::debug!(
                "Stored {} password policy state changes for {}",
                modifications.len(),
                dn
            ),
            Err(e) => tracing::error!(
                "Unable to store the password policy state of {}: {}",
                dn,
                e
            ),
        }
    }
    for notification in state.take_notifications() {
        context.dispatch_account_status_notification(&notification);
    }
}

/// a resource limit from the user entry, malformed values are ignored
fn resource_limit(entry: &Entry, attribute: &str) -> Option<u32> {
    let values = entry.get(attribute)?;
    let [value] = values.as_slice() else {
        tracing::warn!(
            "Ignoring {} of {} because it has {} values",
            attribute,
            entry.dn(),
            values.len()
        );
        return None;
    };
    match value.trim().parse::<u32>() {
        Ok(limit) => Some(limit),
        Err(e) => {
            tracing::warn!(
                "Ignoring malformed {} value {} of {}: {}",
                attribute,
                value,
                entry.dn(),
                e
            );
            None
        }
    }
}

/// establish the authenticated identity on the connection
fn complete_bind(
    context: &ServerContext,
    operation: &mut OperationRecord,
    connection: &dyn ClientConnection,
    entry: &Entry,
    sasl_mechanism: Option<String>,
) -> Phase {
    let dn = entry.dn().clone();
    let size_limit = resource_limit(entry, SIZE_LIMIT_ATTRIBUTE);
    let time_limit = resource_limit(entry, TIME_LIMIT_ATTRIBUTE);
    let Some(payload) = operation.bind_mut() else {
        return payload_mismatch(context, operation);
    };
    payload.user_entry = Some(entry.clone());
    payload.size_limit = size_limit;
    payload.time_limit = time_limit;
    let must_change = payload.must_change_password;
    connection.set_authentication_info(AuthenticationInfo {
        authentication_dn: Some(dn.clone()),
        authorization_dn: Some(dn.clone()),
        is_root: context.config().is_root_dn(&dn),
        sasl_mechanism,
    });
    connection.set_must_change_password(must_change);
    connection.set_resource_limits(size_limit, time_limit);
    operation.set_client_authorization_dn(Some(dn));
    operation.set_result_code(ResultCode::Success);
    ControlFlow::Continue(())
}
