//! the operation record threaded through one request's lifetime
//!
//! an [OperationRecord] is created by the transport layer, owned exclusively
//! by the pipeline executing it and afterwards handed to notification
//! listeners and post-response plugins read-only

use crate::cancel::{CancelHandle, CancelState};
use crate::control::ResponseControl;
use crate::dn::{Dn, Rdn};
use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::filter::SearchFilter;
use crate::password_policy::{PasswordPolicyErrorType, PasswordPolicyWarningType};
use crate::result_code::ResultCode;
use ldap3::controls::RawControl;
use ldap3::{Mod, Scope};
use ldap_types::basic::ChumskyError;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// the kinds of operations the pipeline executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// authenticate the connection
    Bind,
    /// remove an entry
    Delete,
    /// rename or move an entry
    ModifyDn,
    /// create an entry
    Add,
    /// change the attributes of an entry
    Modify,
    /// compare an attribute value
    Compare,
    /// find entries
    Search,
}

impl OperationType {
    /// all operation types
    pub const ALL: [OperationType; 7] = [
        OperationType::Bind,
        OperationType::Delete,
        OperationType::ModifyDn,
        OperationType::Add,
        OperationType::Modify,
        OperationType::Compare,
        OperationType::Search,
    ];

    /// whether operations of this type change the directory
    pub fn is_update(self) -> bool {
        matches!(
            self,
            OperationType::Delete
                | OperationType::ModifyDn
                | OperationType::Add
                | OperationType::Modify
        )
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::Bind => "BIND",
            OperationType::Delete => "DELETE",
            OperationType::ModifyDn => "MODIFYDN",
            OperationType::Add => "ADD",
            OperationType::Modify => "MODIFY",
            OperationType::Compare => "COMPARE",
            OperationType::Search => "SEARCH",
        };
        write!(f, "{}", name)
    }
}

/// a request field in its raw form as sent by the client and its resolved
/// form once parsed
///
/// the raw form may only change until it was resolved, the resolved form is
/// cached and never cleared
#[derive(Debug, Clone)]
pub struct RequestField<T> {
    /// the raw value
    raw: String,
    /// the resolved value
    resolved: Option<T>,
}

impl<T> RequestField<T> {
    /// a field that has not been resolved yet
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            resolved: None,
        }
    }

    /// the raw value
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// replace the raw value, refused once the field was resolved
    pub fn set_raw(&mut self, raw: impl Into<String>) -> bool {
        if self.resolved.is_some() {
            return false;
        }
        self.raw = raw.into();
        true
    }

    /// the resolved value if the field was resolved already
    pub fn resolved(&self) -> Option<&T> {
        self.resolved.as_ref()
    }

    /// set the resolved value
    pub fn set_resolved(&mut self, value: T) {
        self.resolved = Some(value);
    }

    /// resolve the raw value with the parser unless that happened before
    pub fn resolve_with<E>(
        &mut self,
        parser: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<&T, E> {
        match self.resolved {
            Some(ref value) => Ok(value),
            None => {
                let value = parser(&self.raw)?;
                Ok(self.resolved.insert(value))
            }
        }
    }
}

impl RequestField<Dn> {
    /// resolve a DN field
    pub fn resolve(&mut self) -> Result<&Dn, ChumskyError> {
        self.resolve_with(|raw| Dn::parse(raw.trim()))
    }
}

impl RequestField<Rdn> {
    /// resolve an RDN field
    pub fn resolve(&mut self) -> Result<&Rdn, ChumskyError> {
        self.resolve_with(|raw| Rdn::parse(raw.trim()))
    }
}

impl RequestField<SearchFilter> {
    /// resolve a filter field
    pub fn resolve(&mut self) -> Result<&SearchFilter, ChumskyError> {
        self.resolve_with(|raw| SearchFilter::parse(raw.trim()))
    }
}

/// credentials of a bind request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindCredentials {
    /// a simple bind, an empty password makes it anonymous
    Simple {
        /// the clear text password
        password: String,
    },
    /// a SASL bind
    Sasl {
        /// the mechanism name
        mechanism: String,
        /// the credentials for this round
        credentials: Option<Vec<u8>>,
    },
}

/// the fields of a bind operation
#[derive(Debug, Clone)]
pub struct BindPayload {
    /// the DN to bind as
    pub bind_dn: RequestField<Dn>,
    /// the credentials
    pub credentials: BindCredentials,
    /// the entry of the authenticated user, set by simple bind processing
    /// or a SASL mechanism handler
    pub user_entry: Option<Entry>,
    /// the detailed failure reason, only ever logged
    pub auth_failure_reason: Option<String>,
    /// the SASL credentials for the client
    pub server_sasl_credentials: Option<Vec<u8>>,
    /// the password policy warning for the response control
    pub password_policy_warning: Option<(PasswordPolicyWarningType, i64)>,
    /// the password policy error for the response control
    pub password_policy_error: Option<PasswordPolicyErrorType>,
    /// whether the user has to change the password before doing anything else
    pub must_change_password: bool,
    /// the size limit of the authenticated session
    pub size_limit: Option<u32>,
    /// the time limit of the authenticated session in seconds
    pub time_limit: Option<u32>,
    /// whether the password policy request control was present
    pub password_policy_control_requested: bool,
    /// whether the authorization identity request control was present
    pub authorization_identity_requested: bool,
}

/// the fields of a delete operation
#[derive(Debug, Clone)]
pub struct DeletePayload {
    /// the entry to delete
    pub entry_dn: RequestField<Dn>,
    /// the entry as it was before deletion
    pub entry_to_delete: Option<Entry>,
}

/// the fields of a modify DN operation
#[derive(Debug, Clone)]
pub struct ModifyDnPayload {
    /// the entry to rename
    pub entry_dn: RequestField<Dn>,
    /// the new RDN
    pub new_rdn: RequestField<Rdn>,
    /// whether to remove the old RDN values from the entry
    pub delete_old_rdn: bool,
    /// the new parent, if the entry moves
    pub new_superior: Option<RequestField<Dn>>,
    /// the entry before the rename
    pub original_entry: Option<Entry>,
    /// the renamed entry
    pub updated_entry: Option<Entry>,
    /// attribute changes caused by the rename, plugins may append to them
    pub modifications: Vec<Mod<String>>,
}

impl ModifyDnPayload {
    /// the DN the entry will have after the rename, once all fields are
    /// resolved
    pub fn new_dn(&self) -> Option<Dn> {
        let current = self.entry_dn.resolved()?;
        let rdn = self.new_rdn.resolved()?.clone();
        match &self.new_superior {
            Some(superior) => Some(superior.resolved()?.child(rdn)),
            None => Some(current.parent().unwrap_or_default().child(rdn)),
        }
    }
}

/// the fields of an add operation
#[derive(Debug, Clone)]
pub struct AddPayload {
    /// the DN of the new entry
    pub entry_dn: RequestField<Dn>,
    /// the attributes as sent by the client
    pub attributes: HashMap<String, Vec<String>>,
    /// the entry to add once resolved
    pub entry: Option<Entry>,
}

/// the fields of a modify operation
#[derive(Debug, Clone)]
pub struct ModifyPayload {
    /// the entry to modify
    pub entry_dn: RequestField<Dn>,
    /// the modifications in request order, plugins may append to them
    pub modifications: Vec<Mod<String>>,
    /// the entry before the modification
    pub current_entry: Option<Entry>,
    /// the entry after the modification
    pub modified_entry: Option<Entry>,
}

/// the fields of a compare operation
#[derive(Debug, Clone)]
pub struct ComparePayload {
    /// the entry to compare against
    pub entry_dn: RequestField<Dn>,
    /// the attribute to compare
    pub attribute: String,
    /// the asserted value
    pub assertion_value: String,
    /// the target entry
    pub entry: Option<Entry>,
}

/// the fields of a search operation
#[derive(Debug, Clone)]
pub struct SearchPayload {
    /// the search base
    pub base_dn: RequestField<Dn>,
    /// the search scope
    pub scope: Scope,
    /// the filter
    pub filter: RequestField<SearchFilter>,
    /// the requested attributes
    pub attributes: Vec<String>,
    /// the maximum number of entries to return, 0 for no limit
    pub size_limit: usize,
    /// whether to only return attribute names
    pub types_only: bool,
    /// the number of entries sent so far
    pub entries_sent: usize,
}

/// the operation specific part of an operation record
#[derive(Debug, Clone)]
pub enum OperationPayload {
    /// a bind
    Bind(BindPayload),
    /// a delete
    Delete(DeletePayload),
    /// a modify DN
    ModifyDn(ModifyDnPayload),
    /// an add
    Add(AddPayload),
    /// a modify
    Modify(ModifyPayload),
    /// a compare
    Compare(ComparePayload),
    /// a search
    Search(SearchPayload),
}

impl OperationPayload {
    /// a simple bind
    pub fn simple_bind(bind_dn: &str, password: &str) -> Self {
        Self::bind(bind_dn, BindCredentials::Simple {
            password: password.to_string(),
        })
    }

    /// a SASL bind
    pub fn sasl_bind(bind_dn: &str, mechanism: &str, credentials: Option<Vec<u8>>) -> Self {
        Self::bind(bind_dn, BindCredentials::Sasl {
            mechanism: mechanism.to_string(),
            credentials,
        })
    }

    /// a bind with the given credentials
    fn bind(bind_dn: &str, credentials: BindCredentials) -> Self {
        OperationPayload::Bind(BindPayload {
            bind_dn: RequestField::new(bind_dn),
            credentials,
            user_entry: None,
            auth_failure_reason: None,
            server_sasl_credentials: None,
            password_policy_warning: None,
            password_policy_error: None,
            must_change_password: false,
            size_limit: None,
            time_limit: None,
            password_policy_control_requested: false,
            authorization_identity_requested: false,
        })
    }

    /// a delete
    pub fn delete(entry_dn: &str) -> Self {
        OperationPayload::Delete(DeletePayload {
            entry_dn: RequestField::new(entry_dn),
            entry_to_delete: None,
        })
    }

    /// a modify DN
    pub fn modify_dn(
        entry_dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Self {
        OperationPayload::ModifyDn(ModifyDnPayload {
            entry_dn: RequestField::new(entry_dn),
            new_rdn: RequestField::new(new_rdn),
            delete_old_rdn,
            new_superior: new_superior.map(RequestField::new),
            original_entry: None,
            updated_entry: None,
            modifications: Vec::new(),
        })
    }

    /// an add
    pub fn add(entry_dn: &str, attributes: HashMap<String, Vec<String>>) -> Self {
        OperationPayload::Add(AddPayload {
            entry_dn: RequestField::new(entry_dn),
            attributes,
            entry: None,
        })
    }

    /// a modify
    pub fn modify(entry_dn: &str, modifications: Vec<Mod<String>>) -> Self {
        OperationPayload::Modify(ModifyPayload {
            entry_dn: RequestField::new(entry_dn),
            modifications,
            current_entry: None,
            modified_entry: None,
        })
    }

    /// a compare
    pub fn compare(entry_dn: &str, attribute: &str, assertion_value: &str) -> Self {
        OperationPayload::Compare(ComparePayload {
            entry_dn: RequestField::new(entry_dn),
            attribute: attribute.to_string(),
            assertion_value: assertion_value.to_string(),
            entry: None,
        })
    }

    /// a search
    pub fn search(base_dn: &str, scope: Scope, filter: &str, attributes: Vec<String>) -> Self {
        OperationPayload::Search(SearchPayload {
            base_dn: RequestField::new(base_dn),
            scope,
            filter: RequestField::new(filter),
            attributes,
            size_limit: 0,
            types_only: false,
            entries_sent: 0,
        })
    }

    /// the operation type
    pub fn operation_type(&self) -> OperationType {
        match self {
            OperationPayload::Bind(_) => OperationType::Bind,
            OperationPayload::Delete(_) => OperationType::Delete,
            OperationPayload::ModifyDn(_) => OperationType::ModifyDn,
            OperationPayload::Add(_) => OperationType::Add,
            OperationPayload::Modify(_) => OperationType::Modify,
            OperationPayload::Compare(_) => OperationType::Compare,
            OperationPayload::Search(_) => OperationType::Search,
        }
    }

    /// the resolved DN the operation targets
    pub fn target_dn(&self) -> Option<&Dn> {
        match self {
            OperationPayload::Bind(p) => p.bind_dn.resolved(),
            OperationPayload::Delete(p) => p.entry_dn.resolved(),
            OperationPayload::ModifyDn(p) => p.entry_dn.resolved(),
            OperationPayload::Add(p) => p.entry_dn.resolved(),
            OperationPayload::Modify(p) => p.entry_dn.resolved(),
            OperationPayload::Compare(p) => p.entry_dn.resolved(),
            OperationPayload::Search(p) => p.base_dn.resolved(),
        }
    }

    /// the raw DN the operation targets
    pub fn raw_target_dn(&self) -> &str {
        match self {
            OperationPayload::Bind(p) => p.bind_dn.raw(),
            OperationPayload::Delete(p) => p.entry_dn.raw(),
            OperationPayload::ModifyDn(p) => p.entry_dn.raw(),
            OperationPayload::Add(p) => p.entry_dn.raw(),
            OperationPayload::Modify(p) => p.entry_dn.raw(),
            OperationPayload::Compare(p) => p.entry_dn.raw(),
            OperationPayload::Search(p) => p.base_dn.raw(),
        }
    }
}

/// the mutable state of a single request
#[derive(Debug)]
pub struct OperationRecord {
    /// the connection the request arrived on
    connection_id: u64,
    /// the server assigned operation id
    operation_id: u64,
    /// the client assigned message id
    message_id: i32,
    /// whether the server itself issued the operation
    internal: bool,
    /// whether the operation replays a change from a replica
    synchronization: bool,
    /// the request controls in request order
    request_controls: Vec<RawControl>,
    /// the response controls in the order they were added
    response_controls: Vec<ResponseControl>,
    /// the result code, `None` while undefined
    result_code: Option<ResultCode>,
    /// the diagnostic message
    error_message: String,
    /// the matched DN of a NO_SUCH_OBJECT result
    matched_dn: Option<Dn>,
    /// referral URLs
    referrals: Vec<String>,
    /// extra text for the access log only
    additional_log_message: String,
    /// when processing started
    start_time: Option<Instant>,
    /// when processing stopped
    stop_time: Option<Instant>,
    /// cancel request and result
    cancel_state: Arc<CancelState>,
    /// the identity the connection is authenticated as
    client_authorization_dn: Option<Dn>,
    /// the entry the operation is authorized as after proxied authorization
    authorization_entry: Option<Entry>,
    /// whether the no-op control asked to skip the mutation
    no_op: bool,
    /// the operation specific fields
    payload: OperationPayload,
}

impl OperationRecord {
    /// create a record for a request
    ///
    /// binds can not be canceled, all other operation types can
    pub fn new(
        connection_id: u64,
        operation_id: u64,
        message_id: i32,
        payload: OperationPayload,
    ) -> Self {
        let cancellable = payload.operation_type() != OperationType::Bind;
        Self {
            connection_id,
            operation_id,
            message_id,
            internal: false,
            synchronization: false,
            request_controls: Vec::new(),
            response_controls: Vec::new(),
            result_code: None,
            error_message: String::new(),
            matched_dn: None,
            referrals: Vec::new(),
            additional_log_message: String::new(),
            start_time: None,
            stop_time: None,
            cancel_state: Arc::new(CancelState::new(cancellable)),
            client_authorization_dn: None,
            authorization_entry: None,
            no_op: false,
            payload,
        }
    }

    /// attach request controls
    pub fn with_controls(mut self, controls: Vec<RawControl>) -> Self {
        self.request_controls = controls;
        self
    }

    /// mark the operation as issued by the server itself
    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// mark the operation as a replicated change
    pub fn with_synchronization(mut self, synchronization: bool) -> Self {
        self.synchronization = synchronization;
        self
    }

    /// the connection id
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// the operation id
    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    /// the message id
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// whether the server issued the operation
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// whether this is a replicated change
    pub fn is_synchronization(&self) -> bool {
        self.synchronization
    }

    /// the operation type
    pub fn operation_type(&self) -> OperationType {
        self.payload.operation_type()
    }

    /// the request controls
    pub fn request_controls(&self) -> &[RawControl] {
        &self.request_controls
    }

    /// the response controls
    pub fn response_controls(&self) -> &[ResponseControl] {
        &self.response_controls
    }

    /// append a response control
    pub fn add_response_control(&mut self, control: ResponseControl) {
        self.response_controls.push(control);
    }

    /// the result code, `None` while undefined
    pub fn result_code(&self) -> Option<ResultCode> {
        self.result_code
    }

    /// set the result code unless one was set before
    ///
    /// returns whether the code was taken
    pub fn set_result_code(&mut self, result_code: ResultCode) -> bool {
        if let Some(existing) = self.result_code {
            if existing != result_code {
                tracing::debug!(
                    "Operation {} on connection {} keeps result {} instead of {}",
                    self.operation_id,
                    self.connection_id,
                    existing,
                    result_code
                );
            }
            return false;
        }
        self.result_code = Some(result_code);
        true
    }

    /// the diagnostic message
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// append to the diagnostic message
    pub fn append_error_message(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if message.is_empty() {
            return;
        }
        if !self.error_message.is_empty() {
            self.error_message.push_str("  ");
        }
        self.error_message.push_str(message);
    }

    /// the matched DN
    pub fn matched_dn(&self) -> Option<&Dn> {
        self.matched_dn.as_ref()
    }

    /// set the matched DN
    pub fn set_matched_dn(&mut self, matched_dn: Option<Dn>) {
        self.matched_dn = matched_dn;
    }

    /// the referral URLs
    pub fn referrals(&self) -> &[String] {
        &self.referrals
    }

    /// copy result code, message, matched DN and referrals of an error
    pub fn set_response_data(&mut self, error: &DirectoryError) {
        self.set_result_code(error.result_code);
        self.append_error_message(&error.message);
        if error.matched_dn.is_some() {
            self.matched_dn = error.matched_dn.clone();
        }
        self.referrals.extend(error.referrals.iter().cloned());
    }

    /// extra text for the access log
    pub fn additional_log_message(&self) -> &str {
        &self.additional_log_message
    }

    /// append extra text for the access log
    pub fn append_additional_log_message(&mut self, message: impl AsRef<str>) {
        if !self.additional_log_message.is_empty() {
            self.additional_log_message.push_str("  ");
        }
        self.additional_log_message.push_str(message.as_ref());
    }

    /// record the start of processing
    pub fn start_timer(&mut self) {
        self.start_time = Some(Instant::now());
        self.stop_time = None;
    }

    /// record the end of processing
    pub fn stop_timer(&mut self) {
        self.stop_time = Some(Instant::now());
    }

    /// the time between start and stop
    pub fn processing_time(&self) -> Option<Duration> {
        Some(self.stop_time?.saturating_duration_since(self.start_time?))
    }

    /// the shared cancel state
    pub fn cancel_state(&self) -> &Arc<CancelState> {
        &self.cancel_state
    }

    /// a handle other tasks can use to cancel this operation
    pub fn cancel_handle(&self, poll_interval: Duration, wait_bound: Duration) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.cancel_state), poll_interval, wait_bound)
    }

    /// whether a cancel request is pending
    pub fn check_for_cancellation(&self) -> bool {
        self.cancel_state.check_for_cancellation()
    }

    /// the DN the connection is authenticated as
    pub fn client_authorization_dn(&self) -> Option<&Dn> {
        self.client_authorization_dn.as_ref()
    }

    /// set the DN the connection is authenticated as
    pub fn set_client_authorization_dn(&mut self, dn: Option<Dn>) {
        self.client_authorization_dn = dn;
    }

    /// the entry the operation is authorized as after proxied authorization
    pub fn authorization_entry(&self) -> Option<&Entry> {
        self.authorization_entry.as_ref()
    }

    /// set the entry the operation is authorized as
    pub fn set_authorization_entry(&mut self, entry: Option<Entry>) {
        self.authorization_entry = entry;
    }

    /// the DN access control evaluates the operation as
    pub fn authorization_dn(&self) -> Option<&Dn> {
        match &self.authorization_entry {
            Some(entry) => Some(entry.dn()),
            None => self.client_authorization_dn.as_ref(),
        }
    }

    /// whether the no-op control was requested
    pub fn is_no_op(&self) -> bool {
        self.no_op
    }

    /// record that the no-op control was requested
    pub fn set_no_op(&mut self, no_op: bool) {
        self.no_op = no_op;
    }

    /// the operation specific fields
    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    /// the operation specific fields, mutable
    pub fn payload_mut(&mut self) -> &mut OperationPayload {
        &mut self.payload
    }

    /// the bind fields
    pub fn bind(&self) -> Option<&BindPayload> {
        match &self.payload {
            OperationPayload::Bind(p) => Some(p),
            _ => None,
        }
    }

    /// the bind fields, mutable
    pub fn bind_mut(&mut self) -> Option<&mut BindPayload> {
        match &mut self.payload {
            OperationPayload::Bind(p) => Some(p),
            _ => None,
        }
    }

    /// the delete fields
    pub fn delete(&self) -> Option<&DeletePayload> {
        match &self.payload {
            OperationPayload::Delete(p) => Some(p),
            _ => None,
        }
    }

    /// the delete fields, mutable
    pub fn delete_mut(&mut self) -> Option<&mut DeletePayload> {
        match &mut self.payload {
            OperationPayload::Delete(p) => Some(p),
            _ => None,
        }
    }

    /// the modify DN fields
    pub fn modify_dn(&self) -> Option<&ModifyDnPayload> {
        match &self.payload {
            OperationPayload::ModifyDn(p) => Some(p),
            _ => None,
        }
    }

    /// the modify DN fields, mutable
    pub fn modify_dn_mut(&mut self) -> Option<&mut ModifyDnPayload> {
        match &mut self.payload {
            OperationPayload::ModifyDn(p) => Some(p),
            _ => None,
        }
    }

    /// the add fields
    pub fn add(&self) -> Option<&AddPayload> {
        match &self.payload {
            OperationPayload::Add(p) => Some(p),
            _ => None,
        }
    }

    /// the add fields, mutable
    pub fn add_mut(&mut self) -> Option<&mut AddPayload> {
        match &mut self.payload {
            OperationPayload::Add(p) => Some(p),
            _ => None,
        }
    }

    /// the modify fields
    pub fn modify(&self) -> Option<&ModifyPayload> {
        match &self.payload {
            OperationPayload::Modify(p) => Some(p),
            _ => None,
        }
    }

    /// the modify fields, mutable
    pub fn modify_mut(&mut self) -> Option<&mut ModifyPayload> {
        match &mut self.payload {
            OperationPayload::Modify(p) => Some(p),
            _ => None,
        }
    }

    /// the compare fields
    pub fn compare(&self) -> Option<&ComparePayload> {
        match &self.payload {
            OperationPayload::Compare(p) => Some(p),
            _ => None,
        }
    }

    /// the compare fields, mutable
    pub fn compare_mut(&mut self) -> Option<&mut ComparePayload> {
        match &mut self.payload {
            OperationPayload::Compare(p) => Some(p),
            _ => None,
        }
    }

    /// the search fields
    pub fn search(&self) -> Option<&SearchPayload> {
        match &self.payload {
            OperationPayload::Search(p) => Some(p),
            _ => None,
        }
    }

    /// the search fields, mutable
    pub fn search_mut(&mut self) -> Option<&mut SearchPayload> {
        match &mut self.payload {
            OperationPayload::Search(p) => Some(p),
            _ => None,
        }
    }
}
