//! the transport side of a client connection as seen by the pipeline

use crate::cancel::CancelRequest;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::operation::OperationRecord;

/// privileges a connection may hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// may use the proxied authorization controls
    ProxiedAuth,
    /// may bypass access control
    BypassAcl,
    /// may write while the server only accepts internal writes
    BypassLockdown,
}

/// why a connection is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// a plugin asked for the connection to be closed
    PluginTerminated,
    /// an unexpected server side failure
    ServerError,
    /// the client violated the protocol
    ProtocolError,
}

/// the identity a connection is authenticated as
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationInfo {
    /// the entry the client authenticated as, `None` for anonymous
    pub authentication_dn: Option<Dn>,
    /// the identity operations are authorized as
    pub authorization_dn: Option<Dn>,
    /// whether the identity is a root user
    pub is_root: bool,
    /// the SASL mechanism used, `None` for simple binds
    pub sasl_mechanism: Option<String>,
}

impl AuthenticationInfo {
    /// an anonymous identity
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// whether no identity is established
    pub fn is_anonymous(&self) -> bool {
        self.authentication_dn.is_none()
    }
}

/// the client connection an operation arrived on
///
/// connections are shared between the workers running the operations of one
/// client so all methods take `&self`
pub trait ClientConnection: std::fmt::Debug + Send + Sync {
    /// the connection id
    fn connection_id(&self) -> u64;

    /// whether the transport is encrypted
    fn is_secure(&self) -> bool;

    /// the current identity
    fn authentication_info(&self) -> AuthenticationInfo;

    /// replace the identity after a bind
    fn set_authentication_info(&self, info: AuthenticationInfo);

    /// whether the connection holds a privilege
    fn has_privilege(&self, privilege: Privilege) -> bool;

    /// the resource limits of the authenticated session
    fn set_resource_limits(&self, size_limit: Option<u32>, time_limit: Option<u32>);

    /// whether the user has to change the password before doing anything else
    fn set_must_change_password(&self, must_change: bool);

    /// mark a bind as running on this connection
    fn set_bind_in_progress(&self, in_progress: bool);

    /// send the final result of an operation
    fn send_response(&self, operation: &OperationRecord);

    /// send a search result entry, `false` stops the search
    fn send_search_entry(&self, operation: &OperationRecord, entry: &Entry) -> bool;

    /// close the connection
    fn disconnect(&self, reason: DisconnectReason, notify_client: bool, message: &str);

    /// cancel every operation on the connection except one
    fn cancel_all_operations_except(&self, request: &CancelRequest, except_message_id: i32);
}
