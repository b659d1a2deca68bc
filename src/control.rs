//! request and response controls understood by the operation pipeline
//!
//! request controls arrive as [ldap3::controls::RawControl] values; the ones
//! the pipeline acts on are decoded into [RequestControl]. Control values are
//! expected in their string form (the BER layer is handled by the transport):
//! the assertion control carries the filter string, the read controls a
//! whitespace or comma separated attribute list, proxied authorization v1 a
//! DN and v2 an authorization identity (`dn:...` or `u:...`).

use crate::dn::Dn;
use crate::entry::Entry;
use crate::filter::SearchFilter;
use crate::password_policy::{PasswordPolicyErrorType, PasswordPolicyWarningType};
use lazy_static::lazy_static;
use ldap3::controls::RawControl;
use ldap_types::basic::ChumskyError;
use oid::ObjectIdentifier;
use regex::Regex;
use std::fmt::Display;
use thiserror::Error;

/// RFC 4528 assertion control
pub const ASSERTION_CONTROL_OID: &str = "1.3.6.1.1.12";
/// RFC 4527 pre-read control
pub const PRE_READ_CONTROL_OID: &str = "1.3.6.1.1.13.1";
/// RFC 4527 post-read control
pub const POST_READ_CONTROL_OID: &str = "1.3.6.1.1.13.2";
/// proxied authorization control, draft version 1
pub const PROXIED_AUTH_V1_CONTROL_OID: &str = "2.16.840.1.113730.3.4.12";
/// RFC 4370 proxied authorization control
pub const PROXIED_AUTH_V2_CONTROL_OID: &str = "2.16.840.1.113730.3.4.18";
/// the no-op control
pub const NOOP_CONTROL_OID: &str = "1.3.6.1.4.1.4203.1.10.2";
/// the experimental OID OpenLDAP uses for the no-op control
pub const NOOP_EXPERIMENTAL_CONTROL_OID: &str = "1.3.6.1.4.1.4203.666.5.2";
/// RFC 3829 authorization identity request control
pub const AUTHZ_ID_REQUEST_CONTROL_OID: &str = "2.16.840.1.113730.3.4.16";
/// RFC 3829 authorization identity response control
pub const AUTHZ_ID_RESPONSE_CONTROL_OID: &str = "2.16.840.1.113730.3.4.15";
/// password policy request and response control
pub const PASSWORD_POLICY_CONTROL_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
/// Netscape password expired response control
pub const PASSWORD_EXPIRED_CONTROL_OID: &str = "2.16.840.1.113730.3.4.4";
/// Netscape password expiring response control
pub const PASSWORD_EXPIRING_CONTROL_OID: &str = "2.16.840.1.113730.3.4.5";

lazy_static! {
    /// an RFC 4513 authorization identity
    static ref AUTHZ_ID_REGEX: Regex = Regex::new(r"^(?:(dn):(.*)|(u):(.+))$").unwrap();
}

/// creates a no-op control as a client would send it
///
/// the no-op control asks the server to perform all checks of an update
/// operation and report the result without changing the directory
pub fn noop_control() -> RawControl {
    RawControl {
        ctype: NOOP_EXPERIMENTAL_CONTROL_OID.to_string(),
        crit: true,
        val: None,
    }
}

/// an error type in case a control OID is not a valid OID
#[derive(Debug)]
pub struct OIDError(oid::ObjectIdentifierError);

impl Display for OIDError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error parsing OID: {:?}", self.0)
    }
}

impl std::error::Error for OIDError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// check that a string is a syntactically valid OID
pub fn validate_oid(oid: &str) -> Result<ObjectIdentifier, OIDError> {
    ObjectIdentifier::try_from(oid).map_err(OIDError)
}

/// errors decoding a request control
#[derive(Debug, Error)]
pub enum ControlError {
    /// the control type is not an OID
    #[error("OID error: {0}")]
    OIDError(#[from] OIDError),
    /// the value could not be parsed as a filter or DN
    #[error("chumsky parser error: {0}")]
    ChumskyError(#[from] ChumskyError),
    /// the control needs a value but has none
    #[error("The control {0} requires a value")]
    MissingValue(String),
    /// the value is not UTF-8
    #[error("The value of control {0} is not valid UTF-8")]
    InvalidUtf8(String),
    /// the authorization identity has an unknown form
    #[error("Invalid authorization identity {0}")]
    InvalidAuthzId(String),
}

/// the target identity of a proxied authorization v2 control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthzId {
    /// `dn:` with an empty DN
    Anonymous,
    /// `dn:<dn>`
    Dn(Dn),
    /// `u:<user name>`
    Username(String),
}

impl AuthzId {
    /// parse an authorization identity
    pub fn parse(src: &str) -> Result<Self, ControlError> {
        let captures = AUTHZ_ID_REGEX
            .captures(src)
            .ok_or_else(|| ControlError::InvalidAuthzId(src.to_string()))?;
        if let Some(dn) = captures.get(2).filter(|_| captures.get(1).is_some()) {
            if dn.as_str().trim().is_empty() {
                return Ok(AuthzId::Anonymous);
            }
            return Ok(AuthzId::Dn(Dn::parse(dn.as_str())?));
        }
        match captures.get(4) {
            Some(user) => Ok(AuthzId::Username(user.as_str().to_string())),
            None => Err(ControlError::InvalidAuthzId(src.to_string())),
        }
    }
}

/// a decoded request control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestControl {
    /// only perform the operation if the target entry matches the filter
    Assertion(SearchFilter),
    /// return the entry as it was before the operation
    PreRead(Vec<String>),
    /// return the entry as it is after the operation
    PostRead(Vec<String>),
    /// perform the operation as the entry with this DN
    ProxiedAuthV1(Dn),
    /// perform the operation as this authorization identity
    ProxiedAuthV2(AuthzId),
    /// validate but do not apply the operation
    NoOp,
    /// return the authorization identity after bind
    AuthorizationIdentity,
    /// return password policy information
    PasswordPolicy,
    /// a control the pipeline itself does not act on
    Unrecognized,
}

/// the value of a control as UTF-8 string
fn string_value(control: &RawControl) -> Result<String, ControlError> {
    let value = control
        .val
        .as_ref()
        .ok_or_else(|| ControlError::MissingValue(control.ctype.to_owned()))?;
    String::from_utf8(value.to_owned())
        .map_err(|_| ControlError::InvalidUtf8(control.ctype.to_owned()))
}

/// the attribute list of a read control, an absent value selects all user
/// attributes
fn attribute_list(control: &RawControl) -> Result<Vec<String>, ControlError> {
    if control.val.is_none() {
        return Ok(Vec::new());
    }
    Ok(string_value(control)?
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

impl RequestControl {
    /// decode a raw request control
    pub fn parse(control: &RawControl) -> Result<Self, ControlError> {
        validate_oid(&control.ctype)?;
        Ok(match control.ctype.as_str() {
            ASSERTION_CONTROL_OID => {
                RequestControl::Assertion(SearchFilter::parse(&string_value(control)?)?)
            }
            PRE_READ_CONTROL_OID => RequestControl::PreRead(attribute_list(control)?),
            POST_READ_CONTROL_OID => RequestControl::PostRead(attribute_list(control)?),
            PROXIED_AUTH_V1_CONTROL_OID => {
                RequestControl::ProxiedAuthV1(Dn::parse(string_value(control)?.trim())?)
            }
            PROXIED_AUTH_V2_CONTROL_OID => {
                let value = match &control.val {
                    Some(_) => string_value(control)?,
                    None => String::new(),
                };
                if value.is_empty() {
                    RequestControl::ProxiedAuthV2(AuthzId::Anonymous)
                } else {
                    RequestControl::ProxiedAuthV2(AuthzId::parse(value.trim())?)
                }
            }
            NOOP_CONTROL_OID | NOOP_EXPERIMENTAL_CONTROL_OID => RequestControl::NoOp,
            AUTHZ_ID_REQUEST_CONTROL_OID => RequestControl::AuthorizationIdentity,
            PASSWORD_POLICY_CONTROL_OID => RequestControl::PasswordPolicy,
            _ => RequestControl::Unrecognized,
        })
    }
}

/// a response control attached to an operation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseControl {
    /// the entry before the operation
    PreRead(Entry),
    /// the entry after the operation
    PostRead(Entry),
    /// the authorization identity, `dn:<dn>` or empty for anonymous
    AuthorizationIdentity(String),
    /// password policy warning and error
    PasswordPolicy {
        /// warning with its value
        warning: Option<(PasswordPolicyWarningType, i64)>,
        /// error
        error: Option<PasswordPolicyErrorType>,
    },
    /// the password has expired and must be changed
    PasswordExpired,
    /// the password expires in this many seconds
    PasswordExpiring(i64),
}

impl ResponseControl {
    /// the OID of this response control
    pub fn oid(&self) -> &'static str {
        match self {
            ResponseControl::PreRead(_) => PRE_READ_CONTROL_OID,
            ResponseControl::PostRead(_) => POST_READ_CONTROL_OID,
            ResponseControl::AuthorizationIdentity(_) => AUTHZ_ID_RESPONSE_CONTROL_OID,
            ResponseControl::PasswordPolicy { .. } => PASSWORD_POLICY_CONTROL_OID,
            ResponseControl::PasswordExpired => PASSWORD_EXPIRED_CONTROL_OID,
            ResponseControl::PasswordExpiring(_) => PASSWORD_EXPIRING_CONTROL_OID,
        }
    }
}
