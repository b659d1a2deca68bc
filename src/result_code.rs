//! LDAP result codes as reported back to the client

use serde::Deserialize;
use std::fmt::Display;

/// a terminal LDAP result code
///
/// the numeric values are the ones from RFC 4511 plus the cancel (RFC 3909),
/// assertion (RFC 4528), proxied authorization (RFC 4370) and no-op extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// the operation completed successfully
    Success,
    /// an internal ordering or sequencing error
    OperationsError,
    /// the request violated the protocol
    ProtocolError,
    /// the time limit was exceeded
    TimeLimitExceeded,
    /// the size limit was exceeded
    SizeLimitExceeded,
    /// a compare operation evaluated to false
    CompareFalse,
    /// a compare operation evaluated to true
    CompareTrue,
    /// the requested authentication method is not supported
    AuthMethodNotSupported,
    /// the operation requires strong authentication
    StrongAuthRequired,
    /// the client needs to follow a referral
    Referral,
    /// an administrative limit was exceeded
    AdminLimitExceeded,
    /// a critical control was not recognized or not supported
    UnavailableCriticalExtension,
    /// confidentiality (e.g. TLS) is required
    ConfidentialityRequired,
    /// a multi-stage SASL bind needs another round trip
    SaslBindInProgress,
    /// the referenced attribute does not exist
    NoSuchAttribute,
    /// the attribute type is not defined
    UndefinedAttributeType,
    /// the matching rule is not appropriate for the attribute
    InappropriateMatching,
    /// a constraint on an attribute was violated
    ConstraintViolation,
    /// the attribute or value already exists
    AttributeOrValueExists,
    /// an attribute value has an invalid syntax
    InvalidAttributeSyntax,
    /// the target entry does not exist
    NoSuchObject,
    /// an alias problem occurred
    AliasProblem,
    /// a DN had invalid syntax
    InvalidDnSyntax,
    /// the provided credentials are not valid
    InvalidCredentials,
    /// the client lacks the rights to perform the operation
    InsufficientAccessRights,
    /// the server is too busy
    Busy,
    /// the server is unavailable
    Unavailable,
    /// the server is unwilling to perform the operation
    UnwillingToPerform,
    /// a naming rule was violated
    NamingViolation,
    /// an object class rule was violated
    ObjectclassViolation,
    /// the operation is not allowed on an entry with subordinates
    NotAllowedOnNonleaf,
    /// the operation would remove an RDN attribute value
    NotAllowedOnRdn,
    /// the entry already exists
    EntryAlreadyExists,
    /// the operation would affect multiple servers
    AffectsMultipleDsas,
    /// any other error
    Other,
    /// the operation was canceled
    Canceled,
    /// the operation to be canceled does not exist
    NoSuchOperation,
    /// it is too late to cancel the operation
    TooLate,
    /// the operation cannot be canceled
    CannotCancel,
    /// the assertion control did not match
    AssertionFailed,
    /// proxied authorization was denied
    AuthorizationDenied,
    /// success in the presence of the no-op control
    NoOperation,
}

impl ResultCode {
    /// the integer value sent on the wire
    pub fn code(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectclassViolation => 65,
            ResultCode::NotAllowedOnNonleaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other => 80,
            ResultCode::Canceled => 118,
            ResultCode::NoSuchOperation => 119,
            ResultCode::TooLate => 120,
            ResultCode::CannotCancel => 121,
            ResultCode::AssertionFailed => 122,
            ResultCode::AuthorizationDenied => 123,
            // see https://ldap.com/ldap-result-code-reference-other-server-side-result-codes/#rc-noOperation
            ResultCode::NoOperation => 16654,
        }
    }

    /// the result code for an integer value received from a collaborator
    pub fn from_code(code: u32) -> Option<ResultCode> {
        ALL_RESULT_CODES.iter().copied().find(|rc| rc.code() == code)
    }

    /// whether a client should consider the operation successful
    ///
    /// this is the server-side counterpart of `success_or_noop_success`
    /// in the client utilities
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultCode::Success
                | ResultCode::CompareFalse
                | ResultCode::CompareTrue
                | ResultCode::NoOperation
        )
    }
}

/// every result code, used for reverse lookups
const ALL_RESULT_CODES: [ResultCode; 42] = [
    ResultCode::Success,
    ResultCode::OperationsError,
    ResultCode::ProtocolError,
    ResultCode::TimeLimitExceeded,
    ResultCode::SizeLimitExceeded,
    ResultCode::CompareFalse,
    ResultCode::CompareTrue,
    ResultCode::AuthMethodNotSupported,
    ResultCode::StrongAuthRequired,
    ResultCode::Referral,
    ResultCode::AdminLimitExceeded,
    ResultCode::UnavailableCriticalExtension,
    ResultCode::ConfidentialityRequired,
    ResultCode::SaslBindInProgress,
    ResultCode::NoSuchAttribute,
    ResultCode::UndefinedAttributeType,
    ResultCode::InappropriateMatching,
    ResultCode::ConstraintViolation,
    ResultCode::AttributeOrValueExists,
    ResultCode::InvalidAttributeSyntax,
    ResultCode::NoSuchObject,
    ResultCode::AliasProblem,
    ResultCode::InvalidDnSyntax,
    ResultCode::InvalidCredentials,
    ResultCode::InsufficientAccessRights,
    ResultCode::Busy,
    ResultCode::Unavailable,
    ResultCode::UnwillingToPerform,
    ResultCode::NamingViolation,
    ResultCode::ObjectclassViolation,
    ResultCode::NotAllowedOnNonleaf,
    ResultCode::NotAllowedOnRdn,
    ResultCode::EntryAlreadyExists,
    ResultCode::AffectsMultipleDsas,
    ResultCode::Other,
    ResultCode::Canceled,
    ResultCode::NoSuchOperation,
    ResultCode::TooLate,
    ResultCode::CannotCancel,
    ResultCode::AssertionFailed,
    ResultCode::AuthorizationDenied,
    ResultCode::NoOperation,
];

impl Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
