//! the error type shared by all collaborators of the operation pipeline

use crate::dn::Dn;
use crate::result_code::ResultCode;
use thiserror::Error;

/// an error reported by a backend, access control handler, synchronization
/// provider or SASL mechanism
///
/// the pipeline copies all of it verbatim into the operation result
#[derive(Debug, Clone, Error)]
#[error("{result_code}: {message}")]
pub struct DirectoryError {
    /// the result code to report to the client
    pub result_code: ResultCode,
    /// the diagnostic message
    pub message: String,
    /// the longest existing ancestor of the target entry, if known
    pub matched_dn: Option<Dn>,
    /// referral URLs for the client to follow
    pub referrals: Vec<String>,
}

impl DirectoryError {
    /// create a new error with a result code and message
    pub fn new(result_code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            result_code,
            message: message.into(),
            matched_dn: None,
            referrals: Vec::new(),
        }
    }

    /// attach a matched DN
    pub fn with_matched_dn(mut self, matched_dn: Dn) -> Self {
        self.matched_dn = Some(matched_dn);
        self
    }

    /// attach referral URLs
    pub fn with_referrals(mut self, referrals: Vec<String>) -> Self {
        self.referrals = referrals;
        self
    }

    /// shorthand for a NO_SUCH_OBJECT error
    pub fn no_such_object(dn: &Dn) -> Self {
        Self::new(
            ResultCode::NoSuchObject,
            format!("The entry {} does not exist", dn),
        )
    }
}
