//! server wide settings of the operation pipeline

use crate::backend::WritabilityMode;
use crate::cancel::{DEFAULT_CANCEL_POLL_INTERVAL, DEFAULT_CANCEL_WAIT_BOUND};
use crate::control::{validate_oid, OIDError};
use crate::dn::Dn;
use crate::lock::{DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_ATTEMPT_TIMEOUT};
use crate::password_policy::PasswordPolicy;
use crate::result_code::ResultCode;
use derive_builder::Builder;
use oid::ObjectIdentifier;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// maps an alternate bind DN to the root user it stands for
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlternateBindDn {
    /// the DN clients bind with
    pub alternate_dn: Dn,
    /// the root user entry
    pub root_dn: Dn,
}

/// server wide settings
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct ServerConfig {
    /// the result code for unexpected server side failures
    pub server_error_result_code: ResultCode,
    /// whether the server accepts writes
    pub writability_mode: WritabilityMode,
    /// whether a simple bind naming a DN needs a password
    pub bind_with_dn_requires_password: bool,
    /// whether updated entries are validated against the schema
    pub check_schema: bool,
    /// the root users
    pub root_dns: Vec<Dn>,
    /// alternate bind DNs of root users
    pub alternate_bind_dns: Vec<AlternateBindDn>,
    /// additional control OIDs the server accepts as critical
    pub supported_controls: Vec<String>,
    /// how often to try to get an entry lock
    pub lock_attempts: u32,
    /// how long each lock attempt waits, in milliseconds
    pub lock_attempt_timeout_ms: u64,
    /// how often a cancel request checks for a result, in milliseconds
    pub cancel_poll_interval_ms: u64,
    /// how long a cancel request waits for a result, in milliseconds
    pub cancel_wait_bound_ms: u64,
    /// the policy for entries not naming one
    pub default_password_policy: PasswordPolicy,
    /// named policies keyed by DN
    pub password_policies: HashMap<String, PasswordPolicy>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_error_result_code: ResultCode::Other,
            writability_mode: WritabilityMode::Enabled,
            bind_with_dn_requires_password: true,
            check_schema: true,
            root_dns: Vec::new(),
            alternate_bind_dns: Vec::new(),
            supported_controls: Vec::new(),
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_attempt_timeout_ms: DEFAULT_LOCK_ATTEMPT_TIMEOUT.as_millis() as u64,
            cancel_poll_interval_ms: DEFAULT_CANCEL_POLL_INTERVAL.as_millis() as u64,
            cancel_wait_bound_ms: DEFAULT_CANCEL_WAIT_BOUND.as_millis() as u64,
            default_password_policy: PasswordPolicy::default(),
            password_policies: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// how long each lock attempt waits
    pub fn lock_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_attempt_timeout_ms)
    }

    /// how often a cancel request checks for a result
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    /// how long a cancel request waits for a result
    pub fn cancel_wait_bound(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_bound_ms)
    }

    /// whether the DN is a root user
    pub fn is_root_dn(&self, dn: &Dn) -> bool {
        self.root_dns.iter().any(|root| root == dn)
    }

    /// the root user an alternate bind DN stands for
    pub fn actual_root_bind_dn(&self, dn: &Dn) -> Option<&Dn> {
        self.alternate_bind_dns
            .iter()
            .find(|alternate| alternate.alternate_dn == *dn)
            .map(|alternate| &alternate.root_dn)
    }

    /// whether the server accepts a control as critical
    pub fn supports_control(&self, oid: &str) -> bool {
        self.supported_controls.iter().any(|s| s == oid)
    }

    /// check the configured control OIDs
    pub fn validated_supported_controls(&self) -> Result<Vec<ObjectIdentifier>, OIDError> {
        self.supported_controls
            .iter()
            .map(|oid| validate_oid(oid))
            .collect()
    }

    /// the named password policies with parsed DNs
    pub fn parsed_password_policies(&self) -> Result<Vec<(Dn, PasswordPolicy)>, TomlConfigError> {
        self.password_policies
            .iter()
            .map(|(dn, policy)| {
                Dn::parse(dn)
                    .map(|dn| (dn, policy.to_owned()))
                    .map_err(TomlConfigError::from)
            })
            .collect()
    }
}

/// error which can happen while reading the server configuration from a file
#[derive(Debug, Error)]
pub enum TomlConfigError {
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error deserializing the TOML file
    #[error("Toml deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),
    /// a password policy key is not a DN
    #[error("Invalid password policy DN: {0}")]
    ChumskyError(#[from] ldap_types::basic::ChumskyError),
    /// a supported control is not an OID
    #[error("Invalid supported control: {0}")]
    OIDError(#[from] OIDError),
}

/// load the server configuration from a toml file
#[instrument]
pub fn toml_server_config(filename: std::path::PathBuf) -> Result<ServerConfig, TomlConfigError> {
    let config = std::fs::read_to_string(filename)?;
    let result: ServerConfig = toml::from_str(&config)?;
    result.validated_supported_controls()?;
    result.parsed_password_policies()?;

    Ok(result)
}
