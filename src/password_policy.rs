//! password policies and the account status notifications they emit
//!
//! a [PasswordPolicy] holds the configured parameters; the per-entry
//! evaluation during bind lives in [state::PasswordPolicyState].

pub mod state;

use crate::dn::Dn;
use crate::entry::Entry;
use crate::password_storage::StorageScheme;
use derive_builder::Builder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, RwLock};

/// holds the time of each failed authentication attempt
pub const PWD_FAILURE_TIME: &str = "pwdFailureTime";
/// holds the time the account was locked due to failures
pub const PWD_ACCOUNT_LOCKED_TIME: &str = "pwdAccountLockedTime";
/// holds the time of each grace login
pub const PWD_GRACE_USE_TIME: &str = "pwdGraceUseTime";
/// `TRUE` if the password was reset by an administrator
pub const PWD_RESET: &str = "pwdReset";
/// the time the password was last changed
pub const PWD_CHANGED_TIME: &str = "pwdChangedTime";
/// fallback for [PWD_CHANGED_TIME]
pub const CREATE_TIMESTAMP: &str = "createTimestamp";
/// the time of the last successful bind
pub const LAST_LOGIN_TIME: &str = "ds-pwp-last-login-time";
/// the time the user was first warned about the upcoming expiration
pub const WARNED_TIME: &str = "ds-pwp-warned-time";
/// `true` if the account was disabled by an administrator
pub const ACCOUNT_DISABLED: &str = "ds-pwp-account-disabled";
/// the time the account expires
pub const ACCOUNT_EXPIRATION_TIME: &str = "ds-pwp-account-expiration-time";
/// DN of the password policy governing the entry
pub const PASSWORD_POLICY_DN: &str = "ds-pwp-password-policy-dn";

/// configuration of a password policy
///
/// all intervals are in seconds, 0 disables the corresponding feature
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct PasswordPolicy {
    /// name used in log messages and notifications
    #[builder(setter(into))]
    pub name: String,
    /// the attribute holding the password
    #[builder(setter(into))]
    pub password_attribute: String,
    /// scheme used when the server stores passwords
    pub default_storage_scheme: StorageScheme,
    /// number of failed binds after which the account is locked
    pub lockout_failure_count: u32,
    /// how long a lockout lasts, 0 locks until an administrator unlocks
    pub lockout_duration: u64,
    /// failures older than this are forgotten
    pub lockout_failure_expiration_interval: u64,
    /// accounts not used for this long are locked
    pub idle_lockout_interval: u64,
    /// maximum age of a password
    pub max_password_age: u64,
    /// how long a reset password may be used before it has to be changed
    pub max_password_reset_age: u64,
    /// how long before expiration users get warned
    pub password_expiration_warning_interval: u64,
    /// whether passwords may expire before the user was warned at least once
    pub expire_passwords_without_warning: bool,
    /// number of binds allowed with an expired password
    pub grace_login_count: u32,
    /// whether binds have to use a secure transport or mechanism
    pub require_secure_authentication: bool,
    /// whether a password reset by an administrator has to be changed
    pub force_change_on_reset: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            name: "Default Password Policy".to_string(),
            password_attribute: "userPassword".to_string(),
            default_storage_scheme: StorageScheme::Ssha256,
            lockout_failure_count: 0,
            lockout_duration: 0,
            lockout_failure_expiration_interval: 0,
            idle_lockout_interval: 0,
            max_password_age: 0,
            max_password_reset_age: 0,
            password_expiration_warning_interval: 5 * 24 * 60 * 60,
            expire_passwords_without_warning: false,
            grace_login_count: 0,
            require_secure_authentication: false,
            force_change_on_reset: false,
        }
    }
}

/// the kinds of account status notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountStatusNotificationType {
    /// locked due to failures for a limited time
    AccountTemporarilyLocked,
    /// locked due to failures until an administrator unlocks it
    AccountPermanentlyLocked,
    /// locked because it was not used for too long
    AccountIdleLocked,
    /// locked because a reset password was not changed in time
    AccountResetLocked,
    /// the account expiration time has passed
    AccountExpired,
    /// the password has expired
    PasswordExpired,
    /// the password is about to expire
    PasswordExpiring,
}

impl Display for AccountStatusNotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccountStatusNotificationType::AccountTemporarilyLocked => "account-temporarily-locked",
            AccountStatusNotificationType::AccountPermanentlyLocked => "account-permanently-locked",
            AccountStatusNotificationType::AccountIdleLocked => "account-idle-locked",
            AccountStatusNotificationType::AccountResetLocked => "account-reset-locked",
            AccountStatusNotificationType::AccountExpired => "account-expired",
            AccountStatusNotificationType::PasswordExpired => "password-expired",
            AccountStatusNotificationType::PasswordExpiring => "password-expiring",
        };
        write!(f, "{}", name)
    }
}

/// a notification about a change in account status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatusNotification {
    /// what happened
    pub notification_type: AccountStatusNotificationType,
    /// the affected user
    pub user_dn: Dn,
    /// the name of the policy that triggered the notification
    pub policy_name: String,
    /// human readable description
    pub message: String,
}

/// receives account status notifications
///
/// handlers are called from the worker executing the bind and must do their
/// own synchronization
pub trait AccountStatusNotificationHandler: std::fmt::Debug + Send + Sync {
    /// handle a notification
    fn handle_status_notification(&self, notification: &AccountStatusNotification);
}

/// warnings of the password policy response control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyWarningType {
    /// value is the number of seconds until the password expires
    TimeBeforeExpiration,
    /// value is the number of grace logins left
    GraceLoginsRemaining,
}

/// errors of the password policy response control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyErrorType {
    /// the password has expired
    PasswordExpired,
    /// the account is locked
    AccountLocked,
    /// the password was reset and has to be changed first
    ChangeAfterReset,
}

/// the configured password policies
#[derive(Debug)]
pub struct PasswordPolicyRegistry {
    /// the policy for entries that do not name one
    default_policy: RwLock<Arc<PasswordPolicy>>,
    /// policies selectable via [PASSWORD_POLICY_DN]
    policies: RwLock<HashMap<Dn, Arc<PasswordPolicy>>>,
}

impl Default for PasswordPolicyRegistry {
    fn default() -> Self {
        Self::new(PasswordPolicy::default())
    }
}

impl PasswordPolicyRegistry {
    /// create a registry with only a default policy
    pub fn new(default_policy: PasswordPolicy) -> Self {
        Self {
            default_policy: RwLock::new(Arc::new(default_policy)),
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// register a named policy
    pub fn register(&self, dn: Dn, policy: PasswordPolicy) {
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dn, Arc::new(policy));
    }

    /// replace the default policy
    pub fn set_default(&self, policy: PasswordPolicy) {
        *self
            .default_policy
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);
    }

    /// the default policy
    pub fn default_policy(&self) -> Arc<PasswordPolicy> {
        Arc::clone(&self.default_policy.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// the policy governing an entry
    ///
    /// an entry naming an unknown or malformed policy DN falls back to the
    /// default policy
    pub fn policy_for(&self, entry: &Entry) -> Arc<PasswordPolicy> {
        let Some(policy_dn) = entry.first_value(PASSWORD_POLICY_DN) else {
            return self.default_policy();
        };
        match Dn::parse(policy_dn) {
            Ok(dn) => {
                let policies = self.policies.read().unwrap_or_else(|e| e.into_inner());
                if let Some(policy) = policies.get(&dn) {
                    return Arc::clone(policy);
                }
                tracing::warn!(
                    "Entry {} refers to unknown password policy {}, using the default policy",
                    entry.dn(),
                    dn
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Entry {} has a malformed password policy DN, using the default policy: {}",
                    entry.dn(),
                    e
                );
            }
        }
        self.default_policy()
    }
}
