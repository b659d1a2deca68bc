//! password policy state of a single user entry
//!
//! the state works on a copy of the user entry. Every change (failure
//! times, lockout, grace logins, warned time, last login) is applied to that
//! copy only; [PasswordPolicyState::modifications] computes the attribute
//! level changes against the original entry once bind processing is done,
//! so they can be written back in a single step.

use super::{
    AccountStatusNotification, AccountStatusNotificationType, PasswordPolicy, ACCOUNT_DISABLED,
    ACCOUNT_EXPIRATION_TIME, CREATE_TIMESTAMP, LAST_LOGIN_TIME, PWD_ACCOUNT_LOCKED_TIME,
    PWD_CHANGED_TIME, PWD_FAILURE_TIME, PWD_GRACE_USE_TIME, PWD_RESET, WARNED_TIME,
};
use crate::entry::Entry;
use crate::password_storage::password_matches;
use crate::time::{format_generalized_time, parse_generalized_time};
use chrono::{DateTime, Duration, Utc};
use diff::Diff;
use ldap3::Mod;
use std::collections::HashSet;
use std::sync::Arc;

/// upper bound for configured intervals, about a thousand years
const MAX_INTERVAL_SECONDS: i64 = 1000 * 366 * 24 * 60 * 60;

/// convert a number of seconds from the configuration into a duration
fn seconds(value: u64) -> Duration {
    Duration::seconds(
        i64::try_from(value)
            .unwrap_or(MAX_INTERVAL_SECONDS)
            .min(MAX_INTERVAL_SECONDS),
    )
}

/// the expiration related state of the password
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationStatus {
    /// when the password expires (or expired), `None` if it never does
    pub expiration_time: Option<DateTime<Utc>>,
    /// whether the password has expired
    pub expired: bool,
    /// whether the user should be warned about the upcoming expiration
    pub should_warn: bool,
    /// whether this would be the first warning
    pub first_warning: bool,
    /// whether grace logins may be used once the password expired
    pub may_use_grace_login: bool,
}

impl ExpirationStatus {
    /// status of a password that never expires
    fn never() -> Self {
        Self {
            expiration_time: None,
            expired: false,
            should_warn: false,
            first_warning: false,
            may_use_grace_login: true,
        }
    }
}

/// password policy state of a user entry during bind
#[derive(Debug)]
pub struct PasswordPolicyState {
    /// the policy governing the entry
    policy: Arc<PasswordPolicy>,
    /// the entry as fetched from the backend
    original: Entry,
    /// the entry with all state changes applied
    entry: Entry,
    /// the time the evaluation is based on
    now: DateTime<Utc>,
    /// notifications generated so far
    notifications: Vec<AccountStatusNotification>,
}

impl PasswordPolicyState {
    /// create the state for a user entry
    pub fn new(policy: Arc<PasswordPolicy>, entry: Entry, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            original: entry.clone(),
            entry,
            now,
            notifications: Vec::new(),
        }
    }

    /// the policy governing the entry
    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// the entry with all state changes applied so far
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// the time the evaluation is based on
    pub fn current_time(&self) -> DateTime<Utc> {
        self.now
    }

    /// parse all values of a time attribute, dropping malformed ones
    fn time_values(&self, attribute: &str) -> Vec<DateTime<Utc>> {
        self.entry
            .get(attribute)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| {
                        let parsed = parse_generalized_time(v);
                        if parsed.is_none() {
                            tracing::warn!(
                                "Ignoring malformed {} value {} in entry {}",
                                attribute,
                                v,
                                self.entry.dn()
                            );
                        }
                        parsed
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// the first parsable value of a time attribute
    fn time_value(&self, attribute: &str) -> Option<DateTime<Utc>> {
        self.time_values(attribute).into_iter().next()
    }

    /// whether a boolean attribute is `true`
    fn boolean_value(&self, attribute: &str) -> bool {
        self.entry
            .first_value(attribute)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// add a time value that is unique among the existing values
    fn add_unique_time(&mut self, attribute: &str) -> DateTime<Utc> {
        let existing = self.time_values(attribute);
        let mut time = self.now;
        if let Some(highest) = existing.iter().max() {
            if *highest >= time {
                time = *highest + Duration::milliseconds(1);
            }
        }
        self.entry
            .add_value(attribute, format_generalized_time(&time));
        time
    }

    /// set a time attribute to a single value
    fn set_time(&mut self, attribute: &str, time: DateTime<Utc>) {
        self.entry
            .replace(attribute, vec![format_generalized_time(&time)]);
    }

    /// whether the account was disabled by an administrator
    pub fn is_disabled(&self) -> bool {
        self.boolean_value(ACCOUNT_DISABLED)
    }

    /// whether the account expiration time has passed
    pub fn is_account_expired(&self) -> bool {
        self.time_value(ACCOUNT_EXPIRATION_TIME)
            .is_some_and(|expiration| expiration <= self.now)
    }

    /// the time the password was last changed, falling back to the entry
    /// creation time
    pub fn password_changed_time(&self) -> Option<DateTime<Utc>> {
        self.time_value(PWD_CHANGED_TIME)
            .or_else(|| self.time_value(CREATE_TIMESTAMP))
    }

    /// the recorded authentication failures that have not expired yet
    ///
    /// expired failure times are removed from the entry
    pub fn auth_failure_times(&mut self) -> Vec<DateTime<Utc>> {
        let times = self.time_values(PWD_FAILURE_TIME);
        if self.policy.lockout_failure_expiration_interval == 0 {
            return times;
        }
        let cutoff = self.now - seconds(self.policy.lockout_failure_expiration_interval);
        let (current, expired): (Vec<_>, Vec<_>) = times.into_iter().partition(|t| *t > cutoff);
        if !expired.is_empty() {
            tracing::debug!(
                "Removing {} expired authentication failure times from {}",
                expired.len(),
                self.entry.dn()
            );
            self.entry.replace(
                PWD_FAILURE_TIME,
                current.iter().map(format_generalized_time).collect(),
            );
        }
        current
    }

    /// record a failed authentication attempt
    ///
    /// locks the account once the number of failures reaches the lockout
    /// failure count; returns whether the account is locked now
    pub fn record_auth_failure(&mut self) -> bool {
        if self.policy.lockout_failure_count == 0 {
            return false;
        }
        let failures = self.auth_failure_times().len() + 1;
        let failure_time = self.add_unique_time(PWD_FAILURE_TIME);
        if failures >= self.policy.lockout_failure_count as usize {
            tracing::debug!(
                "Locking {} after {} authentication failures",
                self.entry.dn(),
                failures
            );
            self.set_time(PWD_ACCOUNT_LOCKED_TIME, failure_time);
            return true;
        }
        false
    }

    /// forget all failures and any failure lockout
    pub fn clear_failure_lockout(&mut self) {
        self.entry.remove_attribute(PWD_FAILURE_TIME);
        self.entry.remove_attribute(PWD_ACCOUNT_LOCKED_TIME);
    }

    /// whether the account is locked due to authentication failures
    ///
    /// an expired lockout is cleared, enough failures without a lock time
    /// lock the account now
    pub fn locked_due_to_failures(&mut self) -> bool {
        if self.policy.lockout_failure_count == 0 {
            return false;
        }
        let locked_time = match self.time_value(PWD_ACCOUNT_LOCKED_TIME) {
            Some(locked_time) => locked_time,
            None => {
                if self.auth_failure_times().len() < self.policy.lockout_failure_count as usize {
                    return false;
                }
                self.set_time(PWD_ACCOUNT_LOCKED_TIME, self.now);
                self.now
            }
        };
        if self.policy.lockout_duration > 0
            && locked_time + seconds(self.policy.lockout_duration) <= self.now
        {
            tracing::debug!("The failure lockout of {} has expired", self.entry.dn());
            self.clear_failure_lockout();
            return false;
        }
        true
    }

    /// seconds until a failure lockout ends, `None` if it is permanent or
    /// the account is not locked
    pub fn seconds_until_unlock(&self) -> Option<i64> {
        if self.policy.lockout_duration == 0 {
            return None;
        }
        let locked_time = self.time_value(PWD_ACCOUNT_LOCKED_TIME)?;
        let unlock = locked_time + seconds(self.policy.lockout_duration);
        (unlock > self.now).then(|| (unlock - self.now).num_seconds())
    }

    /// whether the password was reset and has to be changed
    pub fn must_change_password(&self) -> bool {
        self.policy.force_change_on_reset && self.boolean_value(PWD_RESET)
    }

    /// whether a reset password was not changed within the maximum reset age
    pub fn locked_due_to_reset_age(&self) -> bool {
        if self.policy.max_password_reset_age == 0 || !self.must_change_password() {
            return false;
        }
        self.password_changed_time().is_some_and(|changed| {
            changed + seconds(self.policy.max_password_reset_age) < self.now
        })
    }

    /// the time of the last successful bind
    pub fn last_login_time(&self) -> Option<DateTime<Utc>> {
        self.time_value(LAST_LOGIN_TIME)
    }

    /// whether the account was idle for longer than the idle lockout interval
    ///
    /// an account is not idle if either the last login or the last password
    /// change happened within the interval
    pub fn locked_due_to_idle(&self) -> bool {
        if self.policy.idle_lockout_interval == 0 {
            return false;
        }
        let lock_time = self.now - seconds(self.policy.idle_lockout_interval);
        let recent = |time: Option<DateTime<Utc>>| time.is_some_and(|t| t > lock_time);
        !(recent(self.last_login_time()) || recent(self.password_changed_time()))
    }

    /// the time the user was first warned about the upcoming expiration
    pub fn warned_time(&self) -> Option<DateTime<Utc>> {
        self.time_value(WARNED_TIME)
    }

    /// record that the user was warned about the upcoming expiration
    pub fn set_warned_time(&mut self) {
        if self.warned_time().is_none() {
            self.set_time(WARNED_TIME, self.now);
        }
    }

    /// evaluate the expiration state of the password
    pub fn expiration_status(&self) -> ExpirationStatus {
        let Some(changed) = self.password_changed_time() else {
            return ExpirationStatus::never();
        };
        let mut expiration: Option<DateTime<Utc>> = None;
        let mut check_warning = false;
        if self.policy.max_password_age > 0 {
            expiration = Some(changed + seconds(self.policy.max_password_age));
            check_warning = true;
        }
        if self.must_change_password() && self.policy.max_password_reset_age > 0 {
            let reset_expiration = changed + seconds(self.policy.max_password_reset_age);
            if expiration.map_or(true, |e| reset_expiration < e) {
                expiration = Some(reset_expiration);
                check_warning = false;
            }
        }
        let Some(expiration) = expiration else {
            return ExpirationStatus::never();
        };
        if !check_warning {
            return ExpirationStatus {
                expiration_time: Some(expiration),
                expired: expiration < self.now,
                should_warn: false,
                first_warning: false,
                may_use_grace_login: false,
            };
        }
        let warning_interval = seconds(self.policy.password_expiration_warning_interval);
        if self.policy.password_expiration_warning_interval == 0 {
            return ExpirationStatus {
                expiration_time: Some(expiration),
                expired: self.now > expiration,
                should_warn: false,
                first_warning: false,
                may_use_grace_login: true,
            };
        }
        let quiet = ExpirationStatus {
            expiration_time: Some(expiration),
            expired: false,
            should_warn: false,
            first_warning: false,
            may_use_grace_login: true,
        };
        if expiration - warning_interval > self.now {
            return quiet;
        }
        let warned = self.warned_time();
        let without_warning = self.policy.expire_passwords_without_warning;
        if expiration > self.now {
            let expiration_time = match (without_warning, warned) {
                (true, _) => expiration,
                (false, None) => self.now + warning_interval,
                (false, Some(warned)) => warned + warning_interval,
            };
            return ExpirationStatus {
                expiration_time: Some(expiration_time),
                should_warn: true,
                first_warning: warned.is_none(),
                ..quiet
            };
        }
        if without_warning {
            return ExpirationStatus {
                expired: true,
                ..quiet
            };
        }
        match warned {
            Some(warned) => {
                let expiration_time = warned + warning_interval;
                if expiration_time > self.now {
                    ExpirationStatus {
                        expiration_time: Some(expiration_time),
                        should_warn: true,
                        ..quiet
                    }
                } else {
                    ExpirationStatus {
                        expiration_time: Some(expiration_time),
                        expired: true,
                        ..quiet
                    }
                }
            }
            None => ExpirationStatus {
                expiration_time: Some(self.now + warning_interval),
                should_warn: true,
                first_warning: true,
                ..quiet
            },
        }
    }

    /// seconds until the password expires, 0 if it already did
    pub fn seconds_until_expiration(&self) -> Option<i64> {
        self.expiration_status()
            .expiration_time
            .map(|e| (e - self.now).num_seconds().max(0))
    }

    /// the number of grace logins already used
    pub fn grace_logins_used(&self) -> usize {
        self.time_values(PWD_GRACE_USE_TIME).len()
    }

    /// the number of grace logins left
    pub fn grace_logins_remaining(&self) -> usize {
        (self.policy.grace_login_count as usize).saturating_sub(self.grace_logins_used())
    }

    /// record the use of a grace login
    pub fn record_grace_login(&mut self) {
        self.add_unique_time(PWD_GRACE_USE_TIME);
    }

    /// record a successful bind
    pub fn record_login(&mut self) {
        self.set_time(LAST_LOGIN_TIME, self.now);
    }

    /// whether the entry has a value for the password attribute
    pub fn has_password(&self) -> bool {
        self.entry.has_attribute(&self.policy.password_attribute)
    }

    /// whether the clear text password matches any stored password
    ///
    /// stored values that cannot be checked are logged and skipped
    pub fn password_matches(&self, clear: &str) -> bool {
        let Some(stored) = self.entry.get(&self.policy.password_attribute) else {
            return false;
        };
        stored.iter().any(|value| match password_matches(clear, value) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!(
                    "Cannot check a stored password of {}: {}",
                    self.entry.dn(),
                    e
                );
                false
            }
        })
    }

    /// queue an account status notification
    pub fn add_notification(
        &mut self,
        notification_type: AccountStatusNotificationType,
        message: impl Into<String>,
    ) {
        self.notifications.push(AccountStatusNotification {
            notification_type,
            user_dn: self.entry.dn().clone(),
            policy_name: self.policy.name.clone(),
            message: message.into(),
        });
    }

    /// the queued notifications, leaving the queue empty
    pub fn take_notifications(&mut self) -> Vec<AccountStatusNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// the changes to write back to the user entry
    ///
    /// attributes whose values changed are replaced as a whole, attributes
    /// that disappeared are deleted
    pub fn modifications(&self) -> Vec<Mod<String>> {
        let diff = self.original.attributes().diff(self.entry.attributes());
        let mut modifications: Vec<Mod<String>> = Vec::new();
        for attr_name in diff.altered.keys() {
            let values: HashSet<String> = self
                .entry
                .get(attr_name)
                .map(|v| v.iter().cloned().collect())
                .unwrap_or_default();
            modifications.push(Mod::Replace(attr_name.to_owned(), values));
        }
        for attr_name in &diff.removed {
            modifications.push(Mod::Delete(attr_name.to_owned(), HashSet::new()));
        }
        modifications.sort_by(|a, b| {
            crate::modification::modification_attribute(a)
                .cmp(crate::modification::modification_attribute(b))
        });
        modifications
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dn::Dn;
    use crate::password_policy::PasswordPolicyBuilder;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn entry() -> Entry {
        Entry::new(Dn::parse("uid=alice,dc=example").unwrap())
            .with_attribute("userPassword", ["{CLEAR}secret"])
            .with_attribute(
                PWD_CHANGED_TIME,
                [format_generalized_time(&(now() - Duration::days(10)))],
            )
    }

    fn state(policy: PasswordPolicy, entry: Entry) -> PasswordPolicyState {
        PasswordPolicyState::new(Arc::new(policy), entry, now())
    }

    #[test]
    fn failures_lock_at_count() {
        let policy = PasswordPolicyBuilder::default()
            .lockout_failure_count(3)
            .build()
            .unwrap();
        let mut state = state(policy, entry());
        assert!(!state.record_auth_failure());
        assert!(!state.record_auth_failure());
        assert!(state.record_auth_failure());
        assert!(state.locked_due_to_failures());
        assert_eq!(state.seconds_until_unlock(), None);
        assert_eq!(state.auth_failure_times().len(), 3);
    }

    #[test]
    fn lockout_expires_after_duration() {
        let policy = PasswordPolicyBuilder::default()
            .lockout_failure_count(1)
            .lockout_duration(60)
            .build()
            .unwrap();
        let locked = entry().with_attribute(
            PWD_ACCOUNT_LOCKED_TIME,
            [format_generalized_time(&(now() - Duration::seconds(30)))],
        );
        let mut still_locked = state(policy.clone(), locked.clone());
        assert!(still_locked.locked_due_to_failures());
        assert_eq!(still_locked.seconds_until_unlock(), Some(30));
        let mut expired = PasswordPolicyState::new(
            Arc::new(policy),
            locked,
            now() + Duration::seconds(31),
        );
        assert!(!expired.locked_due_to_failures());
        assert!(expired
            .modifications()
            .contains(&Mod::Delete(PWD_ACCOUNT_LOCKED_TIME.to_string(), HashSet::new())));
    }

    #[test]
    fn old_failures_are_pruned() {
        let policy = PasswordPolicyBuilder::default()
            .lockout_failure_count(2)
            .lockout_failure_expiration_interval(60)
            .build()
            .unwrap();
        let e = entry().with_attribute(
            PWD_FAILURE_TIME,
            [format_generalized_time(&(now() - Duration::seconds(120)))],
        );
        let mut state = state(policy, e);
        assert!(!state.record_auth_failure());
        assert_eq!(state.auth_failure_times().len(), 1);
    }

    #[test]
    fn idle_lockout() {
        let policy = PasswordPolicyBuilder::default()
            .idle_lockout_interval(24 * 60 * 60)
            .build()
            .unwrap();
        assert!(state(policy.clone(), entry()).locked_due_to_idle());
        let recent = entry().with_attribute(
            LAST_LOGIN_TIME,
            [format_generalized_time(&(now() - Duration::hours(1)))],
        );
        assert!(!state(policy, recent).locked_due_to_idle());
    }

    #[test]
    fn expiration_requires_warning_first() {
        let policy = PasswordPolicyBuilder::default()
            .max_password_age(5 * 24 * 60 * 60)
            .password_expiration_warning_interval(24 * 60 * 60)
            .build()
            .unwrap();
        let status = state(policy.clone(), entry()).expiration_status();
        assert!(!status.expired);
        assert!(status.should_warn);
        assert!(status.first_warning);
        let warned = entry().with_attribute(
            WARNED_TIME,
            [format_generalized_time(&(now() - Duration::days(2)))],
        );
        let status = state(policy, warned).expiration_status();
        assert!(status.expired);
        assert!(status.may_use_grace_login);
    }

    #[test]
    fn expiration_without_warning() {
        let policy = PasswordPolicyBuilder::default()
            .max_password_age(5 * 24 * 60 * 60)
            .expire_passwords_without_warning(true)
            .build()
            .unwrap();
        assert!(state(policy, entry()).expiration_status().expired);
    }

    #[test]
    fn warning_window() {
        let policy = PasswordPolicyBuilder::default()
            .max_password_age(11 * 24 * 60 * 60)
            .password_expiration_warning_interval(2 * 24 * 60 * 60)
            .build()
            .unwrap();
        let state = state(policy, entry());
        let status = state.expiration_status();
        assert!(status.should_warn);
        assert!(!status.expired);
        assert_eq!(state.seconds_until_expiration(), Some(2 * 24 * 60 * 60));
    }

    #[test]
    fn reset_age_lock() {
        let policy = PasswordPolicyBuilder::default()
            .force_change_on_reset(true)
            .max_password_reset_age(24 * 60 * 60)
            .build()
            .unwrap();
        let reset = entry().with_attribute(PWD_RESET, ["TRUE"]);
        let state = state(policy, reset);
        assert!(state.must_change_password());
        assert!(state.locked_due_to_reset_age());
    }

    #[test]
    fn grace_logins_are_unique() {
        let policy = PasswordPolicyBuilder::default()
            .grace_login_count(3)
            .build()
            .unwrap();
        let mut state = state(policy, entry());
        state.record_grace_login();
        state.record_grace_login();
        assert_eq!(state.grace_logins_used(), 2);
        assert_eq!(state.grace_logins_remaining(), 1);
    }

    #[test]
    fn modifications_cover_changes() {
        let policy = PasswordPolicyBuilder::default()
            .lockout_failure_count(5)
            .build()
            .unwrap();
        let mut state = state(policy, entry());
        assert!(state.modifications().is_empty());
        state.record_auth_failure();
        state.record_login();
        let modifications = state.modifications();
        assert_eq!(modifications.len(), 2);
        assert!(modifications
            .iter()
            .all(|m| matches!(m, Mod::Replace(_, values) if values.len() == 1)));
    }

    #[test]
    fn password_check() {
        let state = state(PasswordPolicy::default(), entry());
        assert!(state.has_password());
        assert!(state.password_matches("secret"));
        assert!(!state.password_matches("wrong"));
    }
}
