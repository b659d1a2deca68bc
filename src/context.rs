//! everything the pipeline needs from the rest of the server

use crate::access::{AccessControlHandler, AllowAllAccessControl};
use crate::backend::BackendRegistry;
use crate::config::{ServerConfig, TomlConfigError};
use crate::lock::EntryLockManager;
use crate::notification::NotificationRegistry;
use crate::password_policy::{
    AccountStatusNotification, AccountStatusNotificationHandler, PasswordPolicyRegistry,
};
use crate::plugin::PluginRegistry;
use crate::sasl::SaslRegistry;
use crate::schema::{BasicSchema, SchemaChecker};
use crate::synchronization::SynchronizationProvider;
use crate::time::{Clock, SystemClock};
use derive_builder::Builder;
use std::sync::Arc;
use thiserror::Error;

/// errors setting up a server context
#[derive(Debug, Error)]
pub enum ContextError {
    /// the configuration is invalid
    #[error("Configuration error: {0}")]
    TomlConfigError(#[from] TomlConfigError),
    /// the builder was missing a value
    #[error("Server context builder error: {0}")]
    ServerContextBuilderError(#[from] ServerContextBuilderError),
}

/// the collaborators shared by all operations of a server
#[derive(Debug, Builder)]
#[builder(pattern = "owned")]
pub struct ServerContext {
    /// server wide settings
    #[builder(default)]
    config: ServerConfig,
    /// the backends
    #[builder(default)]
    backends: BackendRegistry,
    /// the entry locks
    #[builder(default)]
    lock_manager: EntryLockManager,
    /// the plugins
    #[builder(default)]
    plugins: PluginRegistry,
    /// the access control decision gate
    #[builder(default = "Arc::new(AllowAllAccessControl) as Arc<dyn AccessControlHandler>")]
    access_control: Arc<dyn AccessControlHandler>,
    /// the synchronization providers in call order
    #[builder(default)]
    synchronization_providers: Vec<Arc<dyn SynchronizationProvider>>,
    /// the schema checks
    #[builder(default = "Arc::new(BasicSchema::standard()) as Arc<dyn SchemaChecker>")]
    schema: Arc<dyn SchemaChecker>,
    /// the password policies
    #[builder(default)]
    password_policies: PasswordPolicyRegistry,
    /// receivers of account status notifications
    #[builder(default)]
    account_status_handlers: Vec<Arc<dyn AccountStatusNotificationHandler>>,
    /// change listeners and persistent searches
    #[builder(default)]
    notifications: NotificationRegistry,
    /// the SASL mechanisms
    #[builder(default)]
    sasl_mechanisms: SaslRegistry,
    /// the source of the current time
    #[builder(default = "Arc::new(SystemClock) as Arc<dyn Clock>")]
    clock: Arc<dyn Clock>,
}

impl ServerContext {
    /// a context with lock manager and password policies set up from the
    /// configuration and default collaborators otherwise
    pub fn from_config(config: ServerConfig) -> Result<Self, ContextError> {
        Ok(Self::builder_from_config(config)?.build()?)
    }

    /// a builder with lock manager and password policies set up from the
    /// configuration
    pub fn builder_from_config(
        config: ServerConfig,
    ) -> Result<ServerContextBuilder, TomlConfigError> {
        config.validated_supported_controls()?;
        let password_policies =
            PasswordPolicyRegistry::new(config.default_password_policy.to_owned());
        for (dn, policy) in config.parsed_password_policies()? {
            password_policies.register(dn, policy);
        }
        let lock_manager =
            EntryLockManager::new(config.lock_attempts, config.lock_attempt_timeout());
        Ok(ServerContextBuilder::default()
            .lock_manager(lock_manager)
            .password_policies(password_policies)
            .config(config))
    }

    /// server wide settings
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// the backends
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// the entry locks
    pub fn lock_manager(&self) -> &EntryLockManager {
        &self.lock_manager
    }

    /// the plugins
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// the access control decision gate
    pub fn access_control(&self) -> &dyn AccessControlHandler {
        self.access_control.as_ref()
    }

    /// the synchronization providers
    pub fn synchronization_providers(&self) -> &[Arc<dyn SynchronizationProvider>] {
        &self.synchronization_providers
    }

    /// the schema checks
    pub fn schema(&self) -> &dyn SchemaChecker {
        self.schema.as_ref()
    }

    /// the password policies
    pub fn password_policies(&self) -> &PasswordPolicyRegistry {
        &self.password_policies
    }

    /// change listeners and persistent searches
    pub fn notifications(&self) -> &NotificationRegistry {
        &self.notifications
    }

    /// the SASL mechanisms
    pub fn sasl_mechanisms(&self) -> &SaslRegistry {
        &self.sasl_mechanisms
    }

    /// the source of the current time
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// pass an account status notification to every handler
    pub fn dispatch_account_status_notification(&self, notification: &AccountStatusNotification) {
        tracing::info!(
            "Account status notification {} for {} from policy {}: {}",
            notification.notification_type,
            notification.user_dn,
            notification.policy_name,
            notification.message
        );
        for handler in &self.account_status_handlers {
            handler.handle_status_notification(notification);
        }
    }
}
